//! Generates the tonic client and server for `proto/greeting.proto`.
//!
//! The messages are hand-written prost types in `src/lib.rs`, so only the
//! service plumbing is generated and no `protoc` is needed.

use tonic_build::manual::{Builder, Method, Service};

fn method(name: &str, route: &str) -> tonic_build::manual::MethodBuilder {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type("crate::proto::HelloRequest")
        .output_type("crate::proto::HelloResponse")
        .codec_path("tonic::codec::ProstCodec")
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let service = Service::builder()
        .name("GreetingService")
        .package("myapp")
        .method(method("hello", "Hello").build())
        .method(
            method("hello_server_stream", "HelloServerStream")
                .server_streaming()
                .build(),
        )
        .method(
            method("hello_client_stream", "HelloClientStream")
                .client_streaming()
                .build(),
        )
        .method(
            method("hello_bi_streams", "HelloBiStreams")
                .client_streaming()
                .server_streaming()
                .build(),
        )
        .build();

    Builder::new().compile(&[service]);
}
