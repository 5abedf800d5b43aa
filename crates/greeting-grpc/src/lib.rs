//! gRPC surface for the greeting runtime.
//!
//! tonic owns HTTP/2 and protobuf framing. Every call it receives is handed
//! to the in-process [`greeting::Server`] through a [`greeting::Connector`],
//! so interceptors, metadata handling and drain-and-stop are the runtime's,
//! not tonic's.

pub mod bridge;
pub mod server;
pub mod status;

pub use bridge::GrpcBridge;
pub use server::{GreetingServer, ServeError, shutdown_signal};

/// Protobuf messages and the generated tonic service for `myapp.GreetingService`.
#[allow(missing_docs)]
pub mod proto {
    /// Request carrying the name to greet.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct HelloRequest {
        #[prost(string, tag = "1")]
        pub name: String,
    }

    /// Greeting produced by the server.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct HelloResponse {
        #[prost(string, tag = "1")]
        pub message: String,
    }

    impl From<HelloRequest> for greeting::HelloRequest {
        fn from(request: HelloRequest) -> Self {
            greeting::HelloRequest { name: request.name }
        }
    }

    impl From<greeting::HelloRequest> for HelloRequest {
        fn from(request: greeting::HelloRequest) -> Self {
            HelloRequest { name: request.name }
        }
    }

    impl From<greeting::HelloResponse> for HelloResponse {
        fn from(response: greeting::HelloResponse) -> Self {
            HelloResponse {
                message: response.message,
            }
        }
    }

    include!(concat!(env!("OUT_DIR"), "/myapp.GreetingService.rs"));
}
