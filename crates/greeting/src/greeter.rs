//! The greeting service: one method per interaction shape.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::channel::{
    BidiStream, BoxMessage, ClientStream, MessageChannel, ServerStream, downcast_message,
};
use crate::envelope::CallEnvelope;
use crate::handler::{MethodHandler, ServiceDefinition, StreamHandler, UnaryHandler};
use crate::metadata::Metadata;
use crate::settings::{GreeterSettings, HeaderMode};
use crate::status::Status;

/// Service name used to route greeting methods.
pub const SERVICE_NAME: &str = "myapp.GreetingService";

/// Full method paths.
pub mod methods {
    /// Unary greeting.
    pub const HELLO: &str = "/myapp.GreetingService/Hello";
    /// Server-streaming greeting.
    pub const HELLO_SERVER_STREAM: &str = "/myapp.GreetingService/HelloServerStream";
    /// Client-streaming greeting.
    pub const HELLO_CLIENT_STREAM: &str = "/myapp.GreetingService/HelloClientStream";
    /// Bidirectional greeting.
    pub const HELLO_BI_STREAMS: &str = "/myapp.GreetingService/HelloBiStreams";
}

/// Request payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloRequest {
    /// Who to greet.
    pub name: String,
}

impl HelloRequest {
    /// Build a request for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Response payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloResponse {
    /// The greeting.
    pub message: String,
}

/// The four greeting methods.
#[async_trait]
pub trait GreetingService: Send + Sync + 'static {
    /// Unary: one request, one greeting.
    async fn hello(
        &self,
        call: &CallEnvelope,
        request: HelloRequest,
    ) -> Result<HelloResponse, Status>;

    /// Server streaming: one request, a sequence of greetings.
    async fn hello_server_stream(
        &self,
        request: HelloRequest,
        stream: ServerStream<'_, HelloResponse>,
    ) -> Result<(), Status>;

    /// Client streaming: many names, one greeting.
    async fn hello_client_stream(
        &self,
        stream: ClientStream<'_, HelloRequest>,
    ) -> Result<HelloResponse, Status>;

    /// Bidirectional: one greeting per request, in lockstep.
    async fn hello_bi_streams(
        &self,
        stream: BidiStream<'_, HelloRequest, HelloResponse>,
    ) -> Result<(), Status>;
}

/// Register every greeting method of `service`.
pub fn greeting_service<S: GreetingService>(service: S) -> ServiceDefinition {
    let service = Arc::new(service);
    ServiceDefinition::new(SERVICE_NAME)
        .method("Hello", MethodHandler::Unary(Arc::new(Hello(Arc::clone(&service)))))
        .method(
            "HelloServerStream",
            MethodHandler::ServerStream(Arc::new(HelloServerStream(Arc::clone(&service)))),
        )
        .method(
            "HelloClientStream",
            MethodHandler::ClientStream(Arc::new(HelloClientStream(Arc::clone(&service)))),
        )
        .method(
            "HelloBiStreams",
            MethodHandler::BidiStream(Arc::new(HelloBiStreams(service))),
        )
}

struct Hello<S>(Arc<S>);

#[async_trait]
impl<S: GreetingService> UnaryHandler for Hello<S> {
    async fn call(&self, call: &CallEnvelope, request: BoxMessage) -> Result<BoxMessage, Status> {
        let request = downcast_message::<HelloRequest>(request)?;
        let response = self.0.hello(call, request).await?;
        Ok(Box::new(response))
    }
}

struct HelloServerStream<S>(Arc<S>);

#[async_trait]
impl<S: GreetingService> StreamHandler for HelloServerStream<S> {
    async fn call(&self, channel: &mut dyn MessageChannel) -> Result<(), Status> {
        let request = match channel.recv().await? {
            Some(message) => downcast_message::<HelloRequest>(message)?,
            None => return Err(Status::internal("missing server-streaming request message")),
        };
        self.0
            .hello_server_stream(request, ServerStream::new(channel))
            .await
    }
}

struct HelloClientStream<S>(Arc<S>);

#[async_trait]
impl<S: GreetingService> StreamHandler for HelloClientStream<S> {
    async fn call(&self, channel: &mut dyn MessageChannel) -> Result<(), Status> {
        let response = self
            .0
            .hello_client_stream(ClientStream::new(&mut *channel))
            .await?;
        channel.send(Box::new(response)).await
    }
}

struct HelloBiStreams<S>(Arc<S>);

#[async_trait]
impl<S: GreetingService> StreamHandler for HelloBiStreams<S> {
    async fn call(&self, channel: &mut dyn MessageChannel) -> Result<(), Status> {
        self.0.hello_bi_streams(BidiStream::new(channel)).await
    }
}

/// The greeting service implementation.
#[derive(Debug, Clone, Default)]
pub struct Greeter {
    settings: GreeterSettings,
}

impl Greeter {
    /// Create a greeter with the given pacing and limits.
    pub fn new(settings: GreeterSettings) -> Self {
        Self { settings }
    }
}

fn tagged(kind: &str, slot: &str) -> Metadata {
    Metadata::from_pairs([("type", kind), ("from", "server"), ("in", slot)])
}

#[async_trait]
impl GreetingService for Greeter {
    async fn hello(
        &self,
        call: &CallEnvelope,
        request: HelloRequest,
    ) -> Result<HelloResponse, Status> {
        tracing::info!(metadata = ?call.incoming(), "request reached");

        call.set_header(tagged("unary", "header"))?;
        call.set_trailer(tagged("unary", "trailer"))?;

        if request.name.is_empty() {
            return Err(Status::invalid_argument("name empty").with_debug_info("detail error"));
        }

        Ok(HelloResponse {
            message: format!("hello, {}!", request.name),
        })
    }

    async fn hello_server_stream(
        &self,
        request: HelloRequest,
        mut stream: ServerStream<'_, HelloResponse>,
    ) -> Result<(), Status> {
        let count = self.settings.stream_count;
        for i in 0..count {
            stream
                .send(HelloResponse {
                    message: format!("[{}] Hello, {}!", i, request.name),
                })
                .await?;
            if i + 1 < count && !self.settings.stream_interval.is_zero() {
                tokio::time::sleep(self.settings.stream_interval).await;
            }
        }
        Ok(())
    }

    async fn hello_client_stream(
        &self,
        mut stream: ClientStream<'_, HelloRequest>,
    ) -> Result<HelloResponse, Status> {
        let mut names = Vec::new();
        // Names are buffered until end of stream; the cap bounds that buffer.
        while let Some(request) = stream.recv().await? {
            if let Some(max) = self.settings.max_client_stream_messages
                && names.len() >= max
            {
                return Err(Status::resource_exhausted(format!(
                    "client stream exceeded {max} messages"
                )));
            }
            names.push(request.name);
        }
        Ok(HelloResponse {
            message: format!("Hello, [{}]!", names.join(" ")),
        })
    }

    async fn hello_bi_streams(
        &self,
        mut stream: BidiStream<'_, HelloRequest, HelloResponse>,
    ) -> Result<(), Status> {
        tracing::info!(metadata = ?stream.envelope().incoming(), "request reached");

        let header = tagged("stream", "header");
        match self.settings.bidi_header {
            HeaderMode::Deferred => stream.set_header(header)?,
            HeaderMode::Immediate => stream.send_header(header).await?,
        }
        stream.set_trailer(tagged("stream", "trailer"))?;

        while let Some(request) = stream.recv().await? {
            if !self.settings.bidi_delay.is_zero() {
                tokio::time::sleep(self.settings.bidi_delay).await;
            }
            stream
                .send(HelloResponse {
                    message: format!("Hello, {}!", request.name),
                })
                .await?;
        }
        Ok(())
    }
}
