//! Greeting: an RPC call runtime with interceptors and graceful drain.
//!
//! A call is one of four shapes (unary, server streaming, client streaming,
//! bidirectional streaming). The [`Server`] admits calls from a
//! [`Listener`], routes them by method path, runs them through the
//! configured [`InterceptorChain`] and completes them with header metadata,
//! response messages and a trailer carrying the terminal [`Status`].
//!
//! # Call flow
//!
//! ```text
//! Listener ──IncomingCall──> Server::dispatch
//!                              │  unknown method → NotFound trailer
//!                              ▼
//!                     CallEnvelope + RawChannel
//!                              │
//!            unary ────────────┼──────────── streaming
//!   UnaryInterceptor chain     │     StreamInterceptor chain
//!   (request, UnaryNext)       │     (wraps &mut dyn MessageChannel)
//!            ▼                 │                ▼
//!      UnaryHandler            │          StreamHandler
//!                              ▼
//!           Header ─> Message* ─> Trailer{metadata, status}
//! ```
//!
//! Payloads are opaque to the runtime; see [`Message`]. The gRPC surface
//! lives in the `greeting-grpc` crate.

mod channel;
mod envelope;
mod greeter;
mod handler;
mod interceptor;
mod metadata;
mod server;
mod settings;
mod status;
pub mod transport;

pub use channel::{
    BidiStream, BoxMessage, ChannelObserver, ClientStream, Message, MessageChannel,
    ObservedChannel, ServerStream, downcast_message,
};
pub use envelope::{CallEnvelope, SendHeaderError, Shape};
pub use greeter::{
    Greeter, GreetingService, HelloRequest, HelloResponse, SERVICE_NAME, greeting_service, methods,
};
pub use handler::{MethodHandler, ServiceDefinition, StreamHandler, UnaryHandler};
pub use interceptor::{
    InspectInterceptor, InterceptorChain, LoggingInterceptor, ObserverInterceptor,
    StreamInterceptor, StreamNext, UnaryInterceptor, UnaryNext, inspect_unary,
};
pub use metadata::{Metadata, MetadataError};
pub use server::{Server, ServerBuilder, ServerConfig, ServerError, ServerHandle};
pub use settings::{GreeterSettings, HeaderMode};
pub use status::{Code, ErrorDetail, Status};
pub use transport::{
    CallOutcome, ClientCall, Connector, Frame, IncomingCall, Listener, RequestSender,
};
