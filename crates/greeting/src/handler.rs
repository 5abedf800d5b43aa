//! Type-erased handler contracts and service definitions.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::channel::{BoxMessage, MessageChannel};
use crate::envelope::{CallEnvelope, Shape};
use crate::status::Status;

/// Business logic for a unary method.
#[async_trait]
pub trait UnaryHandler: Send + Sync {
    /// Handle one fully received request.
    async fn call(&self, call: &CallEnvelope, request: BoxMessage) -> Result<BoxMessage, Status>;
}

/// Business logic for a streaming method of any shape.
///
/// Server-streaming handlers receive their single request through the
/// channel; client-streaming handlers send their single response through it.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// Drive the channel to completion.
    async fn call(&self, channel: &mut dyn MessageChannel) -> Result<(), Status>;
}

/// A registered method, tagged with its shape.
#[derive(Clone)]
pub enum MethodHandler {
    /// One request, one response.
    Unary(Arc<dyn UnaryHandler>),
    /// One request, many responses.
    ServerStream(Arc<dyn StreamHandler>),
    /// Many requests, one response.
    ClientStream(Arc<dyn StreamHandler>),
    /// Interleaved requests and responses.
    BidiStream(Arc<dyn StreamHandler>),
}

impl MethodHandler {
    /// Shape of calls to this method.
    pub fn shape(&self) -> Shape {
        match self {
            MethodHandler::Unary(_) => Shape::Unary,
            MethodHandler::ServerStream(_) => Shape::ServerStream,
            MethodHandler::ClientStream(_) => Shape::ClientStream,
            MethodHandler::BidiStream(_) => Shape::BidiStream,
        }
    }
}

impl fmt::Debug for MethodHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MethodHandler").field(&self.shape()).finish()
    }
}

/// A named group of methods, registered with the server in one go.
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    name: String,
    methods: Vec<(String, MethodHandler)>,
}

impl ServiceDefinition {
    /// Start a service named `name`, e.g. `myapp.GreetingService`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    /// Add a method; it is routed as `/{service}/{method}`.
    #[must_use]
    pub fn method(mut self, method: &str, handler: MethodHandler) -> Self {
        let path = format!("/{}/{}", self.name, method);
        self.methods.push((path, handler));
        self
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full method paths in registration order.
    pub fn method_paths(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(|(path, _)| path.as_str())
    }

    pub(crate) fn into_methods(self) -> Vec<(String, MethodHandler)> {
        self.methods
    }
}
