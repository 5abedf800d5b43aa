//! Interceptor middleware for unary and streaming calls.
//!
//! Interceptors run in registration order on the way in and in reverse
//! order on the way out. Given `[A, B]` around handler `H`:
//!
//! ```text
//! A pre → B pre → H → B post → A post
//! ```
//!
//! Unary interceptors get the request and a [`UnaryNext`] delegate; stream
//! interceptors get the channel and a [`StreamNext`] delegate and may wrap
//! the channel before passing it on. Received messages are observed by `A`'s
//! wrapper before `B`'s; sent messages pass `B`'s wrapper before `A`'s.
//!
//! Every interceptor must call its delegate exactly once and return the
//! delegate's error unchanged. The delegate is consumed by `run`, so calling
//! it twice does not compile; failing to call it is a contract violation the
//! runtime does not detect.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::channel::{BoxMessage, ChannelObserver, Message, MessageChannel, ObservedChannel};
use crate::envelope::CallEnvelope;
use crate::handler::{StreamHandler, UnaryHandler};
use crate::status::Status;

/// Middleware around unary calls.
#[async_trait]
pub trait UnaryInterceptor: Send + Sync {
    /// Observe or modify the call, delegate through `next`, then observe or
    /// modify the result.
    async fn intercept(
        &self,
        call: &CallEnvelope,
        request: BoxMessage,
        next: UnaryNext<'_>,
    ) -> Result<BoxMessage, Status>;
}

/// Middleware around streaming calls.
#[async_trait]
pub trait StreamInterceptor: Send + Sync {
    /// Optionally decorate `channel`, delegate through `next`, then observe
    /// the outcome.
    async fn intercept(
        &self,
        channel: &mut dyn MessageChannel,
        next: StreamNext<'_>,
    ) -> Result<(), Status>;
}

/// The rest of a unary chain plus the handler.
pub struct UnaryNext<'a> {
    rest: &'a [Arc<dyn UnaryInterceptor>],
    handler: &'a dyn UnaryHandler,
}

impl UnaryNext<'_> {
    /// Invoke the remainder of the chain.
    pub async fn run(self, call: &CallEnvelope, request: BoxMessage) -> Result<BoxMessage, Status> {
        match self.rest.split_first() {
            Some((first, rest)) => {
                let next = UnaryNext {
                    rest,
                    handler: self.handler,
                };
                first.intercept(call, request, next).await
            }
            None => self.handler.call(call, request).await,
        }
    }
}

impl fmt::Debug for UnaryNext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnaryNext")
            .field("remaining", &self.rest.len())
            .finish_non_exhaustive()
    }
}

/// The rest of a stream chain plus the handler.
pub struct StreamNext<'a> {
    rest: &'a [Arc<dyn StreamInterceptor>],
    handler: &'a dyn StreamHandler,
}

impl StreamNext<'_> {
    /// Invoke the remainder of the chain against `channel`.
    pub async fn run(self, channel: &mut dyn MessageChannel) -> Result<(), Status> {
        match self.rest.split_first() {
            Some((first, rest)) => {
                let next = StreamNext {
                    rest,
                    handler: self.handler,
                };
                first.intercept(channel, next).await
            }
            None => self.handler.call(channel).await,
        }
    }
}

impl fmt::Debug for StreamNext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamNext")
            .field("remaining", &self.rest.len())
            .finish_non_exhaustive()
    }
}

/// Ordered unary and stream interceptors.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    unary: Vec<Arc<dyn UnaryInterceptor>>,
    stream: Vec<Arc<dyn StreamInterceptor>>,
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("unary", &format!("[{} interceptors]", self.unary.len()))
            .field("stream", &format!("[{} interceptors]", self.stream.len()))
            .finish()
    }
}

impl InterceptorChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a unary interceptor.
    pub fn push_unary(&mut self, interceptor: impl UnaryInterceptor + 'static) {
        self.unary.push(Arc::new(interceptor));
    }

    /// Append a stream interceptor.
    pub fn push_stream(&mut self, interceptor: impl StreamInterceptor + 'static) {
        self.stream.push(Arc::new(interceptor));
    }

    /// Number of unary interceptors.
    pub fn unary_len(&self) -> usize {
        self.unary.len()
    }

    /// Number of stream interceptors.
    pub fn stream_len(&self) -> usize {
        self.stream.len()
    }

    /// Run a unary call through the chain and into `handler`.
    pub async fn run_unary(
        &self,
        call: &CallEnvelope,
        request: BoxMessage,
        handler: &dyn UnaryHandler,
    ) -> Result<BoxMessage, Status> {
        UnaryNext {
            rest: &self.unary,
            handler,
        }
        .run(call, request)
        .await
    }

    /// Run a streaming call through the chain and into `handler`.
    pub async fn run_stream(
        &self,
        channel: &mut dyn MessageChannel,
        handler: &dyn StreamHandler,
    ) -> Result<(), Status> {
        StreamNext {
            rest: &self.stream,
            handler,
        }
        .run(channel)
        .await
    }
}

/// Logs call and message boundaries through `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingInterceptor {
    name: String,
}

impl LoggingInterceptor {
    /// Create a logger whose lines are tagged with `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl UnaryInterceptor for LoggingInterceptor {
    async fn intercept(
        &self,
        call: &CallEnvelope,
        request: BoxMessage,
        next: UnaryNext<'_>,
    ) -> Result<BoxMessage, Status> {
        tracing::info!("[pre] {}: {}", self.name, call.method());
        let result = next.run(call, request).await;
        match &result {
            Ok(response) => tracing::info!("[post] {}: {:?}", self.name, response),
            Err(status) => tracing::info!("[post] {}: {}", self.name, status),
        }
        result
    }
}

#[async_trait]
impl StreamInterceptor for LoggingInterceptor {
    async fn intercept(
        &self,
        channel: &mut dyn MessageChannel,
        next: StreamNext<'_>,
    ) -> Result<(), Status> {
        tracing::info!("[pre stream] {}: {}", self.name, channel.envelope().method());
        let result = {
            let mut logged = ObservedChannel::new(channel, self);
            next.run(&mut logged).await
        };
        match &result {
            Ok(()) => tracing::info!("[post stream] {}", self.name),
            Err(status) => tracing::info!("[post stream] {}: {}", self.name, status),
        }
        result
    }
}

impl ChannelObserver for LoggingInterceptor {
    fn on_recv(&self, _call: &CallEnvelope, message: &dyn Message) {
        tracing::info!("[pre message] {}: {:?}", self.name, message);
    }

    fn on_send(&self, _call: &CallEnvelope, message: &dyn Message) {
        tracing::info!("[post message] {}: {:?}", self.name, message);
    }
}

/// Stream interceptor that wraps every channel with a [`ChannelObserver`].
#[derive(Debug, Clone)]
pub struct ObserverInterceptor<O> {
    observer: O,
}

impl<O: ChannelObserver> ObserverInterceptor<O> {
    /// Wrap channels with `observer`.
    pub fn new(observer: O) -> Self {
        Self { observer }
    }
}

#[async_trait]
impl<O: ChannelObserver> StreamInterceptor for ObserverInterceptor<O> {
    async fn intercept(
        &self,
        channel: &mut dyn MessageChannel,
        next: StreamNext<'_>,
    ) -> Result<(), Status> {
        let mut observed = ObservedChannel::new(channel, &self.observer);
        next.run(&mut observed).await
    }
}

/// Unary interceptor that runs a closure on each call before delegating.
pub struct InspectInterceptor<F> {
    f: F,
}

impl<F> fmt::Debug for InspectInterceptor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InspectInterceptor").finish_non_exhaustive()
    }
}

/// Build a unary interceptor from a pre-hook.
///
/// The closure can read the request and adjust outgoing metadata through the
/// envelope; the call is always delegated afterwards.
pub fn inspect_unary<F>(f: F) -> InspectInterceptor<F>
where
    F: Fn(&CallEnvelope, &dyn Message) + Send + Sync,
{
    InspectInterceptor { f }
}

#[async_trait]
impl<F> UnaryInterceptor for InspectInterceptor<F>
where
    F: Fn(&CallEnvelope, &dyn Message) + Send + Sync,
{
    async fn intercept(
        &self,
        call: &CallEnvelope,
        request: BoxMessage,
        next: UnaryNext<'_>,
    ) -> Result<BoxMessage, Status> {
        (self.f)(call, &*request);
        next.run(call, request).await
    }
}
