//! Server runtime: handler registry, dispatch and drain-and-stop lifecycle.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::channel::{MessageChannel, RawChannel};
use crate::envelope::CallEnvelope;
use crate::handler::{MethodHandler, ServiceDefinition, UnaryHandler};
use crate::interceptor::{InterceptorChain, StreamInterceptor, UnaryInterceptor};
use crate::metadata::Metadata;
use crate::status::Status;
use crate::transport::{Frame, IncomingCall, Listener};

/// Errors from the server lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// `start` was called on a server that is already running.
    #[error("server already started")]
    AlreadyStarted,
    /// `start` was called outside a tokio runtime.
    #[error("no tokio runtime available to run the server")]
    NoRuntime,
}

/// Explicit runtime configuration; there is no process-wide registration.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    interceptors: InterceptorChain,
}

impl ServerConfig {
    /// Empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a unary interceptor.
    #[must_use]
    pub fn unary_interceptor(mut self, interceptor: impl UnaryInterceptor + 'static) -> Self {
        self.interceptors.push_unary(interceptor);
        self
    }

    /// Append a stream interceptor.
    #[must_use]
    pub fn stream_interceptor(mut self, interceptor: impl StreamInterceptor + 'static) -> Self {
        self.interceptors.push_stream(interceptor);
        self
    }

    /// The configured chain.
    pub fn interceptors(&self) -> &InterceptorChain {
        &self.interceptors
    }
}

/// Builder for [`Server`].
#[derive(Debug, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
    services: Vec<ServiceDefinition>,
}

impl ServerBuilder {
    /// Replace the configuration.
    #[must_use]
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Append a unary interceptor.
    #[must_use]
    pub fn unary_interceptor(mut self, interceptor: impl UnaryInterceptor + 'static) -> Self {
        self.config = self.config.unary_interceptor(interceptor);
        self
    }

    /// Append a stream interceptor.
    #[must_use]
    pub fn stream_interceptor(mut self, interceptor: impl StreamInterceptor + 'static) -> Self {
        self.config = self.config.stream_interceptor(interceptor);
        self
    }

    /// Register every method of a service.
    #[must_use]
    pub fn add_service(mut self, service: ServiceDefinition) -> Self {
        self.services.push(service);
        self
    }

    /// Finish building.
    pub fn build(self) -> Server {
        Server::new(self.services, self.config)
    }
}

/// Registry and interceptors, read-only once the server is built.
struct Shared {
    methods: HashMap<String, MethodHandler>,
    config: ServerConfig,
}

/// The RPC server runtime.
pub struct Server {
    shared: Arc<Shared>,
    started: AtomicBool,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("methods", &self.shared.methods.len())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Start building a server.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Create a server from services and configuration.
    ///
    /// A method registered twice keeps the last handler.
    pub fn new(services: Vec<ServiceDefinition>, config: ServerConfig) -> Self {
        let mut methods = HashMap::new();
        for service in services {
            for (path, handler) in service.into_methods() {
                if methods.insert(path.clone(), handler).is_some() {
                    tracing::warn!(
                        method = %path,
                        "method registered twice, keeping the last handler"
                    );
                }
            }
        }
        Self {
            shared: Arc::new(Shared { methods, config }),
            started: AtomicBool::new(false),
        }
    }

    /// Registered method paths.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.shared.methods.keys().map(String::as_str)
    }

    /// Begin accepting calls from `listener` on a background task.
    pub fn start<L: Listener>(&self, listener: L) -> Result<ServerHandle, ServerError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ServerError::NoRuntime)?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyStarted);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tracker = Arc::new(CallTracker::default());
        let accept = runtime.spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            Arc::clone(&tracker),
            shutdown_rx,
        ));

        let interceptors = self.shared.config.interceptors();
        tracing::info!(
            methods = self.shared.methods.len(),
            unary_interceptors = interceptors.unary_len(),
            stream_interceptors = interceptors.stream_len(),
            "server started"
        );
        Ok(ServerHandle {
            shutdown: shutdown_tx,
            accept: Mutex::new(Some(accept)),
            tracker,
        })
    }
}

async fn accept_loop<L: Listener>(
    mut listener: L,
    shared: Arc<Shared>,
    tracker: Arc<CallTracker>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let call = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            call = listener.accept() => match call {
                Some(call) => call,
                None => break,
            },
        };

        let guard = tracker.admit();
        let span = tracing::info_span!(
            "call",
            method = %call.method(),
            shape = tracing::field::Empty,
        );
        let shared = Arc::clone(&shared);
        tokio::spawn(
            async move {
                let _guard = guard;
                shared.dispatch(call).await;
            }
            .instrument(span),
        );
    }
    // Dropping the listener refuses calls still queued on it.
    drop(listener);
    tracing::info!("stopped accepting calls");
}

impl Shared {
    async fn dispatch(&self, call: IncomingCall) {
        let IncomingCall {
            method,
            metadata,
            deadline,
            inbound,
            outbound,
        } = call;

        let Some(handler) = self.methods.get(&method) else {
            tracing::warn!("unknown method");
            let frame = Frame::Trailer {
                metadata: Metadata::new(),
                status: Some(Status::not_found(format!("unknown method {method}"))),
            };
            if outbound.send(frame).await.is_err() {
                tracing::debug!("peer gone before rejection");
            }
            return;
        };
        tracing::Span::current().record("shape", tracing::field::display(handler.shape()));

        let envelope = Arc::new(CallEnvelope::new(
            method,
            handler.shape(),
            metadata,
            deadline,
            outbound,
        ));
        let mut channel = RawChannel::new(Arc::clone(&envelope), inbound);

        let run = async {
            match handler {
                MethodHandler::Unary(handler) => {
                    self.run_unary(&envelope, &mut channel, handler.as_ref()).await
                }
                MethodHandler::ServerStream(handler)
                | MethodHandler::ClientStream(handler)
                | MethodHandler::BidiStream(handler) => {
                    self.config
                        .interceptors()
                        .run_stream(&mut channel, handler.as_ref())
                        .await
                }
            }
        };
        let result = AssertUnwindSafe(run).catch_unwind().await.unwrap_or_else(|_| {
            tracing::error!("handler panicked");
            Err(Status::internal("internal error"))
        });

        match &result {
            Ok(()) => tracing::debug!("call completed"),
            Err(status) => tracing::debug!(
                code = %status.code(),
                message = status.message(),
                "call failed"
            ),
        }
        envelope.complete(result.err()).await;
    }

    async fn run_unary(
        &self,
        envelope: &CallEnvelope,
        channel: &mut RawChannel,
        handler: &dyn UnaryHandler,
    ) -> Result<(), Status> {
        let request = channel
            .recv()
            .await?
            .ok_or_else(|| Status::internal("missing unary request message"))?;
        let response = self
            .config
            .interceptors()
            .run_unary(envelope, request, handler)
            .await?;
        channel.send(response).await
    }
}

/// Control handle for a running server.
///
/// Dropping the handle stops admission without waiting for the drain.
pub struct ServerHandle {
    shutdown: watch::Sender<bool>,
    accept: Mutex<Option<JoinHandle<()>>>,
    tracker: Arc<CallTracker>,
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("in_flight", &self.in_flight())
            .field("stopping", &*self.shutdown.borrow())
            .finish()
    }
}

impl ServerHandle {
    /// Calls admitted and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.tracker.active.load(Ordering::SeqCst)
    }

    /// Stop admitting calls and wait for in-flight calls to complete.
    ///
    /// Calling `stop` again after it returned is a no-op.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);

        let accept = self
            .accept
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(accept) = accept {
            if let Err(e) = accept.await {
                tracing::error!("accept loop failed: {}", e);
            }
            tracing::info!(in_flight = self.in_flight(), "draining in-flight calls");
        }

        self.tracker.wait_idle().await;
        tracing::info!("server stopped");
    }
}

/// Counts admitted calls and wakes `wait_idle` when the count reaches zero.
#[derive(Debug, Default)]
struct CallTracker {
    active: AtomicUsize,
    idle: Notify,
}

impl CallTracker {
    fn admit(self: &Arc<Self>) -> CallGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        CallGuard(Arc::clone(self))
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct CallGuard(Arc<CallTracker>);

impl Drop for CallGuard {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}
