//! TCP listener, tonic transport and the runtime behind it.

use std::future::Future;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_stream::wrappers::TcpListenerStream;

use greeting::{
    Greeter, GreeterSettings, Server, ServerConfig, ServerError, greeting_service, transport,
};

use crate::bridge::GrpcBridge;
use crate::proto::greeting_service_server::GreetingServiceServer;

/// Calls that may wait for admission before the runtime picks them up.
const ACCEPT_QUEUE: usize = 64;

/// Errors from running the gRPC server.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Reading the bound address failed.
    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),
    /// The runtime refused to start.
    #[error(transparent)]
    Runtime(#[from] ServerError),
    /// tonic failed while serving.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// Server configuration and runner.
#[derive(Debug)]
pub struct GreetingServer {
    addr: SocketAddr,
    settings: GreeterSettings,
    config: ServerConfig,
}

impl GreetingServer {
    /// Create a new server bound to the given address.
    pub fn new(addr: SocketAddr, settings: GreeterSettings) -> Self {
        Self {
            addr,
            settings,
            config: ServerConfig::new(),
        }
    }

    /// Use `config` (interceptors) for the runtime.
    #[must_use]
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Run the server until shutdown signal.
    pub async fn run(self) -> Result<(), ServeError> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|source| ServeError::Bind {
                addr: self.addr,
                source,
            })?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `signal` resolves.
    ///
    /// On signal the runtime stops admitting calls and drains the ones in
    /// flight before the transport closes its connections.
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> Result<(), ServeError>
    where
        F: Future<Output = ()>,
    {
        let local = listener.local_addr()?;
        let runtime = Server::builder()
            .config(self.config)
            .add_service(greeting_service(Greeter::new(self.settings)))
            .build();
        let (calls, connector) = transport::memory(ACCEPT_QUEUE);
        let handle = runtime.start(calls)?;

        let (close_tx, close_rx) = oneshot::channel::<()>();
        let transport = tonic::transport::Server::builder()
            .add_service(GreetingServiceServer::new(GrpcBridge::new(connector)))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                let _ = close_rx.await;
            });
        tokio::pin!(transport);

        tracing::info!("Starting gRPC server on {}", local);

        let served = tokio::select! {
            result = &mut transport => Some(result),
            () = signal => None,
        };
        let result = match served {
            Some(result) => {
                tracing::warn!("gRPC transport stopped before shutdown was requested");
                handle.stop().await;
                result
            }
            None => {
                handle.stop().await;
                let _ = close_tx.send(());
                transport.await
            }
        };

        tracing::info!("gRPC server shut down");
        result.map_err(ServeError::from)
    }
}

/// Resolve on Ctrl+C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    tokio::select! {
        () = interrupt() => tracing::info!("Received Ctrl+C, draining in-flight calls"),
        () = terminate() => tracing::info!("Received SIGTERM, draining in-flight calls"),
    }
}

async fn interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install Ctrl+C handler: {}", e);
        // A missing handler must not read as a shutdown request.
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {}", e);
            // Ctrl+C is left as the only way out.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
