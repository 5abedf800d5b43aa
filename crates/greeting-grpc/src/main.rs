//! Greeting gRPC Server
//!
//! Serves `myapp.GreetingService` with a logging interceptor installed on
//! both the unary and the stream chain.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use greeting::{GreeterSettings, HeaderMode, LoggingInterceptor, ServerConfig};
use greeting_grpc::GreetingServer;

/// Greeting gRPC Server - four-shape demo service with interceptors
#[derive(Parser, Debug)]
#[command(name = "greeting-grpc")]
#[command(about = "gRPC server for myapp.GreetingService")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "[::]:8080")]
    addr: SocketAddr,

    /// Responses sent by HelloServerStream
    #[arg(long, default_value_t = 5)]
    stream_count: usize,

    /// Pause between server-stream responses, in milliseconds
    #[arg(long, default_value_t = 1000)]
    stream_interval_ms: u64,

    /// Simulated work per bidirectional request, in milliseconds
    #[arg(long, default_value_t = 3000)]
    bidi_delay_ms: u64,

    /// Send the bidirectional header before reading requests
    #[arg(long)]
    immediate_header: bool,

    /// Cap on names buffered by HelloClientStream (0 for unbounded)
    #[arg(long, default_value_t = 10_000)]
    max_client_stream_messages: usize,
}

impl Args {
    fn settings(&self) -> GreeterSettings {
        GreeterSettings {
            stream_count: self.stream_count,
            stream_interval: Duration::from_millis(self.stream_interval_ms),
            bidi_delay: Duration::from_millis(self.bidi_delay_ms),
            bidi_header: if self.immediate_header {
                HeaderMode::Immediate
            } else {
                HeaderMode::Deferred
            },
            max_client_stream_messages: (self.max_client_stream_messages > 0)
                .then_some(self.max_client_stream_messages),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    let config = ServerConfig::new()
        .unary_interceptor(LoggingInterceptor::new("unary interceptor 1"))
        .unary_interceptor(LoggingInterceptor::new("unary interceptor 2"))
        .stream_interceptor(LoggingInterceptor::new("stream interceptor 1"))
        .stream_interceptor(LoggingInterceptor::new("stream interceptor 2"));

    GreetingServer::new(args.addr, args.settings())
        .with_config(config)
        .run()
        .await
        .context("greeting server failed")?;

    Ok(())
}
