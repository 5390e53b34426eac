//! echo-showcase: a conformance echo server for RPC client libraries
//!
//! Every call shape a client library must handle, driven by the request:
//! - Unary echo, server/client/bidirectional streaming
//! - Paginated expansion with page tokens
//! - Injected errors with full status details
//! - Trailer echo via `showcase-trailer` metadata
//! - Delayed responses and long-running operations
//! - Configuration via CLI arguments or TOML file

mod config;
mod metadata;
mod protocol;
mod server;
mod service;
mod status;
mod waiter;

use config::Config;
use server::Server;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use waiter::InMemoryWaiter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = ?config.workers,
        max_connections = config.max_connections,
        stream_buffer = config.stream_buffer,
        operation_retention = config.operation_retention,
        "Starting echo-showcase server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers.max(1));
    }
    let runtime = builder.enable_all().build()?;

    let server = Server::new(config, Arc::new(InMemoryWaiter::new()));
    runtime.block_on(server.run())
}
