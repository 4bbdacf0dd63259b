//! mmap-httpd: a multi-threaded static file server
//!
//! Serves files from a document root over HTTP/1.1:
//! - GET requests with keep-alive
//! - One-shot readiness dispatch with a bounded worker pool
//! - Files sent straight from a read-only memory mapping
//! - Idle connections closed after three timeslots
//! - Configuration via CLI arguments or TOML file

mod config;
mod http;
mod runtime;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

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
        host = %config.host,
        port = config.port,
        doc_root = %config.doc_root.display(),
        workers = config.workers,
        max_requests = config.max_requests,
        max_connections = config.max_connections,
        timeslot_secs = config.timeslot.as_secs(),
        "Starting mmap-httpd"
    );

    runtime::run(&config)?;
    Ok(())
}
