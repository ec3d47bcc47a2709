//! yoctorelay: a minimal text relay.
//!
//! Every byte sequence received from one connected peer is broadcast
//! verbatim to every other connected peer. No framing, no protocol.
//!
//! Runtimes:
//! - io_uring (Linux): completion-based, every operation is asynchronous
//! - mio: readiness-based, epoll on Linux and kqueue on macOS

mod config;
mod error;
mod runtime;

use config::{Config, ConfigError};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        // --help and --version are not errors
        Err(ConfigError::Cli(e)) if !e.use_stderr() => e.exit(),
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

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
        runtime = ?config.runtime,
        max_connections = config.max_connections,
        max_pending_writes = config.max_pending_writes,
        "Starting yoctorelay"
    );

    if let Err(e) = runtime::run(&config) {
        error!("{}", e);
        return Err(e.into());
    }

    Ok(())
}
