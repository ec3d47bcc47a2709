//! Readiness-based relay on mio (epoll on Linux, kqueue on macOS).

mod event_loop;

use crate::config::Config;
use crate::error::Result;
use crate::runtime::dispatcher::RelayOptions;
use crate::runtime::listener::listen_addr;
use event_loop::MioRelay;
use tracing::info;

/// Run the relay on mio until polling fails.
pub fn run(config: &Config) -> Result<()> {
    let addr = listen_addr(config)?;
    let mut relay = MioRelay::bind(addr, config.backlog, &RelayOptions::from(config))?;

    info!(
        addr = %addr,
        chunk_size = config.chunk_size,
        "Listening (mio)"
    );

    relay.run()
}
