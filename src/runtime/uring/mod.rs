//! Linux io_uring relay.
//!
//! Completion-based: every accept, read, write and close is an asynchronous
//! request whose outcome is matched back to its record by token.

mod facility;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::runtime::dispatcher::{Dispatcher, RelayOptions};
use crate::runtime::listener::{create_listener, listen_addr};
use facility::UringFacility;
use std::os::unix::io::AsRawFd;
use tracing::info;

/// Run the relay on io_uring until the ring fails.
pub fn run(config: &Config) -> Result<()> {
    let addr = listen_addr(config)?;
    let listener = create_listener(addr, config.backlog, false)?;
    let facility = UringFacility::new(config.ring_size).map_err(Error::Setup)?;

    info!(
        addr = %addr,
        ring_size = config.ring_size,
        chunk_size = config.chunk_size,
        "Listening (io_uring)"
    );

    let options = RelayOptions::from(config);
    let mut relay = Dispatcher::new(facility, listener.as_raw_fd(), &options);
    relay.run()
}
