use std::io;
use std::net::AddrParseError;

use thiserror::Error;

/// Errors that stop the relay.
///
/// Everything here is fatal: setup failures before the event loop starts,
/// and the facility itself failing once it is running. Per-connection I/O
/// errors never surface as an `Error`.
#[derive(Debug, Error)]
pub enum Error {
    /// The configured host/port pair is not a socket address.
    #[error("invalid listen address '{0}': {1}")]
    Address(String, #[source] AddrParseError),
    /// socket/bind/listen failed.
    #[error("listen on {addr}: {source}")]
    Listen {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },
    /// The I/O facility (io_uring instance, mio poller) could not be created.
    #[error("facility setup: {0}")]
    Setup(#[source] io::Error),
    /// Blocking for the next completion or readiness event failed.
    #[error("wait for events: {0}")]
    Wait(#[source] io::Error),
    /// The facility refused an operation even after flushing its queue.
    #[error("submit operation: {0}")]
    Submit(#[source] io::Error),
    /// The selected runtime is not available on this platform.
    #[cfg_attr(target_os = "linux", allow(dead_code))]
    #[error("{0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
