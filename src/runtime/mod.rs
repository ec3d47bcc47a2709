//! Relay runtimes.
//!
//! Platform-specific implementations:
//! - Linux: io_uring for completion-based I/O
//! - Linux/macOS: mio (epoll/kqueue) for readiness-based I/O
//!
//! The completion-based relay is split into:
//! - `ConnectionTable`: which connections are active
//! - `Request` / `RequestRegistry`: one record per in-flight operation
//! - `Driver`: submits operations to a `Facility`
//! - `Dispatcher`: reacts to completions and drives the driver

mod backlog;
mod dispatcher;
mod driver;
mod facility;
mod listener;
mod mio_impl;
mod request;
mod table;

#[cfg(target_os = "linux")]
mod uring;

use crate::config::{Config, RuntimeType};
use crate::error::Result;

/// Run the relay with the configured backend.
pub fn run(config: &Config) -> Result<()> {
    match config.runtime {
        RuntimeType::IoUring => run_uring(config),
        RuntimeType::Mio => mio_impl::run(config),
    }
}

#[cfg(target_os = "linux")]
fn run_uring(config: &Config) -> Result<()> {
    uring::run(config)
}

#[cfg(not(target_os = "linux"))]
fn run_uring(_config: &Config) -> Result<()> {
    Err(crate::error::Error::Unsupported(
        "io_uring runtime is only available on Linux; use --runtime mio",
    ))
}
