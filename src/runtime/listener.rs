//! Listening socket setup shared by both runtimes.

use crate::config::Config;
use crate::error::{Error, Result};
use std::net::{IpAddr, SocketAddr, TcpListener};

/// Resolve the configured host and port. The host is a literal IPv4 or IPv6
/// address.
pub fn listen_addr(config: &Config) -> Result<SocketAddr> {
    let ip: IpAddr = config
        .host
        .parse()
        .map_err(|e| Error::Address(config.host.clone(), e))?;
    Ok(SocketAddr::new(ip, config.port))
}

/// Create a TCP listener with SO_REUSEADDR so the relay can be restarted
/// right away.
pub fn create_listener(addr: SocketAddr, backlog: i32, nonblocking: bool) -> Result<TcpListener> {
    let listen_err = |source| Error::Listen { addr, source };

    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(listen_err)?;

    socket.set_reuse_address(true).map_err(listen_err)?;
    socket.set_nonblocking(nonblocking).map_err(listen_err)?;
    socket.bind(&addr.into()).map_err(listen_err)?;
    socket.listen(backlog).map_err(listen_err)?;

    Ok(socket.into())
}
