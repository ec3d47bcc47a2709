//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Each received chunk is shared (refcounted) across the outbound queues of
//! every other peer. A queue that cannot be flushed immediately keeps the
//! peer registered for WRITABLE until it drains.

use crate::error::{Error, Result};
use crate::runtime::dispatcher::RelayOptions;
use crate::runtime::listener::create_listener;
use bytes::{Buf, Bytes};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

struct Peer {
    stream: TcpStream,
    outbound: VecDeque<Bytes>,
    /// Registered for WRITABLE as well as READABLE.
    writable: bool,
}

pub struct MioRelay {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    peers: Slab<Peer>,
    buf: Vec<u8>,
    options: RelayOptions,
}

impl MioRelay {
    pub fn bind(addr: SocketAddr, backlog: i32, options: &RelayOptions) -> Result<Self> {
        let poll = Poll::new().map_err(Error::Setup)?;
        let listener = create_listener(addr, backlog, true)?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(Error::Setup)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(128),
            listener,
            peers: Slab::new(),
            buf: vec![0u8; options.chunk_size],
            options: *options,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Relay until polling fails.
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.poll_once(None)?;
        }
    }

    /// Wait for readiness once and handle every event.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(Error::Wait(e)),
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.is_readable(), event.is_writable()))
            .collect();

        for (token, readable, writable) in ready {
            match token {
                LISTENER_TOKEN => self.accept_connections(),
                Token(conn_id) => {
                    if readable && self.peers.contains(conn_id) {
                        self.handle_readable(conn_id);
                    }
                    if writable && self.peers.contains(conn_id) {
                        self.flush(conn_id);
                    }
                }
            }
        }

        Ok(())
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer_addr)) => {
                    let limit = self.options.max_connections;
                    if limit != 0 && self.peers.len() >= limit {
                        warn!(peer = %peer_addr, "Connection limit reached, closing");
                        continue;
                    }

                    let entry = self.peers.vacant_entry();
                    let conn_id = entry.key();
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, Token(conn_id), Interest::READABLE)
                    {
                        warn!(peer = %peer_addr, "Register failed: {}", e);
                        continue;
                    }

                    entry.insert(Peer {
                        stream,
                        outbound: VecDeque::new(),
                        writable: false,
                    });
                    info!(conn = conn_id, peer = %peer_addr, "Connected");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_readable(&mut self, conn_id: usize) {
        loop {
            let Some(peer) = self.peers.get_mut(conn_id) else {
                return;
            };

            match peer.stream.read(&mut self.buf) {
                Ok(0) => {
                    info!(conn = conn_id, "Closed by peer");
                    self.close(conn_id);
                    return;
                }
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&self.buf[..n]);
                    info!(
                        conn = conn_id,
                        bytes = n,
                        "Read: {}",
                        String::from_utf8_lossy(&chunk).trim_end()
                    );
                    self.broadcast(conn_id, chunk);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(conn = conn_id, "Read failed: {}", e);
                    self.close(conn_id);
                    return;
                }
            }
        }
    }

    fn broadcast(&mut self, from: usize, chunk: Bytes) {
        let targets: Vec<usize> = self
            .peers
            .iter()
            .map(|(conn_id, _)| conn_id)
            .filter(|&conn_id| conn_id != from)
            .collect();

        for dest in targets {
            let limit = self.options.max_pending_writes;
            let Some(peer) = self.peers.get_mut(dest) else {
                continue;
            };
            if limit != 0 && peer.outbound.len() >= limit {
                warn!(
                    conn = dest,
                    pending = peer.outbound.len(),
                    "Too many pending writes, disconnecting"
                );
                self.close(dest);
                continue;
            }
            peer.outbound.push_back(chunk.clone());
            self.flush(dest);
        }
    }

    /// Write as much queued data as the socket takes, then update interest.
    fn flush(&mut self, conn_id: usize) {
        let Some(peer) = self.peers.get_mut(conn_id) else {
            return;
        };

        if let Err(e) = drain(peer) {
            warn!(conn = conn_id, "Write failed: {}", e);
            self.close(conn_id);
            return;
        }

        let want_writable = !peer.outbound.is_empty();
        if want_writable == peer.writable {
            return;
        }

        let interest = if want_writable {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let result = self
            .poll
            .registry()
            .reregister(&mut peer.stream, Token(conn_id), interest);
        match result {
            Ok(()) => peer.writable = want_writable,
            Err(e) => {
                warn!(conn = conn_id, "Reregister failed: {}", e);
                self.close(conn_id);
            }
        }
    }

    fn close(&mut self, conn_id: usize) {
        if let Some(mut peer) = self.peers.try_remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut peer.stream);
            debug!(
                conn = conn_id,
                dropped = peer.outbound.len(),
                "Connection closed"
            );
        }
    }
}

/// Write queued chunks until the queue is empty or the socket would block.
fn drain(peer: &mut Peer) -> io::Result<()> {
    while let Some(front) = peer.outbound.front_mut() {
        match peer.stream.write(&front[..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) if n == front.len() => {
                peer.outbound.pop_front();
            }
            Ok(n) => front.advance(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
