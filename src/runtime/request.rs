//! Request records for in-flight asynchronous operations.
//!
//! Every submitted operation owns one [`Request`]. While the operation is in
//! flight the record lives in the [`RequestRegistry`] and the facility only
//! holds its token (the io_uring `user_data`). When the completion arrives the
//! record is taken back out by value, so the completion handler owns it and
//! must either hand it back to the driver (re-arm) or drop it (release).
//!
//! All memory the kernel writes into or reads from (I/O buffers, the accept
//! address) is boxed, so it stays put even when the registry's slab grows and
//! moves the records themselves.

use crate::runtime::table::Handle;
use slab::Slab;
use std::fmt;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

/// Kind of in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Accept,
    Read,
    Write,
    Shutdown,
    Close,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestKind::Accept => "accept",
            RequestKind::Read => "read",
            RequestKind::Write => "write",
            RequestKind::Shutdown => "shutdown",
            RequestKind::Close => "close",
        };
        f.write_str(name)
    }
}

/// One asynchronous operation and its payload.
#[derive(Debug)]
pub enum Request {
    Accept(AcceptRequest),
    Read(IoRequest),
    Write(IoRequest),
    /// Shut both directions down so operations still pending on the socket
    /// complete before it is closed.
    Shutdown(Handle),
    Close(Handle),
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Accept(_) => RequestKind::Accept,
            Request::Read(_) => RequestKind::Read,
            Request::Write(_) => RequestKind::Write,
            Request::Shutdown(_) => RequestKind::Shutdown,
            Request::Close(_) => RequestKind::Close,
        }
    }

    /// Descriptor the operation targets.
    pub fn fd(&self) -> RawFd {
        match self {
            Request::Accept(req) => req.listener,
            Request::Read(req) | Request::Write(req) => req.conn.fd(),
            Request::Shutdown(conn) | Request::Close(conn) => conn.fd(),
        }
    }
}

/// Peer address storage filled in by the kernel on accept.
pub struct PeerAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl PeerAddr {
    fn new() -> Box<Self> {
        Box::new(Self {
            // SAFETY: sockaddr_storage is plain old data; all-zero is AF_UNSPEC.
            storage: unsafe { mem::zeroed() },
            len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        })
    }

    /// Prepare for another accept.
    fn reset(&mut self) {
        // SAFETY: as in `new`.
        self.storage = unsafe { mem::zeroed() };
        self.len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    }

    /// Decode the stored address, if the kernel wrote an IPv4/IPv6 one.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        // SAFETY: storage is a valid sockaddr_storage and len never exceeds it.
        let addr = unsafe { socket2::SockAddr::new(self.storage, self.len) };
        addr.as_socket()
    }

    /// Pointers handed to the kernel's accept.
    pub(crate) fn as_mut_ptrs(&mut self) -> (*mut libc::sockaddr, *mut libc::socklen_t) {
        (
            &mut self.storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut self.len,
        )
    }

    #[cfg(test)]
    pub(crate) fn set(&mut self, addr: SocketAddr) {
        let addr = socket2::SockAddr::from(addr);
        self.reset();
        // SAFETY: SockAddr's storage is a sockaddr_storage of at least addr.len() bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(
                addr.as_ptr() as *const u8,
                &mut self.storage as *mut libc::sockaddr_storage as *mut u8,
                addr.len() as usize,
            );
        }
        self.len = addr.len();
    }
}

impl fmt::Debug for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PeerAddr").field(&self.to_socket_addr()).finish()
    }
}

/// Accept on the listening socket.
#[derive(Debug)]
pub struct AcceptRequest {
    listener: RawFd,
    peer: Box<PeerAddr>,
}

impl AcceptRequest {
    pub fn new(listener: RawFd) -> Self {
        Self {
            listener,
            peer: PeerAddr::new(),
        }
    }

    pub fn listener(&self) -> RawFd {
        self.listener
    }

    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    pub(crate) fn peer_mut(&mut self) -> &mut PeerAddr {
        &mut self.peer
    }

    /// Clear the previous peer address before re-arming.
    pub fn reset(&mut self) {
        self.peer.reset();
    }
}

/// Read or write on a connection, with its own buffer.
///
/// `offset..len` is the region still to be transferred: for reads `offset` is
/// always 0 and `len` the buffer capacity, for writes it advances on partial
/// completions.
#[derive(Debug)]
pub struct IoRequest {
    conn: Handle,
    buf: Box<[u8]>,
    offset: usize,
    len: usize,
}

impl IoRequest {
    /// Read buffer of `chunk_size` bytes.
    pub fn read(conn: Handle, chunk_size: usize) -> Self {
        Self {
            conn,
            buf: vec![0u8; chunk_size].into_boxed_slice(),
            offset: 0,
            len: chunk_size,
        }
    }

    /// Write carrying its own copy of `data`.
    pub fn write(conn: Handle, data: &[u8]) -> Self {
        Self {
            conn,
            buf: data.into(),
            offset: 0,
            len: data.len(),
        }
    }

    pub fn conn(&self) -> Handle {
        self.conn
    }

    /// The first `n` bytes of the buffer (e.g. what a read produced).
    pub fn filled(&self, n: usize) -> &[u8] {
        &self.buf[..n.min(self.buf.len())]
    }

    /// Bytes not yet transferred.
    pub fn remaining(&self) -> usize {
        self.len - self.offset
    }

    /// Record `n` more bytes as transferred.
    pub fn advance(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.len);
    }

    /// Pointer and length of the untransferred region, for the facility.
    pub(crate) fn as_mut_ptr_len(&mut self) -> (*mut u8, usize) {
        let remaining = self.remaining();
        (self.buf[self.offset..].as_mut_ptr(), remaining)
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> &[u8] {
        &self.buf[self.offset..self.len]
    }

    #[cfg(test)]
    pub(crate) fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

/// In-flight records keyed by token, with O(1) lookup.
///
/// Uses a slab so tokens stay small and are reused once a completion has
/// been taken.
pub struct RequestRegistry {
    requests: Slab<Request>,
}

impl RequestRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            requests: Slab::with_capacity(capacity),
        }
    }

    /// Store a record and return its token plus a reference for building the
    /// submission.
    pub fn insert(&mut self, request: Request) -> (u64, &mut Request) {
        let entry = self.requests.vacant_entry();
        let token = entry.key() as u64;
        (token, entry.insert(request))
    }

    /// Take ownership of the record for a completed token.
    ///
    /// Returns `None` if the token is unknown or already taken.
    pub fn take(&mut self, token: u64) -> Option<Request> {
        self.requests.try_remove(token as usize)
    }

    #[cfg(test)]
    pub fn get_mut(&mut self, token: u64) -> Option<&mut Request> {
        self.requests.get_mut(token as usize)
    }

    /// Number of operations currently in flight.
    pub fn len(&self) -> usize {
        self.requests.len()
    }
}
