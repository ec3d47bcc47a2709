//! Completion dispatcher: the relay's state machine.
//!
//! One completion is handled at a time, to exhaustion, before blocking for the
//! next. Handlers receive the completed record by value and must either give
//! it back to the driver (re-armed accept/read, unfinished write) or let it
//! drop.
//!
//! | completed | result < 0 | result == 0 | result > 0 |
//! |-----------|------------|-------------|------------|
//! | accept | log, re-arm | new connection | new connection |
//! | read | disconnect | disconnect (peer closed) | fan out, re-arm |
//! | write | disconnect destination | disconnect destination | done, or continue remainder |
//! | shutdown | close | close | close |
//! | close | release | release | release |
//!
//! A connection is disconnected at most once: it is marked inactive and a
//! shutdown of both directions is submitted in the same step. The shutdown
//! makes any read or write still pending on the socket complete, and the
//! descriptor is closed once the shutdown itself completes. Completions that
//! arrive for an inactive connection only release their record.

use crate::config::Config;
use crate::error::Result;
use crate::runtime::backlog::WriteBacklog;
use crate::runtime::driver::Driver;
use crate::runtime::facility::Facility;
use crate::runtime::request::{AcceptRequest, IoRequest, Request};
use crate::runtime::table::{ConnectionTable, Handle};
use std::io;
use std::os::unix::io::RawFd;
use tracing::{debug, info, warn};

/// Relay tuning shared by the runtimes.
#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    pub chunk_size: usize,
    pub max_connections: usize,
    pub max_pending_writes: usize,
}

impl From<&Config> for RelayOptions {
    fn from(config: &Config) -> Self {
        Self {
            chunk_size: config.chunk_size,
            max_connections: config.max_connections,
            max_pending_writes: config.max_pending_writes,
        }
    }
}

pub struct Dispatcher<F> {
    driver: Driver<F>,
    table: ConnectionTable,
    backlog: WriteBacklog,
    listener: RawFd,
}

impl<F: Facility> Dispatcher<F> {
    pub fn new(facility: F, listener: RawFd, options: &RelayOptions) -> Self {
        Self {
            driver: Driver::new(facility, options.chunk_size),
            table: ConnectionTable::new(options.max_connections),
            backlog: WriteBacklog::new(options.max_pending_writes),
            listener,
        }
    }

    /// Submit the initial accept.
    pub fn start(&mut self) -> Result<()> {
        self.driver.submit_accept(self.listener)
    }

    /// Relay until the facility fails.
    pub fn run(&mut self) -> Result<()> {
        self.start()?;
        loop {
            self.step()?;
        }
    }

    /// Wait for one completion and handle it.
    pub fn step(&mut self) -> Result<()> {
        let (request, result) = self.driver.wait()?;
        match request {
            Request::Accept(req) => self.on_accept(req, result),
            Request::Read(req) => self.on_read(req, result),
            Request::Write(req) => self.on_write(req, result),
            Request::Shutdown(conn) => self.on_shutdown(conn, result),
            Request::Close(conn) => {
                on_close(conn, result);
                Ok(())
            }
        }
    }

    fn on_accept(&mut self, mut req: AcceptRequest, result: i32) -> Result<()> {
        if result < 0 {
            warn!("Accept failed: {}", io::Error::from_raw_os_error(-result));
        } else if self.table.is_full() {
            warn!(fd = result, "Connection limit reached, closing");
            self.driver.submit_close(Handle::detached(result))?;
        } else {
            let conn = self.table.mark_active(result);
            let active = self.table.len();
            match req.peer().to_socket_addr() {
                Some(peer) => info!(conn = %conn, peer = %peer, active, "Connected"),
                None => info!(conn = %conn, active, "Connected"),
            }
            self.driver.submit_read(conn)?;
        }

        // Always re-arm accept
        req.reset();
        self.driver.resubmit(Request::Accept(req))
    }

    fn on_read(&mut self, req: IoRequest, result: i32) -> Result<()> {
        let conn = req.conn();

        if !self.table.is_active(conn) {
            debug!(conn = %conn, result, "Read completed after disconnect");
            return Ok(());
        }

        if result <= 0 {
            if result < 0 {
                let err = io::Error::from_raw_os_error(-result);
                warn!(conn = %conn, "Read failed: {}", err);
            } else {
                info!(conn = %conn, "Closed by peer");
            }
            drop(req);
            return self.disconnect(conn);
        }

        let data = req.filled(result as usize);
        info!(
            conn = %conn,
            bytes = data.len(),
            "Read: {}",
            String::from_utf8_lossy(data).trim_end()
        );

        let targets: Vec<Handle> = self.table.for_each_active(conn).collect();
        for dest in targets {
            if !self.backlog.try_reserve(dest) {
                warn!(
                    conn = %dest,
                    pending = self.backlog.pending(dest),
                    "Too many pending writes, disconnecting"
                );
                self.disconnect(dest)?;
                continue;
            }
            self.driver.submit_write(dest, data)?;
        }

        self.driver.resubmit(Request::Read(req))
    }

    fn on_write(&mut self, mut req: IoRequest, result: i32) -> Result<()> {
        let conn = req.conn();

        if result < 0 || (result == 0 && req.remaining() > 0) {
            self.backlog.release(conn);
            let err = if result < 0 {
                io::Error::from_raw_os_error(-result)
            } else {
                io::Error::from(io::ErrorKind::WriteZero)
            };
            if !self.table.is_active(conn) {
                debug!(conn = %conn, "Write failed after disconnect: {}", err);
                return Ok(());
            }
            warn!(conn = %conn, "Write failed: {}", err);
            drop(req);
            return self.disconnect(conn);
        }

        req.advance(result as usize);
        if req.remaining() > 0 && self.table.is_active(conn) {
            debug!(
                conn = %conn,
                written = result,
                remaining = req.remaining(),
                "Partial write, continuing"
            );
            return self.driver.resubmit(Request::Write(req));
        }

        self.backlog.release(conn);
        Ok(())
    }

    /// Mark `conn` inactive and shut it down, once.
    fn disconnect(&mut self, conn: Handle) -> Result<()> {
        if self.table.mark_inactive(conn) {
            self.driver.submit_shutdown(conn)?;
        }
        Ok(())
    }

    fn on_shutdown(&mut self, conn: Handle, result: i32) -> Result<()> {
        if result < 0 {
            // ENOTCONN after a reset; the descriptor still needs closing
            let err = io::Error::from_raw_os_error(-result);
            debug!(conn = %conn, "Shutdown failed: {}", err);
        }
        self.driver.submit_close(conn)
    }
}

fn on_close(conn: Handle, result: i32) {
    if result < 0 {
        let err = io::Error::from_raw_os_error(-result);
        debug!(conn = %conn, "Close failed: {}", err);
    } else {
        debug!(conn = %conn, "Close complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::runtime::facility::scripted::ScriptedFacility;
    use crate::runtime::request::RequestKind;

    const LISTENER: RawFd = 3;

    fn options() -> RelayOptions {
        RelayOptions {
            chunk_size: 64,
            max_connections: 0,
            max_pending_writes: 0,
        }
    }

    struct Harness {
        relay: Dispatcher<ScriptedFacility>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_options(options())
        }

        fn with_options(options: RelayOptions) -> Self {
            let mut relay = Dispatcher::new(ScriptedFacility::default(), LISTENER, &options);
            relay.start().unwrap();
            Self { relay }
        }

        fn facility(&self) -> &ScriptedFacility {
            self.relay.driver.facility()
        }

        fn complete(&mut self, token: u64, result: i32) {
            self.relay.driver.facility_mut().push_completion(token, result);
            self.relay.step().unwrap();
        }

        fn token_of(&self, kind: RequestKind, fd: RawFd) -> u64 {
            let ops = self.facility().inflight_of(kind, fd);
            assert_eq!(ops.len(), 1, "expected one in-flight {kind} on {fd}");
            ops[0].token
        }

        fn accept(&mut self, fd: RawFd) {
            let token = self.token_of(RequestKind::Accept, LISTENER);
            if let Some(Request::Accept(req)) = self.relay.driver.request_mut(token) {
                req.peer_mut().set(([127, 0, 0, 1], 40000 + fd as u16).into());
            }
            self.complete(token, fd);
        }

        fn fail_accept(&mut self, errno: i32) {
            let token = self.token_of(RequestKind::Accept, LISTENER);
            self.complete(token, -errno);
        }

        fn send(&mut self, fd: RawFd, data: &[u8]) {
            let token = self.token_of(RequestKind::Read, fd);
            match self.relay.driver.request_mut(token) {
                Some(Request::Read(req)) => req.buf_mut()[..data.len()].copy_from_slice(data),
                other => panic!("token {token} is not a read: {other:?}"),
            }
            self.complete(token, data.len() as i32);
        }

        fn hang_up(&mut self, fd: RawFd) {
            let token = self.token_of(RequestKind::Read, fd);
            self.complete(token, 0);
        }

        fn fail_read(&mut self, fd: RawFd, errno: i32) {
            let token = self.token_of(RequestKind::Read, fd);
            self.complete(token, -errno);
        }

        /// Complete every in-flight write to `fd` in full; returns the bytes.
        fn deliver(&mut self, fd: RawFd) -> Vec<Vec<u8>> {
            let writes = self.facility().inflight_of(RequestKind::Write, fd);
            for write in &writes {
                self.complete(write.token, write.data.len() as i32);
            }
            writes.into_iter().map(|w| w.data).collect()
        }

        fn fail_writes(&mut self, fd: RawFd, errno: i32) {
            for write in self.facility().inflight_of(RequestKind::Write, fd) {
                self.complete(write.token, -errno);
            }
        }

        fn finish_shutdown(&mut self, fd: RawFd) {
            let token = self.token_of(RequestKind::Shutdown, fd);
            self.complete(token, 0);
        }

        fn finish_close(&mut self, fd: RawFd) {
            let token = self.token_of(RequestKind::Close, fd);
            self.complete(token, 0);
        }

        fn inflight(&self, kind: RequestKind, fd: RawFd) -> usize {
            self.facility().inflight_of(kind, fd).len()
        }

        fn submitted(&self, kind: RequestKind, fd: RawFd) -> usize {
            self.facility()
                .history
                .iter()
                .filter(|s| s.kind == kind && s.fd == fd)
                .count()
        }

        fn active(&self) -> Vec<RawFd> {
            self.relay
                .table
                .for_each_active(Handle::detached(-1))
                .map(|h| h.fd())
                .collect()
        }
    }

    #[test]
    fn test_broadcast_scenario() {
        let (a, b, c) = (5, 6, 7);
        let mut h = Harness::new();
        h.accept(a);
        h.accept(b);
        h.accept(c);

        h.send(a, b"hi");
        assert_eq!(h.deliver(b), vec![b"hi".to_vec()]);
        assert_eq!(h.deliver(c), vec![b"hi".to_vec()]);
        assert_eq!(h.submitted(RequestKind::Write, a), 0);

        h.hang_up(b);
        assert_eq!(h.active(), vec![a, c]);
        assert_eq!(h.inflight(RequestKind::Shutdown, b), 1);

        h.send(a, b"yo");
        assert_eq!(h.inflight(RequestKind::Write, b), 0);
        assert_eq!(h.deliver(c), vec![b"yo".to_vec()]);

        // Forced write failure on C
        h.send(a, b"zz");
        h.fail_writes(c, libc::EPIPE);
        assert_eq!(h.active(), vec![a]);
        assert_eq!(h.inflight(RequestKind::Shutdown, c), 1);

        // A keeps relaying
        assert_eq!(h.inflight(RequestKind::Read, a), 1);
        h.accept(8);
        h.send(a, b"ok");
        assert_eq!(h.deliver(8), vec![b"ok".to_vec()]);
    }

    #[test]
    fn test_accept_always_rearmed() {
        let mut h = Harness::new();
        h.accept(5);
        h.fail_accept(libc::EMFILE);
        h.accept(6);
        h.fail_accept(libc::ECONNABORTED);

        // 4 completions: initial accept + 4 re-arms
        assert_eq!(h.facility().count(RequestKind::Accept), 5);
        assert_eq!(h.inflight(RequestKind::Accept, LISTENER), 1);
        assert_eq!(h.active(), vec![5, 6]);
    }

    #[test]
    fn test_immediate_hang_up_never_relays() {
        let mut h = Harness::new();
        h.accept(5);
        h.hang_up(5);
        assert!(h.active().is_empty());
        assert_eq!(h.inflight(RequestKind::Shutdown, 5), 1);

        h.accept(6);
        h.accept(7);
        h.send(6, b"x");
        assert_eq!(h.submitted(RequestKind::Write, 5), 0);
        assert_eq!(h.submitted(RequestKind::Write, 7), 1);
    }

    #[test]
    fn test_read_fans_out_to_every_other_peer_once() {
        let mut h = Harness::new();
        for fd in [5, 6, 7, 8] {
            h.accept(fd);
        }

        h.send(6, b"x");
        assert_eq!(h.facility().count(RequestKind::Write), 3);
        assert_eq!(h.submitted(RequestKind::Read, 6), 2);
        assert_eq!(h.inflight(RequestKind::Read, 6), 1);
    }

    #[test]
    fn test_fan_out_in_ascending_descriptor_order() {
        let mut h = Harness::new();
        h.accept(9);
        h.accept(4);
        h.accept(6);

        h.send(6, b"x");
        let order: Vec<RawFd> = h
            .facility()
            .history
            .iter()
            .filter(|s| s.kind == RequestKind::Write)
            .map(|s| s.fd)
            .collect();
        assert_eq!(order, vec![4, 9]);
    }

    #[test]
    fn test_read_error_disconnects() {
        let mut h = Harness::new();
        h.accept(5);
        h.accept(6);
        h.fail_read(5, libc::ECONNRESET);

        assert_eq!(h.active(), vec![6]);
        assert_eq!(h.inflight(RequestKind::Shutdown, 5), 1);
        assert_eq!(h.inflight(RequestKind::Read, 5), 0);

        // The others are unaffected
        h.accept(7);
        h.send(6, b"still here");
        assert_eq!(h.deliver(7), vec![b"still here".to_vec()]);
    }

    #[test]
    fn test_close_completion_releases_record() {
        let mut h = Harness::new();
        h.accept(5);
        assert_eq!(h.relay.driver.in_flight(), 2);

        h.hang_up(5);
        assert_eq!(h.relay.driver.in_flight(), 2);
        assert_eq!(h.inflight(RequestKind::Close, 5), 0);

        // Close follows the shutdown, not the disconnect
        h.finish_shutdown(5);
        assert_eq!(h.inflight(RequestKind::Close, 5), 1);
        assert_eq!(h.relay.driver.in_flight(), 2);

        h.finish_close(5);
        assert_eq!(h.relay.driver.in_flight(), 1);
        assert_eq!(h.facility().count(RequestKind::Shutdown), 1);
        assert_eq!(h.facility().count(RequestKind::Close), 1);
    }

    #[test]
    fn test_late_read_after_disconnect_is_released() {
        let mut h = Harness::new();
        h.accept(5);
        h.accept(6);

        h.send(5, b"a");
        h.fail_writes(6, libc::EPIPE);
        assert_eq!(h.active(), vec![5]);

        // 6's read was still outstanding and now brings data
        let before = h.facility().count(RequestKind::Write);
        h.send(6, b"late");
        assert_eq!(h.facility().count(RequestKind::Write), before);
        assert_eq!(h.inflight(RequestKind::Read, 6), 0);
        assert_eq!(h.submitted(RequestKind::Shutdown, 6), 1);
    }

    #[test]
    fn test_write_failures_close_once() {
        let mut h = Harness::new();
        h.accept(5);
        h.accept(6);

        h.send(5, b"a");
        h.send(5, b"b");
        assert_eq!(h.inflight(RequestKind::Write, 6), 2);

        h.fail_writes(6, libc::EPIPE);
        assert_eq!(h.submitted(RequestKind::Shutdown, 6), 1);
        h.finish_shutdown(6);
        assert_eq!(h.submitted(RequestKind::Close, 6), 1);
    }

    #[test]
    fn test_stale_write_error_spares_reused_descriptor() {
        let mut h = Harness::new();
        h.accept(5);
        h.accept(6);
        h.send(5, b"a");

        h.hang_up(6);
        h.finish_shutdown(6);
        h.finish_close(6);
        // OS hands descriptor 6 to a new peer while the old write is pending
        h.accept(6);
        assert_eq!(h.active(), vec![5, 6]);

        h.fail_writes(6, libc::EPIPE);
        assert_eq!(h.active(), vec![5, 6]);
        assert_eq!(h.submitted(RequestKind::Shutdown, 6), 1);

        h.send(5, b"b");
        assert_eq!(h.deliver(6), vec![b"b".to_vec()]);
    }

    #[test]
    fn test_partial_write_continues() {
        let mut h = Harness::new();
        h.accept(5);
        h.accept(6);
        h.send(5, b"abcdef");

        let token = h.token_of(RequestKind::Write, 6);
        h.complete(token, 4);

        assert_eq!(h.deliver(6), vec![b"ef".to_vec()]);
        assert_eq!(h.inflight(RequestKind::Write, 6), 0);
        let dest = h
            .relay
            .table
            .for_each_active(Handle::detached(-1))
            .find(|conn| conn.fd() == 6)
            .unwrap();
        assert_eq!(h.relay.backlog.pending(dest), 0);
    }

    #[test]
    fn test_zero_byte_write_disconnects() {
        let mut h = Harness::new();
        h.accept(5);
        h.accept(6);
        h.send(5, b"abc");

        let token = h.token_of(RequestKind::Write, 6);
        h.complete(token, 0);
        assert_eq!(h.active(), vec![5]);
        assert_eq!(h.inflight(RequestKind::Shutdown, 6), 1);
    }

    #[test]
    fn test_slow_consumer_disconnected() {
        let mut h = Harness::with_options(RelayOptions {
            max_pending_writes: 2,
            ..options()
        });
        h.accept(5);
        h.accept(6);
        h.accept(7);

        h.send(5, b"1");
        h.send(5, b"2");
        h.deliver(7);
        h.send(5, b"3");

        // 6 never drained and is dropped, 7 keeps receiving
        assert_eq!(h.active(), vec![5, 7]);
        assert_eq!(h.submitted(RequestKind::Write, 6), 2);
        assert_eq!(h.inflight(RequestKind::Shutdown, 6), 1);
        assert_eq!(h.deliver(7), vec![b"3".to_vec()]);
    }

    #[test]
    fn test_slow_consumer_pending_operations_drain_after_shutdown() {
        let mut h = Harness::with_options(RelayOptions {
            max_pending_writes: 1,
            ..options()
        });
        h.accept(5);
        h.accept(6);
        h.send(5, b"1");
        h.send(5, b"2");
        assert_eq!(h.active(), vec![5]);

        // Shutting the socket down wakes its stalled read and write
        h.finish_shutdown(6);
        h.hang_up(6);
        h.fail_writes(6, libc::EPIPE);
        assert_eq!(h.inflight(RequestKind::Read, 6), 0);
        assert_eq!(h.inflight(RequestKind::Write, 6), 0);

        h.finish_close(6);
        // Only 5's read and the accept remain
        assert_eq!(h.relay.driver.in_flight(), 2);
        assert_eq!(h.facility().count(RequestKind::Close), 1);
    }

    #[test]
    fn test_shutdown_failure_still_closes() {
        let mut h = Harness::new();
        h.accept(5);
        h.fail_read(5, libc::ECONNRESET);

        let token = h.token_of(RequestKind::Shutdown, 5);
        h.complete(token, -libc::ENOTCONN);
        assert_eq!(h.inflight(RequestKind::Close, 5), 1);
    }

    #[test]
    fn test_failed_close_releases_record() {
        let mut h = Harness::new();
        h.accept(5);
        h.hang_up(5);
        h.finish_shutdown(5);

        let token = h.token_of(RequestKind::Close, 5);
        h.complete(token, -libc::EBADF);
        assert_eq!(h.inflight(RequestKind::Close, 5), 0);
        assert_eq!(h.relay.driver.in_flight(), 1);
        assert_eq!(h.facility().count(RequestKind::Close), 1);
    }

    #[test]
    fn test_late_write_success_releases_backlog() {
        let mut h = Harness::with_options(RelayOptions {
            max_pending_writes: 4,
            ..options()
        });
        h.accept(5);
        h.accept(6);
        let old = h
            .relay
            .table
            .for_each_active(Handle::detached(-1))
            .find(|conn| conn.fd() == 6)
            .unwrap();

        h.send(5, b"a");
        h.send(5, b"b");
        assert_eq!(h.relay.backlog.pending(old), 2);

        h.hang_up(6);
        // Both writes land in full after the disconnect
        assert_eq!(h.deliver(6).len(), 2);
        assert_eq!(h.relay.backlog.pending(old), 0);
        assert_eq!(h.submitted(RequestKind::Write, 6), 2);

        // Accept, 5's read and 6's shutdown
        assert_eq!(h.relay.driver.in_flight(), 3);
    }

    #[test]
    fn test_connection_limit() {
        let mut h = Harness::with_options(RelayOptions {
            max_connections: 1,
            ..options()
        });
        h.accept(5);
        h.accept(6);

        assert_eq!(h.active(), vec![5]);
        assert_eq!(h.inflight(RequestKind::Close, 6), 1);
        assert_eq!(h.submitted(RequestKind::Read, 6), 0);
        assert_eq!(h.inflight(RequestKind::Accept, LISTENER), 1);
    }

    #[test]
    fn test_wait_failure_is_fatal() {
        let mut relay = Dispatcher::new(ScriptedFacility::default(), LISTENER, &options());
        assert!(matches!(relay.run(), Err(Error::Wait(_))));
        assert_eq!(relay.driver.facility().count(RequestKind::Accept), 1);
    }
}
