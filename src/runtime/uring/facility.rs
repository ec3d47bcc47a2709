//! io_uring as a [`Facility`].
//!
//! Submissions are pushed onto the SQ without entering the kernel; they are
//! flushed when the CQ runs dry and we block for more completions, or early
//! if the SQ fills up.

use crate::runtime::facility::{Completion, Facility};
use crate::runtime::request::Request;
use io_uring::{opcode, squeue, types, IoUring};
use std::io;

pub struct UringFacility {
    ring: IoUring,
}

impl UringFacility {
    pub fn new(entries: u32) -> io::Result<Self> {
        Ok(Self {
            ring: IoUring::new(entries)?,
        })
    }

    fn push(&mut self, entry: &squeue::Entry) -> io::Result<()> {
        // SAFETY: every pointer in `entry` refers to boxed request memory that
        // the registry keeps alive until this entry's completion is taken.
        if unsafe { self.ring.submission().push(entry) }.is_ok() {
            return Ok(());
        }

        // SQ full: hand what we have to the kernel and try once more.
        self.ring.submit()?;
        unsafe { self.ring.submission().push(entry) }
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "submission queue full"))
    }
}

impl Facility for UringFacility {
    fn submit(&mut self, token: u64, request: &mut Request) -> io::Result<()> {
        let entry = match request {
            Request::Accept(req) => {
                let fd = types::Fd(req.listener());
                let (addr, addrlen) = req.peer_mut().as_mut_ptrs();
                opcode::Accept::new(fd, addr, addrlen).build()
            }
            Request::Read(req) => {
                let fd = types::Fd(req.conn().fd());
                let (ptr, len) = req.as_mut_ptr_len();
                opcode::Recv::new(fd, ptr, len as u32).build()
            }
            Request::Write(req) => {
                let fd = types::Fd(req.conn().fd());
                let (ptr, len) = req.as_mut_ptr_len();
                opcode::Write::new(fd, ptr as *const u8, len as u32).build()
            }
            Request::Shutdown(conn) => {
                opcode::Shutdown::new(types::Fd(conn.fd()), libc::SHUT_RDWR).build()
            }
            Request::Close(conn) => opcode::Close::new(types::Fd(conn.fd())).build(),
        };

        self.push(&entry.user_data(token))
    }

    fn wait(&mut self) -> io::Result<Completion> {
        loop {
            if let Some(cqe) = self.ring.completion().next() {
                return Ok(Completion {
                    token: cqe.user_data(),
                    result: cqe.result(),
                });
            }

            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}
