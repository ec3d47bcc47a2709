//! The asynchronous I/O facility the relay is built on.
//!
//! A facility accepts operations described by [`Request`] records and later
//! reports their outcome as [`Completion`]s, in whatever order the environment
//! finishes them. On Linux this is io_uring; tests use a scripted facility.

use crate::runtime::request::Request;
use std::io;

/// Outcome of one submitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Token the operation was submitted with.
    pub token: u64,
    /// Byte count or new descriptor when `>= 0`, negated errno when `< 0`.
    pub result: i32,
}

pub trait Facility {
    /// Queue one operation tagged with `token`. Must not block.
    ///
    /// The facility may keep raw pointers into `request`'s boxed payload
    /// (buffers, accept address) until the matching completion is returned
    /// by [`wait`](Facility::wait); the caller keeps the record alive and
    /// untouched until then.
    fn submit(&mut self, token: u64, request: &mut Request) -> io::Result<()>;

    /// Block until exactly one operation has completed.
    fn wait(&mut self) -> io::Result<Completion>;
}
