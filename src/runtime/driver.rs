//! Submission driver: issues accept/read/write/shutdown/close operations.
//!
//! Each submit call stores a fresh (or re-armed) record in the registry and
//! hands the facility its token. Nothing here blocks; outcomes come back
//! through [`Driver::wait`].

use crate::error::{Error, Result};
use crate::runtime::facility::Facility;
use crate::runtime::request::{AcceptRequest, IoRequest, Request, RequestRegistry};
use crate::runtime::table::Handle;
use std::os::unix::io::RawFd;
use tracing::{trace, warn};

pub struct Driver<F> {
    facility: F,
    requests: RequestRegistry,
    chunk_size: usize,
}

impl<F: Facility> Driver<F> {
    pub fn new(facility: F, chunk_size: usize) -> Self {
        Self {
            facility,
            requests: RequestRegistry::new(64),
            chunk_size,
        }
    }

    /// Wait for the next completion on the listening socket.
    pub fn submit_accept(&mut self, listener: RawFd) -> Result<()> {
        self.push(Request::Accept(AcceptRequest::new(listener)))
    }

    /// Read up to one chunk from `conn` into a new buffer.
    pub fn submit_read(&mut self, conn: Handle) -> Result<()> {
        self.push(Request::Read(IoRequest::read(conn, self.chunk_size)))
    }

    /// Write a private copy of `data` to `conn`.
    pub fn submit_write(&mut self, conn: Handle, data: &[u8]) -> Result<()> {
        self.push(Request::Write(IoRequest::write(conn, data)))
    }

    /// Shut down both directions of `conn` without releasing the descriptor.
    pub fn submit_shutdown(&mut self, conn: Handle) -> Result<()> {
        self.push(Request::Shutdown(conn))
    }

    /// Close `conn`'s descriptor.
    pub fn submit_close(&mut self, conn: Handle) -> Result<()> {
        self.push(Request::Close(conn))
    }

    /// Submit a record taken from a completion again (re-arm an accept or
    /// read, or continue a partial write).
    pub fn resubmit(&mut self, request: Request) -> Result<()> {
        self.push(request)
    }

    /// Block for the next completion and take back its record.
    ///
    /// Completions with tokens we never issued are logged and skipped.
    pub fn wait(&mut self) -> Result<(Request, i32)> {
        loop {
            let completion = self.facility.wait().map_err(Error::Wait)?;
            match self.requests.take(completion.token) {
                Some(request) => {
                    trace!(
                        kind = %request.kind(),
                        fd = request.fd(),
                        result = completion.result,
                        in_flight = self.requests.len(),
                        "Completion"
                    );
                    return Ok((request, completion.result));
                }
                None => warn!("Unknown token in completion: {}", completion.token),
            }
        }
    }

    /// Number of operations in flight.
    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.requests.len()
    }

    fn push(&mut self, request: Request) -> Result<()> {
        let (token, request) = self.requests.insert(request);
        if let Err(e) = self.facility.submit(token, request) {
            self.requests.take(token);
            return Err(Error::Submit(e));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn facility_mut(&mut self) -> &mut F {
        &mut self.facility
    }

    #[cfg(test)]
    pub(crate) fn facility(&self) -> &F {
        &self.facility
    }

    #[cfg(test)]
    pub(crate) fn request_mut(&mut self, token: u64) -> Option<&mut Request> {
        self.requests.get_mut(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::facility::scripted::ScriptedFacility;
    use crate::runtime::request::RequestKind;

    #[test]
    fn test_submissions_are_tracked_until_completion() {
        let mut driver = Driver::new(ScriptedFacility::default(), 16);
        let conn = Handle::detached(5);

        driver.submit_accept(3).unwrap();
        driver.submit_read(conn).unwrap();
        driver.submit_write(conn, b"abc").unwrap();
        driver.submit_shutdown(conn).unwrap();
        driver.submit_close(conn).unwrap();
        assert_eq!(driver.in_flight(), 5);

        let write = driver.facility().history[2].clone();
        assert_eq!(write.kind, RequestKind::Write);
        assert_eq!(write.data, b"abc");

        driver.facility_mut().push_completion(write.token, 3);
        let (request, result) = driver.wait().unwrap();
        assert_eq!(request.kind(), RequestKind::Write);
        assert_eq!(result, 3);
        assert_eq!(driver.in_flight(), 4);
        assert_eq!(driver.facility().history[3].kind, RequestKind::Shutdown);
    }

    #[test]
    fn test_unknown_token_skipped() {
        let mut driver = Driver::new(ScriptedFacility::default(), 16);
        driver.submit_close(Handle::detached(5)).unwrap();
        let token = driver.facility().history[0].token;

        driver.facility_mut().push_completion(999, 0);
        driver.facility_mut().push_completion(token, 0);

        let (request, _) = driver.wait().unwrap();
        assert_eq!(request.kind(), RequestKind::Close);
    }

    #[test]
    fn test_failed_submit_releases_record() {
        let mut driver = Driver::new(ScriptedFacility::default(), 16);
        driver.facility_mut().fail_submit = true;

        let result = driver.submit_read(Handle::detached(5));
        assert!(matches!(result, Err(Error::Submit(_))));
        assert_eq!(driver.in_flight(), 0);
    }

    #[test]
    fn test_wait_failure_is_reported() {
        let mut driver = Driver::new(ScriptedFacility::default(), 16);
        assert!(matches!(driver.wait(), Err(Error::Wait(_))));
    }
}
