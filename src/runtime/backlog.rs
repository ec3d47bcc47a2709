//! Outstanding-write accounting per destination.
//!
//! Every relayed chunk becomes one in-flight write per recipient. With a
//! non-zero limit, a recipient that already has `limit` writes outstanding is
//! considered a slow consumer and gets disconnected instead of queueing more.

use crate::runtime::table::Handle;
use std::collections::HashMap;

pub struct WriteBacklog {
    pending: HashMap<Handle, usize>,
    limit: usize,
}

impl WriteBacklog {
    /// `limit == 0` disables the cap.
    pub fn new(limit: usize) -> Self {
        Self {
            pending: HashMap::new(),
            limit,
        }
    }

    /// Account for one more write to `conn`. Returns `false` if the cap is hit,
    /// in which case nothing is recorded.
    pub fn try_reserve(&mut self, conn: Handle) -> bool {
        let count = self.pending.entry(conn).or_insert(0);
        if self.limit != 0 && *count >= self.limit {
            return false;
        }
        *count += 1;
        true
    }

    /// A write to `conn` finished (successfully or not).
    pub fn release(&mut self, conn: Handle) {
        if let Some(count) = self.pending.get_mut(&conn) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.pending.remove(&conn);
            }
        }
    }

    pub fn pending(&self, conn: Handle) -> usize {
        self.pending.get(&conn).copied().unwrap_or(0)
    }
}
