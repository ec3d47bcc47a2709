//! Connection table: which descriptors are live relay peers right now.
//!
//! The table only answers "is this connection active". It does not know
//! about in-flight operations; those are discovered through completions.
//!
//! Slots are indexed by descriptor and grow on demand, so lookup stays O(1)
//! and iteration is naturally in ascending descriptor order. Each slot carries
//! a generation that is bumped on every activation, which makes a [`Handle`]
//! for a closed descriptor distinguishable from a handle for a new connection
//! that the OS later assigned the same descriptor.

use std::fmt;
use std::os::unix::io::RawFd;

/// Identifies one connection for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    fd: RawFd,
    generation: u32,
}

impl Handle {
    /// A handle for a descriptor that never became an active connection
    /// (e.g. rejected at the connection limit). Never matches a table slot.
    pub fn detached(fd: RawFd) -> Self {
        Self { fd, generation: 0 }
    }

    /// The OS descriptor behind this connection.
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fd)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Slot {
    generation: u32,
    active: bool,
}

/// Map from descriptor to "is active".
pub struct ConnectionTable {
    slots: Vec<Slot>,
    active: usize,
    max_connections: usize,
}

impl ConnectionTable {
    /// Create a table. `max_connections == 0` means no limit.
    pub fn new(max_connections: usize) -> Self {
        Self {
            slots: Vec::new(),
            active: 0,
            max_connections,
        }
    }

    /// True when a new connection would exceed the configured limit.
    pub fn is_full(&self) -> bool {
        self.max_connections != 0 && self.active >= self.max_connections
    }

    /// Record a freshly accepted descriptor as active and return its handle.
    ///
    /// # Panics
    /// Panics if `fd` is negative or already active. The facility only hands
    /// out descriptors that are not in use, so either is a logic error.
    pub fn mark_active(&mut self, fd: RawFd) -> Handle {
        assert!(fd >= 0, "negative descriptor {fd}");
        let idx = fd as usize;
        if idx >= self.slots.len() {
            self.slots.resize(idx + 1, Slot::default());
        }

        let slot = &mut self.slots[idx];
        assert!(!slot.active, "descriptor {fd} is already active");

        // Generation 0 is reserved for detached handles.
        slot.generation = slot.generation.wrapping_add(1).max(1);
        slot.active = true;
        self.active += 1;

        Handle {
            fd,
            generation: slot.generation,
        }
    }

    /// Mark a connection inactive.
    ///
    /// Returns `true` only on the active -> inactive transition, so callers
    /// can issue exactly one close per connection.
    pub fn mark_inactive(&mut self, handle: Handle) -> bool {
        match self.slot_mut(handle) {
            Some(slot) if slot.active => {
                slot.active = false;
                self.active -= 1;
                true
            }
            _ => false,
        }
    }

    /// Check whether `handle` names the currently active connection on its
    /// descriptor.
    pub fn is_active(&self, handle: Handle) -> bool {
        self.slots
            .get(handle.fd as usize)
            .map(|slot| slot.active && slot.generation == handle.generation)
            .unwrap_or(false)
    }

    /// Active connections other than `exclude`, in ascending descriptor order.
    pub fn for_each_active(&self, exclude: Handle) -> impl Iterator<Item = Handle> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.active)
            .map(|(fd, slot)| Handle {
                fd: fd as RawFd,
                generation: slot.generation,
            })
            .filter(move |handle| *handle != exclude)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.active
    }

    fn slot_mut(&mut self, handle: Handle) -> Option<&mut Slot> {
        self.slots
            .get_mut(handle.fd as usize)
            .filter(|slot| slot.generation == handle.generation)
    }
}
