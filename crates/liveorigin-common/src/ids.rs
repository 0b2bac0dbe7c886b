//! Typed ID wrappers for sessions and producers.
//!
//! IDs are allocated from counters owned by the server context rather than
//! from a process-wide generator, so two servers in one process never share
//! state.

use serde::{Deserialize, Serialize};

/// Identifier of one accepted connection or HTTP/2 stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl From<u64> for SessionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// Identifier of one live input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProducerId(u64);

impl From<u64> for ProducerId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for ProducerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Monotonic counter handing out IDs of one kind.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    /// Create a counter starting at 1.
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Hand out the next raw value.
    pub fn next_raw(&mut self) -> u64 {
        // Default-constructed allocators start at 0; skip it so 0 is never issued.
        if self.next == 0 {
            self.next = 1;
        }
        let id = self.next;
        self.next += 1;
        id
    }

    /// Hand out the next ID of type `T`.
    pub fn next<T: From<u64>>(&mut self) -> T {
        T::from(self.next_raw())
    }
}
