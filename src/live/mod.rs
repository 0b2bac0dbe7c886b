//! Live inputs and their fan-out to readers.
//!
//! A [`Producer`] writes one resource at a time. Readers never receive pushed
//! data: each send step re-reads the shared [`Progress`] of the resource and
//! sends whatever became available since.

mod producer;
mod registry;

pub use producer::{HistoryEntry, Producer};
pub use registry::{LiveResource, ProducerRegistry, SideLink};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Where a resource's bytes are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceLocation {
    /// A file on disk.
    Disk(PathBuf),
    /// A node of the memory store, keyed by URL path.
    Memory(String),
}

/// Write progress of one resource, shared between its producer and readers.
#[derive(Debug, Default)]
pub struct Progress {
    written: AtomicU64,
    finished: AtomicBool,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn advance(&self, bytes: u64) {
        self.written.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }
}
