//! In-memory file nodes with counted reader handles.
//!
//! A name maps to at most one live node. Creating a name that already exists
//! supersedes the old node: it leaves the namespace immediately, but if
//! readers still hold it, it is parked on the pending list and purged the
//! moment its last [`MemReader`] is dropped. Reads in flight therefore always
//! complete against the bytes they started on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use liveorigin_common::{Error, ProducerId, Result};

/// Snapshot of a node's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub size: u64,
    pub finished: bool,
    pub is_static: bool,
    pub readers: usize,
    pub owner: Option<ProducerId>,
}

#[derive(Debug)]
struct MemNode {
    name: String,
    data: RwLock<Vec<u8>>,
    readers: AtomicUsize,
    pending_removal: AtomicBool,
    finished: AtomicBool,
    is_static: bool,
    owner: Option<ProducerId>,
}

impl MemNode {
    fn info(&self) -> NodeInfo {
        NodeInfo {
            size: self.data.read().len() as u64,
            finished: self.finished.load(Ordering::Acquire),
            is_static: self.is_static,
            readers: self.readers.load(Ordering::Acquire),
            owner: self.owner,
        }
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    live: HashMap<String, Arc<MemNode>>,
    pending: Vec<Arc<MemNode>>,
}

impl StoreInner {
    /// Take `node` out of service, parking it if readers still hold it.
    fn retire(&mut self, node: Arc<MemNode>) {
        node.pending_removal.store(true, Ordering::Release);
        let readers = node.readers.load(Ordering::Acquire);
        if readers > 0 {
            debug!(name = %node.name, readers, "memory node parked until readers finish");
            self.pending.push(node);
        } else {
            trace!(name = %node.name, "memory node freed");
        }
    }
}

/// Named in-memory file store.
///
/// Cloning is cheap and yields a handle to the same store.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or supersede) the node `name` and return its writer.
    ///
    /// Static nodes are never purged by time-shift eviction.
    pub fn create(&self, name: &str, owner: Option<ProducerId>, is_static: bool) -> MemWriter {
        let node = Arc::new(MemNode {
            name: name.to_owned(),
            data: RwLock::new(Vec::new()),
            readers: AtomicUsize::new(0),
            pending_removal: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            is_static,
            owner,
        });
        let mut inner = self.inner.lock();
        if let Some(old) = inner.live.insert(name.to_owned(), Arc::clone(&node)) {
            inner.retire(old);
        }
        MemWriter { node }
    }

    /// Open `name` for reading, counting the reader until the handle drops.
    pub fn open_read(&self, name: &str) -> Option<MemReader> {
        let inner = self.inner.lock();
        let node = inner.live.get(name)?;
        node.readers.fetch_add(1, Ordering::AcqRel);
        let snapshot_len = node.data.read().len() as u64;
        Some(MemReader {
            node: Arc::clone(node),
            store: Arc::downgrade(&self.inner),
            snapshot_len,
        })
    }

    /// Reopen an existing node for writing (e.g. a byte-range patch).
    pub fn open_write(&self, name: &str) -> Option<MemWriter> {
        let inner = self.inner.lock();
        inner.live.get(name).map(|node| MemWriter {
            node: Arc::clone(node),
        })
    }

    /// Remove `name` from the namespace. Returns whether it existed.
    pub fn remove(&self, name: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.live.remove(name) {
            Some(node) => {
                inner.retire(node);
                true
            }
            None => false,
        }
    }

    /// Remove `name` unless it is a static node. Returns whether it was removed.
    pub fn evict(&self, name: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.live.get(name) {
            Some(node) if node.is_static => false,
            Some(_) => {
                if let Some(node) = inner.live.remove(name) {
                    inner.retire(node);
                }
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().live.contains_key(name)
    }

    pub fn stat(&self, name: &str) -> Option<NodeInfo> {
        self.inner.lock().live.get(name).map(|n| n.info())
    }

    /// Live names under `prefix`, sorted.
    pub fn names_under(&self, prefix: &str) -> Vec<String> {
        let inner = self.inner.lock();
        let mut names: Vec<String> = inner
            .live
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Number of superseded nodes still held by readers.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Drop any parked node whose readers are gone. Returns how many were freed.
    ///
    /// Reader handles already purge on drop; this is a sweep for the event
    /// loop's periodic garbage collection.
    pub fn purge_pending(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.pending.len();
        inner
            .pending
            .retain(|n| n.readers.load(Ordering::Acquire) > 0);
        before - inner.pending.len()
    }
}

/// Write handle to one node.
#[derive(Debug, Clone)]
pub struct MemWriter {
    node: Arc<MemNode>,
}

impl MemWriter {
    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Append bytes.
    pub fn write(&self, data: &[u8]) {
        self.node.data.write().extend_from_slice(data);
    }

    /// Overwrite bytes inside the current extent. Growing the node this way
    /// is refused.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut buf = self.node.data.write();
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| Error::range("patch window overflows"))?;
        if end > buf.len() as u64 {
            return Err(Error::range(format!(
                "patch {offset}..{end} beyond node of {} bytes",
                buf.len()
            )));
        }
        buf[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.node.data.read().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the node complete; tailing readers stop once they reach the end.
    pub fn finish(&self) {
        self.node.finished.store(true, Ordering::Release);
    }

    /// Whether this writer's node was superseded or removed.
    pub fn is_detached(&self) -> bool {
        self.node.pending_removal.load(Ordering::Acquire)
    }
}

/// Counted read handle to one node.
#[derive(Debug)]
pub struct MemReader {
    node: Arc<MemNode>,
    store: Weak<Mutex<StoreInner>>,
    snapshot_len: u64,
}

impl MemReader {
    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Size when the handle was opened.
    pub fn snapshot_len(&self) -> u64 {
        self.snapshot_len
    }

    /// Current size, for tailing a node that is still written.
    pub fn len(&self) -> u64 {
        self.node.data.read().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_finished(&self) -> bool {
        self.node.finished.load(Ordering::Acquire)
    }

    pub fn owner(&self) -> Option<ProducerId> {
        self.node.owner
    }

    /// Copy bytes starting at `offset` into `buf`. Returns the count copied,
    /// 0 at the current end.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let data = self.node.data.read();
        let len = data.len() as u64;
        if offset >= len {
            return 0;
        }
        let n = ((len - offset) as usize).min(buf.len());
        let start = offset as usize;
        buf[..n].copy_from_slice(&data[start..start + n]);
        n
    }
}

impl Clone for MemReader {
    fn clone(&self) -> Self {
        self.node.readers.fetch_add(1, Ordering::AcqRel);
        Self {
            node: Arc::clone(&self.node),
            store: self.store.clone(),
            snapshot_len: self.snapshot_len,
        }
    }
}

impl Drop for MemReader {
    fn drop(&mut self) {
        let remaining = self.node.readers.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && self.node.pending_removal.load(Ordering::Acquire) {
            if let Some(store) = self.store.upgrade() {
                let mut inner = store.lock();
                inner.pending.retain(|n| !Arc::ptr_eq(n, &self.node));
                trace!(name = %self.node.name, "parked memory node purged");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let store = MemStore::new();
        let w = store.create("/live/seg1.m4s", None, false);
        w.write(b"hello");
        let r = store.open_read("/live/seg1.m4s").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(r.read_at(0, &mut buf), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(r.read_at(5, &mut buf), 0);
    }

    #[test]
    fn reader_sees_growth_but_keeps_snapshot() {
        let store = MemStore::new();
        let w = store.create("a", None, false);
        w.write(b"abc");
        let r = store.open_read("a").unwrap();
        w.write(b"def");
        assert_eq!(r.snapshot_len(), 3);
        assert_eq!(r.len(), 6);
        assert!(!r.is_finished());
        w.finish();
        assert!(r.is_finished());
    }

    #[test]
    fn superseded_node_survives_until_readers_drop() {
        let store = MemStore::new();
        let old = store.create("seg", None, false);
        old.write(b"old-bytes");
        let reader = store.open_read("seg").unwrap();

        let new = store.create("seg", None, false);
        new.write(b"new");
        assert!(old.is_detached());
        assert_eq!(store.pending_count(), 1);

        // In-flight read still sees the old content.
        let mut buf = [0u8; 9];
        assert_eq!(reader.read_at(0, &mut buf), 9);
        assert_eq!(&buf, b"old-bytes");

        // New opens see the new node.
        let fresh = store.open_read("seg").unwrap();
        assert_eq!(fresh.len(), 3);

        drop(reader);
        assert_eq!(store.pending_count(), 0);
        assert_eq!(store.stat("seg").unwrap().readers, 1);
    }

    #[test]
    fn cloned_reader_counts_separately() {
        let store = MemStore::new();
        store.create("x", None, false).write(b"1");
        let r1 = store.open_read("x").unwrap();
        let r2 = r1.clone();
        assert!(store.remove("x"));
        drop(r1);
        assert_eq!(store.pending_count(), 1);
        drop(r2);
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn remove_without_readers_frees_immediately() {
        let store = MemStore::new();
        store.create("x", None, false);
        assert!(store.remove("x"));
        assert!(!store.remove("x"));
        assert_eq!(store.pending_count(), 0);
        assert!(store.open_read("x").is_none());
    }

    #[test]
    fn evict_spares_static_nodes() {
        let store = MemStore::new();
        store.create("init.mp4", None, true);
        store.create("seg.m4s", None, false);
        assert!(!store.evict("init.mp4"));
        assert!(store.evict("seg.m4s"));
        assert!(store.contains("init.mp4"));
    }

    #[test]
    fn patch_stays_within_extent() {
        let store = MemStore::new();
        let w = store.create("p", None, false);
        w.write(b"0123456789");
        w.write_at(2, b"ab").unwrap();
        assert!(w.write_at(9, b"xy").is_err());
        let r = store.open_read("p").unwrap();
        let mut buf = [0u8; 10];
        r.read_at(0, &mut buf);
        assert_eq!(&buf, b"01ab456789");
    }

    #[test]
    fn names_under_prefix() {
        let store = MemStore::new();
        store.create("/live/b", None, false);
        store.create("/live/a", None, false);
        store.create("/vod/c", None, false);
        assert_eq!(store.names_under("/live/"), vec!["/live/a", "/live/b"]);
    }
}
