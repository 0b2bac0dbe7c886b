//! Registry of live producers.
//!
//! The registry owns every [`Producer`], the name index used by the
//! resolver, and the deletions deferred until no reader pins a file.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use liveorigin_common::{Error, IdAllocator, ProducerId, Result};
use liveorigin_vfs::{MemStore, PinTable};

use super::producer::{OpenResource, SideFile, Target};
use super::{HistoryEntry, Producer, Progress, ResourceLocation};
use crate::config::LiveConfig;

/// A resource currently being produced, as seen by a reader.
#[derive(Debug, Clone)]
pub struct LiveResource {
    pub producer: ProducerId,
    pub name: String,
    pub location: ResourceLocation,
    pub progress: Arc<Progress>,
    /// Tune-in offset for readers joining mid-stream (main resource only).
    pub tune_in: Option<u64>,
    /// Set when the resource is a side-file.
    pub side: Option<SideLink>,
}

/// How a side-file reader continues in the main resource.
#[derive(Debug, Clone)]
pub struct SideLink {
    pub main_location: ResourceLocation,
    pub main_progress: Arc<Progress>,
    pub base_offset: u64,
}

/// All producers of one server.
#[derive(Debug)]
pub struct ProducerRegistry {
    ids: IdAllocator,
    producers: HashMap<ProducerId, Producer>,
    by_name: HashMap<String, ProducerId>,
    store: MemStore,
    pins: PinTable,
    pending_deletes: Vec<PathBuf>,
    config: LiveConfig,
}

impl ProducerRegistry {
    pub fn new(config: LiveConfig, store: MemStore, pins: PinTable) -> Self {
        Self {
            ids: IdAllocator::new(),
            producers: HashMap::new(),
            by_name: HashMap::new(),
            store,
            pins,
            pending_deletes: Vec::new(),
            config,
        }
    }

    /// Register a new producer. `label` is only used for logging.
    pub fn create(&mut self, label: &str) -> ProducerId {
        let id: ProducerId = self.ids.next();
        self.producers
            .insert(id, Producer::new(id, label.to_owned(), self.config.hold));
        debug!(producer = %id, label, "producer registered");
        id
    }

    pub fn get(&self, id: ProducerId) -> Option<&Producer> {
        self.producers.get(&id)
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    fn producer_mut(&mut self, id: ProducerId) -> Result<&mut Producer> {
        self.producers
            .get_mut(&id)
            .ok_or_else(|| Error::internal(format!("unknown producer {id}")))
    }

    /// Whether `name` is being written by a producer other than `except`.
    fn claimed_by_other(&self, name: &str, except: Option<ProducerId>) -> Option<ProducerId> {
        let owner = *self.by_name.get(name)?;
        if Some(owner) == except {
            return None;
        }
        let producer = self.producers.get(&owner)?;
        let writing = producer.current_name() == Some(name) || producer.side_name() == Some(name);
        (writing && !producer.finished).then_some(owner)
    }

    /// Reject a claim on `name` while another producer writes it.
    pub fn check_claim(&self, name: &str) -> Result<()> {
        match self.claimed_by_other(name, None) {
            Some(owner) => Err(Error::Conflict(format!(
                "{name} is already being produced by {owner}"
            ))),
            None => Ok(()),
        }
    }

    fn open_target(
        &self,
        id: ProducerId,
        location: &ResourceLocation,
        is_static: bool,
    ) -> io::Result<Target> {
        match location {
            ResourceLocation::Disk(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                // Unlink first so readers of the previous version keep their inode.
                match fs::remove_file(path) {
                    Ok(()) => trace!(path = %path.display(), "superseded previous file"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
                Ok(Target::File(File::create(path)?))
            }
            ResourceLocation::Memory(key) => {
                Ok(Target::Memory(self.store.create(key, Some(id), is_static)))
            }
        }
    }

    /// Count an upstream failure and disconnect the producer past the retry limit.
    fn record_failure(&mut self, id: ProducerId, err: &io::Error) -> Error {
        let max = self.config.max_write_retries;
        let Some(producer) = self.producers.get_mut(&id) else {
            return Error::upstream(err.to_string());
        };
        producer.consecutive_errors += 1;
        error!(
            producer = %id,
            errors = producer.consecutive_errors,
            "upstream write failed: {}",
            err
        );
        if producer.consecutive_errors > max && !producer.disconnected {
            warn!(producer = %id, "too many upstream failures, disconnecting producer");
            producer.disconnected = true;
            if let Some(mut current) = producer.current.take() {
                let _ = current.finish();
                self.by_name.remove(&current.name);
            }
            if let Some(mut side) = producer.side.take() {
                let _ = side.resource.finish();
                self.by_name.remove(&side.resource.name);
            }
        }
        Error::upstream(err.to_string())
    }

    /// Open `name` as the producer's current resource.
    ///
    /// The previous resource, if any, is closed and rotated into the
    /// time-shift history.
    pub fn open(
        &mut self,
        id: ProducerId,
        name: &str,
        location: ResourceLocation,
        is_static: bool,
    ) -> Result<()> {
        if self.producer_mut(id)?.disconnected {
            return Err(Error::upstream(format!("producer {id} is disconnected")));
        }
        if let Some(owner) = self.claimed_by_other(name, Some(id)) {
            return Err(Error::Conflict(format!(
                "{name} is already being produced by {owner}"
            )));
        }
        self.close_current(id)?;
        // Opening a name retires its previous version, so an older history
        // entry of that name must never evict the new one.
        self.producer_mut(id)?
            .history
            .retain(|entry| entry.name != name);

        let target = match self.open_target(id, &location, is_static) {
            Ok(t) => t,
            Err(e) => return Err(self.record_failure(id, &e)),
        };
        let producer = self.producer_mut(id)?;
        producer.consecutive_errors = 0;
        producer.tune_in = None;
        producer.current = Some(OpenResource::new(
            name.to_owned(),
            location,
            is_static,
            target,
        ));
        self.by_name.insert(name.to_owned(), id);
        info!(producer = %id, name, "resource opened");
        Ok(())
    }

    /// Append bytes to the current resource (and open side-file).
    pub fn write(&mut self, id: ProducerId, data: &[u8]) -> Result<()> {
        let producer = self.producer_mut(id)?;
        if producer.disconnected {
            return Err(Error::upstream(format!("producer {id} is disconnected")));
        }
        if producer.current.is_none() {
            return Err(Error::internal(format!("producer {id} has no open resource")));
        }
        match producer.append(data) {
            Ok(()) => {
                producer.consecutive_errors = 0;
                trace!(producer = %id, bytes = data.len(), "producer write");
                Ok(())
            }
            Err(e) => Err(self.record_failure(id, &e)),
        }
    }

    /// Append one media unit. A sync point (decodable start) becomes the
    /// tune-in offset for readers joining mid-stream.
    pub fn write_unit(&mut self, id: ProducerId, data: &[u8], sync_point: bool) -> Result<()> {
        if sync_point {
            let producer = self.producer_mut(id)?;
            if let Some(current) = producer.current.as_ref() {
                producer.tune_in = Some(current.progress.written());
            }
        }
        self.write(id, data)
    }

    /// Open a side-file nested in the current resource at its current end.
    pub fn open_side(&mut self, id: ProducerId, name: &str, location: ResourceLocation) -> Result<()> {
        if self.producer_mut(id)?.current.is_none() {
            return Err(Error::internal(format!("producer {id} has no open resource")));
        }
        if let Some(owner) = self.claimed_by_other(name, Some(id)) {
            return Err(Error::Conflict(format!(
                "{name} is already being produced by {owner}"
            )));
        }
        self.close_side(id)?;
        let target = match self.open_target(id, &location, false) {
            Ok(t) => t,
            Err(e) => return Err(self.record_failure(id, &e)),
        };
        let producer = self.producer_mut(id)?;
        let base_offset = producer
            .current
            .as_ref()
            .map(|c| c.progress.written())
            .unwrap_or(0);
        producer.side = Some(SideFile {
            resource: OpenResource::new(name.to_owned(), location, false, target),
            base_offset,
        });
        self.by_name.insert(name.to_owned(), id);
        debug!(producer = %id, name, base_offset, "side-file opened");
        Ok(())
    }

    /// Close the side-file. Readers still tailing it continue in the main
    /// resource; the side-file itself is removed once unread.
    pub fn close_side(&mut self, id: ProducerId) -> Result<()> {
        let producer = self.producer_mut(id)?;
        let Some(mut side) = producer.side.take() else {
            return Ok(());
        };
        let res = side.resource.finish();
        let name = side.resource.name.clone();
        if self.by_name.get(&name) == Some(&id) {
            self.by_name.remove(&name);
        }
        self.discard(&side.resource.location);
        debug!(producer = %id, name = %name, "side-file closed");
        res.map_err(|e| self.record_failure(id, &e))
    }

    fn close_current(&mut self, id: ProducerId) -> Result<()> {
        self.close_side(id)?;
        let depth = self.config.timeshift_depth;
        let producer = self.producer_mut(id)?;
        let Some(mut current) = producer.current.take() else {
            return Ok(());
        };
        let res = current.finish();
        producer.history.push_back(HistoryEntry {
            name: current.name.clone(),
            location: current.location.clone(),
            is_static: current.is_static,
        });
        let mut evicted = Vec::new();
        if depth > 0 {
            while producer.history.len() > depth {
                if let Some(entry) = producer.history.pop_front() {
                    evicted.push(entry);
                }
            }
        }
        if self.by_name.get(&current.name) == Some(&id) {
            self.by_name.remove(&current.name);
        }
        debug!(
            producer = %id,
            name = %current.name,
            bytes = current.progress.written(),
            "resource closed"
        );
        for entry in evicted {
            self.evict(id, &entry);
        }
        res.map_err(|e| self.record_failure(id, &e))
    }

    /// Close the current resource without opening a new one.
    pub fn close(&mut self, id: ProducerId) -> Result<()> {
        self.close_current(id)
    }

    /// Upstream is done: close everything. The producer is dropped by
    /// [`ProducerRegistry::gc`] once no reader is attached.
    pub fn finish(&mut self, id: ProducerId) -> Result<()> {
        let res = self.close_current(id);
        if let Ok(producer) = self.producer_mut(id) {
            producer.finished = true;
            info!(producer = %id, bytes = producer.bytes_written, "producer finished");
        }
        res
    }

    /// Cancel the producer, deleting the partially written resource.
    pub fn abort(&mut self, id: ProducerId) {
        let Some(producer) = self.producers.get_mut(&id) else {
            return;
        };
        producer.finished = true;
        let side = producer.side.take();
        let current = producer.current.take();
        for mut resource in side
            .map(|s| s.resource)
            .into_iter()
            .chain(current)
        {
            let _ = resource.finish();
            if self.by_name.get(&resource.name) == Some(&id) {
                self.by_name.remove(&resource.name);
            }
            self.discard(&resource.location);
            info!(producer = %id, name = %resource.name, "partial resource discarded");
        }
    }

    /// Delete a resource from storage, deferring pinned files.
    fn discard(&mut self, location: &ResourceLocation) {
        match location {
            ResourceLocation::Memory(key) => {
                self.store.remove(key);
            }
            ResourceLocation::Disk(path) => {
                if self.pins.is_pinned(path) {
                    debug!(path = %path.display(), "deletion deferred, file still read");
                    self.pending_deletes.push(path.clone());
                } else if let Err(e) = fs::remove_file(path) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!(path = %path.display(), "failed to delete: {}", e);
                    }
                }
            }
        }
    }

    /// Drop a time-shift entry that fell out of the history. Static
    /// resources (manifests, init segments) stay.
    fn evict(&mut self, id: ProducerId, entry: &HistoryEntry) {
        let evicted = match &entry.location {
            ResourceLocation::Memory(key) => self.store.evict(key),
            ResourceLocation::Disk(_) if entry.is_static => false,
            ResourceLocation::Disk(_) => {
                self.discard(&entry.location);
                true
            }
        };
        if evicted {
            trace!(producer = %id, name = %entry.name, "time-shift entry evicted");
        }
    }

    /// Delete a stored resource on behalf of a client. Pinned files are
    /// removed once their last reader lets go.
    pub fn delete(&mut self, location: &ResourceLocation) {
        self.discard(location);
    }

    /// Drop every trace of `name`: an in-progress resource of that name is
    /// discarded and matching time-shift entries are forgotten.
    ///
    /// Returns whether anything referenced the name.
    pub fn forget(&mut self, name: &str) -> bool {
        let mut found = false;
        if let Some(id) = self.by_name.remove(name) {
            if let Some(producer) = self.producers.get_mut(&id) {
                let is_current = producer.current_name() == Some(name);
                let resource = if is_current {
                    producer.current.take()
                } else if producer.side_name() == Some(name) {
                    producer.side.take().map(|s| s.resource)
                } else {
                    None
                };
                if let Some(mut resource) = resource {
                    let _ = resource.finish();
                    self.discard(&resource.location);
                    found = true;
                }
            }
        }
        let mut stale = Vec::new();
        for producer in self.producers.values_mut() {
            producer.history.retain(|entry| {
                if entry.name == name {
                    stale.push(entry.location.clone());
                    false
                } else {
                    true
                }
            });
        }
        for location in stale {
            found = true;
            self.discard(&location);
        }
        found
    }

    /// Mark a reader as tailing the producer.
    pub fn attach(&mut self, id: ProducerId) {
        if let Some(producer) = self.producers.get_mut(&id) {
            producer.readers += 1;
            producer.had_reader = true;
            trace!(producer = %id, readers = producer.readers, "reader attached");
        }
    }

    pub fn detach(&mut self, id: ProducerId) {
        if let Some(producer) = self.producers.get_mut(&id) {
            producer.readers = producer.readers.saturating_sub(1);
            trace!(producer = %id, readers = producer.readers, "reader detached");
        }
    }

    /// Whether upstream should wait before producing: hold mode is on and
    /// no reader has attached yet.
    pub fn should_hold(&self, id: ProducerId) -> bool {
        self.producers
            .get(&id)
            .map(|p| p.hold && !p.had_reader && !p.finished)
            .unwrap_or(false)
    }

    /// Look up a resource being produced under `name`.
    pub fn lookup(&self, name: &str) -> Option<LiveResource> {
        let id = *self.by_name.get(name)?;
        let producer = self.producers.get(&id)?;
        if let Some(current) = producer.current.as_ref().filter(|c| c.name == name) {
            return Some(LiveResource {
                producer: id,
                name: current.name.clone(),
                location: current.location.clone(),
                progress: Arc::clone(&current.progress),
                tune_in: if producer.hold { producer.tune_in } else { None },
                side: None,
            });
        }
        let side = producer.side.as_ref().filter(|s| s.resource.name == name)?;
        let main = producer.current.as_ref()?;
        Some(LiveResource {
            producer: id,
            name: side.resource.name.clone(),
            location: side.resource.location.clone(),
            progress: Arc::clone(&side.resource.progress),
            tune_in: None,
            side: Some(SideLink {
                main_location: main.location.clone(),
                main_progress: Arc::clone(&main.progress),
                base_offset: side.base_offset,
            }),
        })
    }

    /// Drop finished producers nobody reads, run deferred deletions and
    /// purge memory nodes whose last reader left.
    pub fn gc(&mut self) {
        let before = self.producers.len();
        self.producers
            .retain(|_, p| !(p.finished && p.readers == 0));
        let dropped = before - self.producers.len();
        if dropped > 0 {
            let producers = &self.producers;
            self.by_name.retain(|_, id| producers.contains_key(id));
            debug!(dropped, "finished producers released");
        }

        let pins = &self.pins;
        self.pending_deletes.retain(|path| {
            if pins.is_pinned(path) {
                return true;
            }
            match fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "deferred deletion done"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "deferred deletion failed: {}", e),
            }
            false
        });

        self.store.purge_pending();
    }

    /// Deletions still waiting for readers to finish.
    pub fn pending_deletes(&self) -> usize {
        self.pending_deletes.len()
    }
}
