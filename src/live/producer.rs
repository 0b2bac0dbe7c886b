use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Write};
use std::sync::Arc;

use liveorigin_common::ProducerId;
use liveorigin_vfs::MemWriter;

use super::{Progress, ResourceLocation};

/// Writable end of a resource.
#[derive(Debug)]
pub(crate) enum Target {
    File(File),
    Memory(MemWriter),
}

impl Target {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Target::File(file) => file.write_all(data),
            Target::Memory(writer) => {
                writer.write(data);
                Ok(())
            }
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        match self {
            Target::File(file) => file.flush(),
            Target::Memory(writer) => {
                writer.finish();
                Ok(())
            }
        }
    }
}

/// The resource a producer is currently writing.
#[derive(Debug)]
pub(crate) struct OpenResource {
    pub name: String,
    pub location: ResourceLocation,
    pub progress: Arc<Progress>,
    pub is_static: bool,
    target: Target,
}

impl OpenResource {
    pub fn new(name: String, location: ResourceLocation, is_static: bool, target: Target) -> Self {
        Self {
            name,
            location,
            progress: Arc::new(Progress::new()),
            is_static,
            target,
        }
    }

    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.target.append(data)?;
        self.progress.advance(data.len() as u64);
        Ok(())
    }

    /// Flush and mark complete. Readers stop once they reach the end.
    pub fn finish(&mut self) -> io::Result<()> {
        let res = self.target.finish();
        self.progress.finish();
        res
    }
}

/// Low-latency side-file nested in the main resource.
#[derive(Debug)]
pub(crate) struct SideFile {
    pub resource: OpenResource,
    /// Offset in the main resource where the side-file starts.
    pub base_offset: u64,
}

/// A closed resource kept for time-shifted reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub name: String,
    pub location: ResourceLocation,
    pub is_static: bool,
}

/// One live input.
#[derive(Debug)]
pub struct Producer {
    pub(crate) id: ProducerId,
    pub(crate) label: String,
    pub(crate) current: Option<OpenResource>,
    pub(crate) side: Option<SideFile>,
    pub(crate) bytes_written: u64,
    pub(crate) finished: bool,
    pub(crate) hold: bool,
    pub(crate) tune_in: Option<u64>,
    pub(crate) history: VecDeque<HistoryEntry>,
    pub(crate) readers: usize,
    pub(crate) had_reader: bool,
    pub(crate) consecutive_errors: u32,
    pub(crate) disconnected: bool,
}

impl Producer {
    pub(crate) fn new(id: ProducerId, label: String, hold: bool) -> Self {
        Self {
            id,
            label,
            current: None,
            side: None,
            bytes_written: 0,
            finished: false,
            hold,
            tune_in: None,
            history: VecDeque::new(),
            readers: 0,
            had_reader: false,
            consecutive_errors: 0,
            disconnected: false,
        }
    }

    pub fn id(&self) -> ProducerId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Name of the resource being written, if any.
    pub fn current_name(&self) -> Option<&str> {
        self.current.as_ref().map(|r| r.name.as_str())
    }

    pub fn side_name(&self) -> Option<&str> {
        self.side.as_ref().map(|s| s.resource.name.as_str())
    }

    /// Total bytes written across all resources.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn readers(&self) -> usize {
        self.readers
    }

    /// Offset of the last tune-in point in the current resource.
    pub fn tune_in(&self) -> Option<u64> {
        self.tune_in
    }

    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter()
    }

    /// Append to the current resource, mirrored into an open side-file.
    pub(crate) fn append(&mut self, data: &[u8]) -> io::Result<()> {
        let current = self
            .current
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no open resource"))?;
        current.append(data)?;
        if let Some(side) = self.side.as_mut() {
            side.resource.append(data)?;
        }
        self.bytes_written += data.len() as u64;
        Ok(())
    }
}
