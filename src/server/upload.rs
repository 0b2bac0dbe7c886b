//! Upload path: request bodies into files, memory nodes or the ingest sink.
//!
//! A plain upload registers a producer for the target so concurrent readers
//! tail it while it arrives. A `Content-Range` upload patches bytes inside
//! an existing resource and never grows it; the window is held back until
//! the whole body has arrived, so a short or interrupted patch changes nothing.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};

use http::StatusCode;
use tracing::{debug, info};

use liveorigin_common::{Error, ProducerId, Result, SessionId};
use liveorigin_http::{parse_content_range, ByteRange, ChunkedDecoder, RequestHead};
use liveorigin_vfs::MemWriter;

use super::hook::HookBody;
use super::Engine;
use crate::live::ResourceLocation;

#[derive(Debug)]
enum Framing {
    Length { remaining: u64 },
    Chunked(ChunkedDecoder),
}

/// Positioned write inside an existing resource.
#[derive(Debug)]
enum PatchTarget {
    File(File),
    Memory(MemWriter),
}

enum Destination {
    Producer(ProducerId),
    Patch {
        target: PatchTarget,
        start: u64,
        len: u64,
        window: Vec<u8>,
    },
    Ingest(SessionId),
    Hook(Box<dyn HookBody>),
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Producer(id) => write!(f, "Producer({id})"),
            Self::Patch { start, len, .. } => write!(f, "Patch({start}+{len})"),
            Self::Ingest(s) => write!(f, "Ingest({s})"),
            Self::Hook(_) => write!(f, "Hook"),
        }
    }
}

/// One request body being received.
#[derive(Debug)]
pub(crate) struct Upload {
    path: String,
    framing: Framing,
    destination: Destination,
    status: StatusCode,
    received: u64,
    payload: Vec<u8>,
}

impl Upload {
    fn new(head: &RequestHead, destination: Destination, status: StatusCode) -> Result<Self> {
        let framing = if head.is_chunked() {
            Framing::Chunked(ChunkedDecoder::new())
        } else {
            Framing::Length {
                remaining: head.content_length()?.unwrap_or(0),
            }
        };
        Ok(Self {
            path: head.path.clone(),
            framing,
            destination,
            status,
            received: 0,
            payload: Vec::new(),
        })
    }

    /// Upload driven by a hook-supplied sink.
    pub fn to_hook(head: &RequestHead, body: Box<dyn HookBody>, status: StatusCode) -> Result<Self> {
        Self::new(head, Destination::Hook(body), status)
    }

    /// Whether the whole body has been received.
    pub fn is_complete(&self) -> bool {
        match &self.framing {
            Framing::Length { remaining } => *remaining == 0,
            Framing::Chunked(decoder) => decoder.is_done(),
        }
    }

    /// Consume body bytes from `input`. Returns how many were used; bytes
    /// past the end of the body are left for the next request.
    pub fn feed(&mut self, engine: &mut Engine, input: &[u8]) -> Result<usize> {
        self.payload.clear();
        let consumed = match &mut self.framing {
            Framing::Length { remaining } => {
                let n = (*remaining).min(input.len() as u64) as usize;
                self.payload.extend_from_slice(&input[..n]);
                *remaining -= n as u64;
                n
            }
            Framing::Chunked(decoder) => decoder.decode(input, &mut self.payload)?,
        };
        if !self.payload.is_empty() {
            self.received += self.payload.len() as u64;
            store(&mut self.destination, engine, &self.payload)?;
        }
        Ok(consumed)
    }

    /// Commit the upload and return the reply status.
    pub fn finish(mut self, engine: &mut Engine) -> Result<StatusCode> {
        match &mut self.destination {
            Destination::Producer(id) => engine.producers.finish(*id)?,
            Destination::Patch { target, start, len, window } => {
                if window.len() as u64 != *len {
                    return Err(Error::range(format!(
                        "patch at {start} declared {len} bytes, got {}",
                        window.len()
                    )));
                }
                commit_patch(target, *start, window)?;
            }
            Destination::Ingest(session) => {
                let session = *session;
                if let Some(sink) = engine.sink.as_mut() {
                    sink.end(session)?;
                }
            }
            Destination::Hook(body) => body.close(),
        }
        info!(path = %self.path, bytes = self.received, status = self.status.as_u16(), "upload complete");
        Ok(self.status)
    }

    /// Cancel the upload. Nothing received is committed.
    pub fn abort(mut self, engine: &mut Engine) {
        match &mut self.destination {
            Destination::Producer(id) => engine.producers.abort(*id),
            Destination::Patch { window, .. } => {
                debug!(path = %self.path, buffered = window.len(), "patch dropped before commit");
            }
            Destination::Ingest(session) => {
                let session = *session;
                if let Some(sink) = engine.sink.as_mut() {
                    sink.abort(session);
                }
            }
            Destination::Hook(body) => body.close(),
        }
        info!(path = %self.path, bytes = self.received, "upload aborted");
    }
}

fn store(destination: &mut Destination, engine: &mut Engine, data: &[u8]) -> Result<()> {
    match destination {
        Destination::Producer(id) => engine.producers.write(*id, data),
        Destination::Patch { len, window, .. } => {
            if window.len() as u64 + data.len() as u64 > *len {
                return Err(Error::range(format!(
                    "body exceeds patch window of {len} bytes"
                )));
            }
            window.extend_from_slice(data);
            Ok(())
        }
        Destination::Ingest(session) => match engine.sink.as_mut() {
            Some(sink) => sink.data(*session, data),
            None => Err(Error::internal("source mode without ingest sink")),
        },
        Destination::Hook(body) => body
            .write(data)
            .map_err(|e| Error::upstream(e.to_string())),
    }
}

impl Engine {
    /// Start receiving the body of a PUT or POST.
    pub(crate) fn start_upload(
        &mut self,
        session: SessionId,
        head: &RequestHead,
        credentials: Option<(String, String)>,
    ) -> Result<Upload> {
        let path = head.path.as_str();
        if self.config.server.source_mode {
            let sink = self
                .sink
                .as_mut()
                .ok_or_else(|| Error::internal("source mode without ingest sink"))?;
            sink.begin(session, path, head.header("content-type"))?;
            debug!(%session, path, "forwarding upload to ingest sink");
            return Upload::new(head, Destination::Ingest(session), StatusCode::CREATED);
        }

        let target = self.resolve_write(path, credentials)?;
        if let Some(range) = head.header("content-range") {
            return self.start_patch(head, range, target.location, target.existed);
        }

        self.producers.check_claim(path)?;
        let id = self.producers.create(path);
        if let Err(e) = self.producers.open(id, path, target.location, false) {
            self.producers.abort(id);
            return Err(e);
        }
        debug!(%session, path, producer = %id, user = ?target.user, "upload started");
        let status = if target.existed {
            StatusCode::OK
        } else {
            StatusCode::CREATED
        };
        Upload::new(head, Destination::Producer(id), status)
    }

    fn start_patch(
        &mut self,
        head: &RequestHead,
        range: &str,
        location: ResourceLocation,
        existed: bool,
    ) -> Result<Upload> {
        let (start, end) = parse_content_range(range)?;
        if !existed {
            return Err(Error::range(format!("cannot patch missing {}", head.path)));
        }
        let len = ByteRange::closed(start, end)
            .window_len()
            .ok_or_else(|| Error::range(format!("patch window {start}-{end} is too long")))?;
        if let Some(declared) = head.content_length()? {
            if declared != len {
                return Err(Error::range(format!(
                    "Content-Length {declared} does not match range of {len} bytes"
                )));
            }
        }
        let target = match &location {
            ResourceLocation::Disk(path) => {
                let file = OpenOptions::new()
                    .write(true)
                    .open(path)
                    .map_err(|e| Error::upstream(e.to_string()))?;
                let size = file.metadata().map_err(|e| Error::upstream(e.to_string()))?.len();
                check_inside(start, end, size)?;
                PatchTarget::File(file)
            }
            ResourceLocation::Memory(key) => {
                let writer = self
                    .store
                    .open_write(key)
                    .ok_or_else(|| Error::not_found(key.clone()))?;
                check_inside(start, end, writer.len())?;
                PatchTarget::Memory(writer)
            }
        };
        debug!(path = %head.path, start, end, "patch started");
        Upload::new(
            head,
            Destination::Patch {
                target,
                start,
                len,
                window: Vec::new(),
            },
            StatusCode::OK,
        )
    }
}

impl Engine {
    /// Handle DELETE: remove the stored resource and every producer or
    /// time-shift entry naming it.
    pub(crate) fn delete(
        &mut self,
        path: &str,
        credentials: Option<(String, String)>,
    ) -> Result<StatusCode> {
        if self.config.server.source_mode {
            if let Some(sink) = self.sink.as_mut() {
                sink.delete(path);
            }
            return Ok(StatusCode::NO_CONTENT);
        }
        let target = self.resolve_write(path, credentials)?;
        let live = self.producers.forget(path);
        if target.existed {
            self.producers.delete(&target.location);
        }
        self.producers.gc();
        if target.existed || live {
            info!(path, "resource deleted");
            Ok(StatusCode::NO_CONTENT)
        } else {
            Err(Error::not_found(path))
        }
    }
}

/// Write a complete patch window in place.
fn commit_patch(target: &mut PatchTarget, start: u64, window: &[u8]) -> Result<()> {
    match target {
        PatchTarget::File(file) => file
            .seek(SeekFrom::Start(start))
            .and_then(|_| file.write_all(window))
            .and_then(|_| file.flush())
            .map_err(|e| Error::upstream(e.to_string())),
        PatchTarget::Memory(writer) => {
            if writer.is_detached() {
                return Err(Error::Conflict(format!(
                    "{} was replaced during the patch",
                    writer.name()
                )));
            }
            writer.write_at(start, window)
        }
    }
}

/// Patches may only overwrite existing bytes.
fn check_inside(start: u64, end: u64, size: u64) -> Result<()> {
    if end >= size {
        return Err(Error::range(format!(
            "patch {start}-{end} would grow resource of {size} bytes"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_window_must_fit() {
        assert!(check_inside(0, 9, 10).is_ok());
        assert!(check_inside(5, 10, 10).is_err());
    }
}
