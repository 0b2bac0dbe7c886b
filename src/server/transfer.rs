//! Download path: pumping a body to the transport.
//!
//! A [`Download`] keeps every bit of its progress in fields (window index,
//! resource offset, unsent output) so a blocked write simply returns and the
//! next tick resumes where it stopped. Bytes already handed to the transport
//! are never read again.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use http::StatusCode;
use tracing::{debug, trace};

use liveorigin_common::paths::{is_compressible, mime_for_path};
use liveorigin_common::{Error, HttpVersion, Method, ProducerId, Result};
use liveorigin_http::{
    date, encode_chunk, listing, negotiate, ByteRange, ContentEncoding, RangePlan, RequestHead,
    ResourceExtent, ResponseHead, LAST_CHUNK,
};
use liveorigin_vfs::{MemReader, MemStore, Pin, PinTable};

use super::hook::HookBody;
use super::resolve::Resolved;
use super::transport::Transport;
use crate::config::ServerConfig;
use crate::live::{LiveResource, Progress, ResourceLocation, SideLink};

/// Upper bound on blocks moved for one session in one tick, so a fast
/// reader cannot starve the others.
const MAX_BLOCKS_PER_TICK: usize = 32;

/// Handle on stored bytes, file or memory node.
#[derive(Debug)]
enum ResourceReader {
    File(File),
    Memory(MemReader),
}

impl ResourceReader {
    fn open(location: &ResourceLocation, store: &MemStore) -> Result<Self> {
        match location {
            ResourceLocation::Disk(path) => Ok(Self::File(File::open(path)?)),
            ResourceLocation::Memory(key) => store
                .open_read(key)
                .map(Self::Memory)
                .ok_or_else(|| Error::not_found(key.clone())),
        }
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::File(file) => {
                file.seek(SeekFrom::Start(offset))?;
                file.read(buf)
            }
            Self::Memory(reader) => Ok(reader.read_at(offset, buf)),
        }
    }
}

/// Reader tailing a resource a producer is still writing.
#[derive(Debug)]
pub(crate) struct LiveBody {
    producer: ProducerId,
    reader: ResourceReader,
    progress: Arc<Progress>,
    /// Logical offset 0 maps to this offset of the underlying resource.
    shift: u64,
    /// Logical end once the resource is known to stop here.
    cap: Option<u64>,
    /// Main resource to continue in when this is a side-file.
    side: Option<SideLink>,
    _pin: Option<Pin>,
}

impl LiveBody {
    fn open(live: LiveResource, store: &MemStore, pins: &PinTable) -> Result<Self> {
        let reader = ResourceReader::open(&live.location, store)?;
        Ok(Self {
            producer: live.producer,
            reader,
            progress: live.progress,
            shift: 0,
            cap: None,
            side: live.side,
            _pin: pin_for(&live.location, pins),
        })
    }

    /// Bytes readable right now, in logical offsets.
    fn available(&self) -> u64 {
        let written = self.progress.written().saturating_sub(self.shift);
        self.cap.map_or(written, |cap| written.min(cap))
    }

    fn is_done(&self) -> bool {
        self.progress.is_finished() || self.cap.is_some_and(|cap| self.available() >= cap)
    }

    /// A closed side-file continues in its main resource: same logical
    /// offsets, stopping where the side-file stopped.
    fn follow_side(&mut self, store: &MemStore, pins: &PinTable) {
        let Some(link) = self.side.as_ref() else {
            return;
        };
        if !self.progress.is_finished() {
            return;
        }
        let length = self.progress.written();
        match ResourceReader::open(&link.main_location, store) {
            Ok(reader) => {
                debug!(producer = %self.producer, base = link.base_offset, length, "side-file closed, continuing in main resource");
                self.reader = reader;
                self.progress = Arc::clone(&link.main_progress);
                self.shift = link.base_offset;
                self.cap = Some(length);
                self._pin = pin_for(&link.main_location, pins);
            }
            Err(e) => {
                // The side-file is complete; finish from it.
                trace!(producer = %self.producer, "main resource unavailable: {}", e);
            }
        }
        self.side = None;
    }

    fn read(&mut self, pos: u64, buf: &mut [u8], store: &MemStore, pins: &PinTable) -> io::Result<Chunk> {
        self.follow_side(store, pins);
        let available = self.available();
        if pos < available {
            let want = ((available - pos) as usize).min(buf.len());
            let n = self.reader.read_at(self.shift + pos, &mut buf[..want])?;
            return Ok(if n == 0 { Chunk::Wait } else { Chunk::Data(n) });
        }
        Ok(if self.is_done() { Chunk::Eof } else { Chunk::Wait })
    }
}

fn pin_for(location: &ResourceLocation, pins: &PinTable) -> Option<Pin> {
    match location {
        ResourceLocation::Disk(path) => Some(pins.pin(path.clone())),
        ResourceLocation::Memory(_) => None,
    }
}

/// Outcome of one source read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Data(usize),
    /// Nothing yet, the resource is still growing.
    Wait,
    Eof,
}

/// Where body bytes come from.
pub(crate) enum BodySource {
    /// Generated in full up front (errors, listings, compressed files).
    Bytes(Vec<u8>),
    File { file: File, _pin: Pin },
    Memory(MemReader),
    Live(LiveBody),
    Hook(Box<dyn HookBody>),
}

impl std::fmt::Debug for BodySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes(b) => write!(f, "Bytes({})", b.len()),
            Self::File { .. } => write!(f, "File"),
            Self::Memory(r) => write!(f, "Memory({})", r.name()),
            Self::Live(l) => write!(f, "Live({})", l.producer),
            Self::Hook(_) => write!(f, "Hook"),
        }
    }
}

impl BodySource {
    fn read(&mut self, pos: u64, buf: &mut [u8], store: &MemStore, pins: &PinTable) -> io::Result<Chunk> {
        match self {
            Self::Bytes(data) => {
                let len = data.len() as u64;
                if pos >= len {
                    return Ok(Chunk::Eof);
                }
                let n = ((len - pos) as usize).min(buf.len());
                buf[..n].copy_from_slice(&data[pos as usize..pos as usize + n]);
                Ok(Chunk::Data(n))
            }
            Self::File { file, .. } => {
                file.seek(SeekFrom::Start(pos))?;
                match file.read(buf)? {
                    0 => Ok(Chunk::Eof),
                    n => Ok(Chunk::Data(n)),
                }
            }
            Self::Memory(reader) => match reader.read_at(pos, buf) {
                0 if reader.is_finished() || reader.owner().is_none() => Ok(Chunk::Eof),
                0 => Ok(Chunk::Wait),
                n => Ok(Chunk::Data(n)),
            },
            Self::Live(live) => live.read(pos, buf, store, pins),
            Self::Hook(body) => match body.read(buf) {
                Ok(0) => Ok(Chunk::Eof),
                Ok(n) => Ok(Chunk::Data(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Chunk::Wait),
                Err(e) => Err(e),
            },
        }
    }

    /// How far a tailing reader at `pos` lags behind its producer.
    fn backlog(&self, pos: u64) -> Option<u64> {
        match self {
            Self::Live(live) => Some(live.available().saturating_sub(pos)),
            _ => None,
        }
    }

    fn producer(&self) -> Option<ProducerId> {
        match self {
            Self::Live(live) => Some(live.producer),
            _ => None,
        }
    }
}

/// Shared state a download needs while pumping.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PumpContext<'a> {
    pub block_size: usize,
    pub max_backlog: u64,
    pub store: &'a MemStore,
    pub pins: &'a PinTable,
}

/// Result of one pump step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pump {
    /// Bytes moved, more to come.
    Progressed,
    /// Blocked on the socket or waiting for the producer.
    Idle,
    /// Everything sent. `truncated` when a content-length body ended early.
    Done { truncated: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Body,
    Terminator,
    Done,
}

/// One response in flight.
#[derive(Debug)]
pub(crate) struct Download {
    source: BodySource,
    windows: Vec<ByteRange>,
    index: usize,
    pos: u64,
    chunked: bool,
    out: Vec<u8>,
    out_pos: usize,
    phase: Phase,
    truncated: bool,
    sent: u64,
    scratch: Vec<u8>,
}

impl Download {
    /// `head` is the encoded response head; it goes out before the body.
    pub fn new(head: Vec<u8>, source: BodySource, windows: Vec<ByteRange>, chunked: bool) -> Self {
        Self {
            source,
            windows,
            index: 0,
            pos: 0,
            chunked,
            out: head,
            out_pos: 0,
            phase: Phase::Body,
            truncated: false,
            sent: 0,
            scratch: Vec::new(),
        }
    }

    /// Producer this download tails, if any.
    pub fn producer(&self) -> Option<ProducerId> {
        self.source.producer()
    }

    /// Body bytes produced so far.
    pub fn body_sent(&self) -> u64 {
        self.sent
    }

    /// Drive the download as far as the transport and the source allow.
    pub fn pump(&mut self, transport: &mut dyn Transport, ctx: PumpContext<'_>) -> Result<Pump> {
        let mut progressed = false;
        for _ in 0..MAX_BLOCKS_PER_TICK {
            while self.out_pos < self.out.len() {
                match transport.write(&self.out[self.out_pos..]) {
                    Ok(0) => return Err(Error::PeerDisconnected),
                    Ok(n) => {
                        self.out_pos += n;
                        progressed = true;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(idle_or(progressed));
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(Error::from_peer_io(e)),
                }
            }
            self.out.clear();
            self.out_pos = 0;

            match self.phase {
                Phase::Done => {
                    return Ok(Pump::Done {
                        truncated: self.truncated,
                    })
                }
                Phase::Terminator => {
                    if self.chunked {
                        self.out.extend_from_slice(LAST_CHUNK);
                    }
                    self.phase = Phase::Done;
                }
                Phase::Body => {
                    if !self.fill(ctx)? {
                        return Ok(idle_or(progressed));
                    }
                }
            }
        }
        Ok(idle_or(progressed))
    }

    /// Stage the next block in `out`. Returns false when the source has
    /// nothing ready yet.
    fn fill(&mut self, ctx: PumpContext<'_>) -> Result<bool> {
        loop {
            let Some(window) = self.windows.get(self.index).copied() else {
                self.phase = Phase::Terminator;
                return Ok(true);
            };
            if self.pos < window.start {
                self.pos = window.start;
            }
            let mut want = ctx.block_size.max(1);
            if let Some(end) = window.end {
                if self.pos > end {
                    self.index += 1;
                    continue;
                }
                let left = ByteRange::closed(self.pos, end).window_len().unwrap_or(u64::MAX);
                want = want.min(left.min(usize::MAX as u64) as usize);
            }

            if ctx.max_backlog > 0 {
                if let Some(lag) = self.source.backlog(self.pos) {
                    if lag > ctx.max_backlog {
                        debug!(lag, max = ctx.max_backlog, "reader backlog exceeded");
                        return Err(Error::internal(format!(
                            "reader lags {lag} bytes behind producer"
                        )));
                    }
                }
            }

            self.scratch.resize(want, 0);
            match self.source.read(self.pos, &mut self.scratch[..want], ctx.store, ctx.pins)? {
                Chunk::Data(n) => {
                    let data = &self.scratch[..n];
                    if self.chunked {
                        encode_chunk(data, &mut self.out);
                    } else {
                        self.out.extend_from_slice(data);
                    }
                    self.pos += n as u64;
                    self.sent += n as u64;
                    trace!(bytes = n, offset = self.pos, "block staged");
                    return Ok(true);
                }
                Chunk::Wait => return Ok(false),
                Chunk::Eof => {
                    if window.end.is_some() {
                        // Fewer bytes than promised: nothing later can be sent.
                        self.truncated = !self.chunked;
                        self.phase = Phase::Terminator;
                        return Ok(true);
                    }
                    self.index += 1;
                }
            }
        }
    }
}

fn idle_or(progressed: bool) -> Pump {
    if progressed {
        Pump::Progressed
    } else {
        Pump::Idle
    }
}

/// A reply ready to be framed by the session.
#[derive(Debug)]
pub(crate) struct Prepared {
    pub head: ResponseHead,
    pub source: BodySource,
    pub windows: Vec<ByteRange>,
    pub chunked: bool,
    /// The body end can only be signalled by closing the connection.
    pub close: bool,
}

impl Prepared {
    /// Reply whose body is fully known.
    pub fn bytes(head: ResponseHead, body: Vec<u8>) -> Self {
        let windows = if body.is_empty() {
            Vec::new()
        } else {
            vec![ByteRange::closed(0, body.len() as u64 - 1)]
        };
        Self {
            head,
            source: BodySource::Bytes(body),
            windows,
            chunked: false,
            close: false,
        }
    }

    pub fn empty(head: ResponseHead) -> Self {
        Self::bytes(head, Vec::new())
    }

    /// Drop the body for HEAD, keeping the headers.
    fn strip_body(mut self) -> Self {
        self.source = BodySource::Bytes(Vec::new());
        self.windows.clear();
        self.chunked = false;
        self
    }
}

/// Inputs for building a GET or HEAD reply.
pub(crate) struct DownloadRequest<'a> {
    pub method: Method,
    pub request: &'a RequestHead,
    pub version: HttpVersion,
    pub config: &'a ServerConfig,
    pub store: &'a MemStore,
    pub pins: &'a PinTable,
}

/// Build the reply for a resolved read.
pub(crate) fn prepare_download(req: DownloadRequest<'_>, resource: Resolved) -> Result<Prepared> {
    let path = req.request.path.as_str();
    let range = req.request.header("range");
    let prepared = match resource {
        Resolved::Live(live) => {
            let finished = live.progress.is_finished();
            let extent = if finished {
                ResourceExtent::Known(live.progress.written())
            } else {
                ResourceExtent::Growing
            };
            let mut plan = negotiate(range, extent, req.request.accepts_open_ranges())?;
            if range.is_none() && !finished {
                if let Some(offset) = live.tune_in {
                    debug!(path, offset, "joining live resource at tune-in point");
                    plan = RangePlan::tail_from(offset);
                }
            }
            let head = ResponseHead::new(StatusCode::OK)
                .with("Content-Type", mime_for_path(path))
                .with("Cache-Control", "no-cache");
            let source = BodySource::Live(LiveBody::open(live, req.store, req.pins)?);
            frame(head, source, plan, req.version, true)
        }
        Resolved::File { path: full, metadata } => {
            let size = metadata.len();
            let mime = mime_for_path(&full);
            let mut head = ResponseHead::new(StatusCode::OK).with("Content-Type", mime);
            let modified = metadata.modified().ok();
            let encoding = compression_for(&req, range, mime, size);
            let mut etag = None;
            if req.config.etags_enabled() {
                if let Some(modified) = modified {
                    let tag = match encoding {
                        Some(enc) => format!("{}-{}\"", date::etag(modified, size).trim_end_matches('"'), enc.as_str()),
                        None => date::etag(modified, size),
                    };
                    head.insert("ETag", tag.clone());
                    head.insert("Last-Modified", date::http_date(modified));
                    etag = Some(tag);
                }
            }
            if let Some(cc) = req.config.cache_control.as_deref().filter(|cc| *cc != "none") {
                head.insert("Cache-Control", cc.to_owned());
            }
            if let (Some(tag), Some(inm)) = (etag.as_deref(), req.request.header("if-none-match")) {
                if inm.split(',').any(|t| t.trim() == tag || t.trim() == "*") {
                    debug!(path, "not modified");
                    head.status = StatusCode::NOT_MODIFIED;
                    return Ok(Prepared::empty(head));
                }
            }
            let mut file = File::open(&full)?;
            let pin = req.pins.pin(full.clone());
            match encoding {
                Some(enc) => {
                    let mut raw = Vec::with_capacity(size as usize);
                    file.read_to_end(&mut raw)?;
                    let body = enc.compress(&raw)?;
                    trace!(path, raw = raw.len(), compressed = body.len(), "body compressed");
                    head.insert("Content-Encoding", enc.as_str());
                    head.insert("Vary", "Accept-Encoding");
                    let plan = negotiate(None, ResourceExtent::Known(body.len() as u64), false)?;
                    frame(head, BodySource::Bytes(body), plan, req.version, false)
                }
                None => {
                    let plan = negotiate(range, ResourceExtent::Known(size), false)?;
                    frame(
                        head,
                        BodySource::File { file, _pin: pin },
                        plan,
                        req.version,
                        false,
                    )
                }
            }
        }
        Resolved::Memory { key } => {
            let reader = req
                .store
                .open_read(&key)
                .ok_or_else(|| Error::not_found(key.clone()))?;
            let size = reader.snapshot_len();
            let mime = mime_for_path(&key);
            let mut head = ResponseHead::new(StatusCode::OK).with("Content-Type", mime);
            match compression_for(&req, range, mime, size) {
                Some(enc) if reader.is_finished() || reader.owner().is_none() => {
                    let mut raw = vec![0u8; size as usize];
                    let n = reader.read_at(0, &mut raw);
                    raw.truncate(n);
                    let body = enc.compress(&raw)?;
                    head.insert("Content-Encoding", enc.as_str());
                    head.insert("Vary", "Accept-Encoding");
                    let plan = negotiate(None, ResourceExtent::Known(body.len() as u64), false)?;
                    frame(head, BodySource::Bytes(body), plan, req.version, false)
                }
                _ => {
                    let plan = negotiate(range, ResourceExtent::Known(size), false)?;
                    frame(head, BodySource::Memory(reader), plan, req.version, false)
                }
            }
        }
        Resolved::Directory { entries } => {
            if !req.config.directory_listing {
                return Err(Error::not_found(format!("{path} is a directory")));
            }
            let html = listing::render(path, entries).into_bytes();
            let head = ResponseHead::new(StatusCode::OK)
                .with("Content-Type", "text/html; charset=utf-8")
                .with("Content-Length", html.len().to_string());
            Prepared::bytes(head, html)
        }
    };
    Ok(match req.method {
        Method::Head => prepared.strip_body(),
        _ => prepared,
    })
}

/// Reply driven by a hook-supplied body.
pub(crate) fn prepare_hook_download(
    status: StatusCode,
    body: Box<dyn HookBody>,
    request: &RequestHead,
    method: Method,
    version: HttpVersion,
) -> Result<Prepared> {
    let mime = body
        .content_type()
        .map(str::to_owned)
        .unwrap_or_else(|| mime_for_path(&request.path).to_owned());
    let extent = body.size().map_or(ResourceExtent::Growing, ResourceExtent::Known);
    let plan = negotiate(None, extent, false)?;
    let head = ResponseHead::new(status).with("Content-Type", mime);
    let prepared = frame(head, BodySource::Hook(body), plan, version, false);
    Ok(match method {
        Method::Head => prepared.strip_body(),
        _ => prepared,
    })
}

/// Choose compression for a small static text body.
fn compression_for(
    req: &DownloadRequest<'_>,
    range: Option<&str>,
    mime: &str,
    size: u64,
) -> Option<ContentEncoding> {
    let limit = req.config.compress_max;
    if limit == 0 || size == 0 || size > limit || range.is_some() || !is_compressible(mime) {
        return None;
    }
    ContentEncoding::negotiate(req.request.header("accept-encoding")?)
}

/// Turn a range plan into status, length headers and body framing.
fn frame(
    mut head: ResponseHead,
    source: BodySource,
    plan: RangePlan,
    version: HttpVersion,
    live: bool,
) -> Prepared {
    if plan.partial {
        head.status = StatusCode::PARTIAL_CONTENT;
    }
    if let Some(cr) = &plan.content_range {
        head.insert("Content-Range", cr.clone());
    }
    if !live || plan.bounded {
        head.insert("Accept-Ranges", "bytes");
    }
    let mut chunked = false;
    let mut close = false;
    match plan.body_len {
        Some(len) => head.insert("Content-Length", len.to_string()),
        None if version.supports_chunked() => {
            head.insert("Transfer-Encoding", "chunked");
            chunked = true;
        }
        // HTTP/2 frames the body itself.
        None if version.is_multiplexed() => {}
        None => close = true,
    }
    Prepared {
        head,
        source,
        windows: plan.windows,
        chunked,
        close,
    }
}
