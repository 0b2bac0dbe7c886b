//! Request hook seam.
//!
//! An embedder can inspect each request before the core handles it. The hook
//! either lets the request fall through, answers it with a status (optionally
//! supplying the body source or sink), or defers the decision to a oneshot
//! channel polled on later ticks.

use std::io;

use http::HeaderMap;
use tokio::sync::oneshot;

use liveorigin_common::Method;

/// What the hook sees of a request.
#[derive(Debug)]
pub struct HookRequest<'a> {
    pub method: Method,
    pub path: &'a str,
    /// Authenticated user, if the request carried valid credentials.
    pub user: Option<&'a str>,
    pub headers: &'a HeaderMap,
}

/// Body provided by the hook in place of a file or memory node.
///
/// Downloads call `read`; uploads call `write` then `close`. `read` returns
/// `Ok(0)` at the end and `WouldBlock` when nothing is ready yet.
pub trait HookBody: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    fn close(&mut self);

    /// Total size when known up front.
    fn size(&self) -> Option<u64> {
        None
    }

    /// MIME type of the body.
    fn content_type(&self) -> Option<&str> {
        None
    }
}

/// Hook verdict.
pub enum HookDecision {
    /// Handle the request normally.
    FallThrough,
    /// Answer with `status`. With a body, the transfer or upload engine
    /// drives it instead of its default storage.
    Reply {
        status: u16,
        body: Option<Box<dyn HookBody>>,
    },
    /// Decision arrives later.
    Pending(oneshot::Receiver<HookDecision>),
}

impl std::fmt::Debug for HookDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FallThrough => write!(f, "FallThrough"),
            Self::Reply { status, body } => f
                .debug_struct("Reply")
                .field("status", status)
                .field("body", &body.is_some())
                .finish(),
            Self::Pending(_) => write!(f, "Pending"),
        }
    }
}

pub trait RequestHook: Send {
    fn decide(&mut self, request: &HookRequest<'_>) -> HookDecision;
}

impl<F> RequestHook for F
where
    F: FnMut(&HookRequest<'_>) -> HookDecision + Send,
{
    fn decide(&mut self, request: &HookRequest<'_>) -> HookDecision {
        self(request)
    }
}

/// In-memory hook body: serves `data` and collects uploads.
#[derive(Debug, Default, Clone)]
pub struct BufferBody {
    data: Vec<u8>,
    pos: usize,
    closed: bool,
    content_type: Option<String>,
}

impl BufferBody {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn with_content_type(mut self, mime: &str) -> Self {
        self.content_type = Some(mime.to_owned());
        self
    }
}

impl HookBody for BufferBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = (self.data.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "body closed"));
        }
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }
}
