//! Ingest sink for source mode.
//!
//! In source mode uploads are not stored: each PUT/POST body is forwarded as
//! a stream of [`IngestEvent`]s keyed by session, and DELETEs become delete
//! notices.

use tokio::sync::mpsc;
use tracing::warn;

use liveorigin_common::{Error, Result, SessionId};

/// Receiver of forwarded uploads.
pub trait IngestSink: Send {
    fn begin(&mut self, session: SessionId, path: &str, content_type: Option<&str>) -> Result<()>;

    fn data(&mut self, session: SessionId, bytes: &[u8]) -> Result<()>;

    fn end(&mut self, session: SessionId) -> Result<()>;

    /// The upload was cancelled; discard what was received.
    fn abort(&mut self, session: SessionId);

    fn delete(&mut self, path: &str);
}

/// One forwarded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestEvent {
    Begin {
        session: SessionId,
        path: String,
        content_type: Option<String>,
    },
    Data {
        session: SessionId,
        bytes: Vec<u8>,
    },
    End {
        session: SessionId,
    },
    Abort {
        session: SessionId,
    },
    Delete {
        path: String,
    },
}

/// Sink forwarding events over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<IngestEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<IngestEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: IngestEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| Error::upstream("ingest receiver dropped"))
    }
}

impl IngestSink for ChannelSink {
    fn begin(&mut self, session: SessionId, path: &str, content_type: Option<&str>) -> Result<()> {
        self.send(IngestEvent::Begin {
            session,
            path: path.to_owned(),
            content_type: content_type.map(str::to_owned),
        })
    }

    fn data(&mut self, session: SessionId, bytes: &[u8]) -> Result<()> {
        self.send(IngestEvent::Data {
            session,
            bytes: bytes.to_vec(),
        })
    }

    fn end(&mut self, session: SessionId) -> Result<()> {
        self.send(IngestEvent::End { session })
    }

    fn abort(&mut self, session: SessionId) {
        if self.send(IngestEvent::Abort { session }).is_err() {
            warn!(%session, "ingest receiver dropped before abort");
        }
    }

    fn delete(&mut self, path: &str) {
        if self
            .send(IngestEvent::Delete {
                path: path.to_owned(),
            })
            .is_err()
        {
            warn!(path, "ingest receiver dropped before delete");
        }
    }
}
