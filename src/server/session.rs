//! Per-connection state machine.
//!
//! ```text
//! AwaitingRequest -> Dispatched -> StreamingDownload    -> ResponseFlushed -> AwaitingRequest
//!                                  ReceivingUpload                          \-> Closed
//!                                  AwaitingHandlerReply
//! ```
//!
//! A session never blocks. Each [`Session::tick`] moves it as far as the
//! transport allows and returns.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use http::StatusCode;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, error, info, warn};

use liveorigin_common::{Error, HttpVersion, Method, ProducerId, SessionId};
use liveorigin_http::{continue_head, parse_head, RequestHead};

use super::hook::{HookDecision, HookRequest};
use super::limiter::ConnectionSlot;
use super::reply;
use super::transfer::{prepare_download, prepare_hook_download, Download, DownloadRequest, Prepared, Pump, PumpContext};
use super::transport::Transport;
use super::upload::Upload;
use super::Engine;

/// Steps taken per tick before yielding to other sessions.
const MAX_STEPS_PER_TICK: usize = 16;

pub(crate) enum SessionState {
    AwaitingRequest,
    Dispatched,
    AwaitingHandlerReply(oneshot::Receiver<HookDecision>),
    StreamingDownload(Box<Download>),
    ReceivingUpload(Box<Upload>),
    ResponseFlushed,
    Closed,
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            Self::AwaitingRequest => "awaiting-request",
            Self::Dispatched => "dispatched",
            Self::AwaitingHandlerReply(_) => "awaiting-handler",
            Self::StreamingDownload(_) => "streaming",
            Self::ReceivingUpload(_) => "receiving",
            Self::ResponseFlushed => "flushed",
            Self::Closed => "closed",
        }
    }
}

enum Step {
    /// State advanced; try again.
    Again,
    /// Nothing more to do until the next tick.
    Wait,
}

/// One client connection.
pub struct Session {
    id: SessionId,
    peer: SocketAddr,
    transport: Box<dyn Transport>,
    state: SessionState,
    inbuf: Vec<u8>,
    scratch: Vec<u8>,
    request: Option<RequestHead>,
    credentials: Option<(String, String)>,
    version: HttpVersion,
    keep_alive: bool,
    close_after: bool,
    status: u16,
    consecutive_errors: u32,
    last_activity: Instant,
    now: Instant,
    /// Producer this session tails. Taken on detach so it happens once.
    attached: Option<ProducerId>,
    /// Pending `100 Continue`.
    interim: Vec<u8>,
    requests: u64,
    _slot: ConnectionSlot,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state.name())
            .field("requests", &self.requests)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        transport: Box<dyn Transport>,
        slot: ConnectionSlot,
        block_size: usize,
        now: Instant,
    ) -> Self {
        Self {
            id,
            peer: transport.peer(),
            transport,
            state: SessionState::AwaitingRequest,
            inbuf: Vec::new(),
            scratch: vec![0; block_size.max(512)],
            request: None,
            credentials: None,
            version: HttpVersion::Http11,
            keep_alive: true,
            close_after: false,
            status: 0,
            consecutive_errors: 0,
            last_activity: now,
            now,
            attached: None,
            interim: Vec::new(),
            requests: 0,
            _slot: slot,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, SessionState::Closed)
    }

    /// Time since bytes last moved in either direction.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Advance the session. Returns whether anything happened.
    pub(crate) fn tick(&mut self, engine: &mut Engine, now: Instant) -> bool {
        self.now = now;
        let mut progressed = false;
        for _ in 0..MAX_STEPS_PER_TICK {
            if self.is_closed() {
                break;
            }
            match self.step(engine) {
                Step::Again => progressed = true,
                Step::Wait => break,
            }
        }
        progressed
    }

    fn step(&mut self, engine: &mut Engine) -> Step {
        let state = std::mem::replace(&mut self.state, SessionState::Dispatched);
        match state {
            SessionState::AwaitingRequest => self.await_request(engine),
            SessionState::Dispatched => {
                error!(session = %self.id, "session stalled in dispatch");
                self.close(engine, "internal error");
                Step::Wait
            }
            SessionState::AwaitingHandlerReply(mut rx) => match rx.try_recv() {
                Ok(decision) => {
                    self.apply_decision(engine, decision);
                    Step::Again
                }
                Err(TryRecvError::Empty) => {
                    self.state = SessionState::AwaitingHandlerReply(rx);
                    Step::Wait
                }
                Err(TryRecvError::Closed) => {
                    self.reply_error(engine, Error::internal("request hook dropped its decision"));
                    Step::Again
                }
            },
            SessionState::StreamingDownload(download) => self.stream(engine, download),
            SessionState::ReceivingUpload(upload) => self.receive(engine, upload),
            SessionState::ResponseFlushed => {
                if self.close_after || !self.keep_alive {
                    self.close(engine, "response complete");
                    return Step::Wait;
                }
                self.request = None;
                self.credentials = None;
                self.close_after = false;
                self.state = SessionState::AwaitingRequest;
                Step::Again
            }
            SessionState::Closed => {
                self.state = SessionState::Closed;
                Step::Wait
            }
        }
    }

    /// Read one block into the input buffer. `Ok(false)` when nothing is
    /// available yet.
    fn fill_inbuf(&mut self) -> Result<bool, Error> {
        match self.transport.read(&mut self.scratch) {
            Ok(0) => Err(Error::PeerDisconnected),
            Ok(n) => {
                self.inbuf.extend_from_slice(&self.scratch[..n]);
                self.last_activity = self.now;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(true),
            Err(e) => Err(Error::from_peer_io(e)),
        }
    }

    fn await_request(&mut self, engine: &mut Engine) -> Step {
        match parse_head(&self.inbuf) {
            Ok(Some((head, used))) => {
                self.inbuf.drain(..used);
                self.dispatch(engine, head);
                Step::Again
            }
            Err(e) => {
                debug!(session = %self.id, "malformed request: {}", e);
                self.inbuf.clear();
                self.close_after = true;
                self.reply_error(engine, e);
                Step::Again
            }
            Ok(None) => match self.fill_inbuf() {
                Ok(true) => {
                    self.state = SessionState::AwaitingRequest;
                    Step::Again
                }
                Ok(false) => {
                    self.state = SessionState::AwaitingRequest;
                    Step::Wait
                }
                Err(Error::PeerDisconnected) => {
                    self.close(engine, "peer closed");
                    Step::Wait
                }
                Err(e) => {
                    warn!(session = %self.id, "read failed: {}", e);
                    self.close(engine, "read error");
                    Step::Wait
                }
            },
        }
    }

    fn dispatch(&mut self, engine: &mut Engine, head: RequestHead) {
        self.state = SessionState::Dispatched;
        self.requests += 1;
        self.version = self.transport.version().unwrap_or(head.version);
        self.keep_alive = head.wants_keep_alive() && !engine.config.server.close;
        self.close_after = false;
        info!(
            session = %self.id,
            peer = %self.peer,
            method = %head.method_token,
            path = %head.path,
            "request"
        );

        let Some(method) = head.method else {
            let token = head.method_token.clone();
            self.request = Some(head);
            self.reply_error(engine, Error::NotImplemented(token));
            return;
        };
        let credentials = match head.basic_credentials() {
            Ok(c) => c,
            Err(e) => {
                self.request = Some(head);
                self.reply_error(engine, e);
                return;
            }
        };

        if method == Method::Options {
            let reply = reply::options_reply(&engine.config.server, &head);
            self.request = Some(head);
            self.start_reply(engine, Prepared::empty(reply));
            return;
        }

        if engine.hook.is_some() {
            let user = credentials
                .as_ref()
                .filter(|(u, p)| engine.acl.authenticate(u, p))
                .map(|(u, _)| u.clone());
            let decision = match engine.hook.as_mut() {
                Some(hook) => hook.decide(&HookRequest {
                    method,
                    path: &head.path,
                    user: user.as_deref(),
                    headers: &head.headers,
                }),
                None => HookDecision::FallThrough,
            };
            debug!(session = %self.id, ?decision, "request hook decided");
            self.credentials = credentials;
            self.request = Some(head);
            self.apply_decision(engine, decision);
            return;
        }

        self.credentials = credentials;
        self.request = Some(head);
        self.handle(engine, method);
    }

    fn apply_decision(&mut self, engine: &mut Engine, decision: HookDecision) {
        let Some(request) = self.request.take() else {
            self.close(engine, "no request to answer");
            return;
        };
        let Some(method) = request.method else {
            self.request = Some(request);
            self.close(engine, "no request to answer");
            return;
        };
        match decision {
            HookDecision::FallThrough => {
                self.request = Some(request);
                self.handle(engine, method);
            }
            HookDecision::Pending(rx) => {
                self.request = Some(request);
                self.state = SessionState::AwaitingHandlerReply(rx);
            }
            HookDecision::Reply { status, body } => {
                let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let result = match body {
                    None if status.as_u16() >= 400 => {
                        let (head, body) = reply::error_reply(status, None);
                        Ok(Action::Reply(Prepared::bytes(head, body)))
                    }
                    None => Ok(Action::Reply(Prepared::empty(reply::empty_reply(status)))),
                    Some(body) if method.has_upload_body() => {
                        Upload::to_hook(&request, body, status).map(Action::Upload)
                    }
                    Some(body) => prepare_hook_download(status, body, &request, method, self.version)
                        .map(Action::Reply),
                };
                self.request = Some(request);
                self.act(engine, method, result);
            }
        }
    }

    /// Core handling of a request the hook did not take over.
    fn handle(&mut self, engine: &mut Engine, method: Method) {
        let Some(request) = self.request.take() else {
            self.close(engine, "no request to answer");
            return;
        };
        let credentials = self.credentials.clone();
        let result = match method {
            Method::Get | Method::Head => match engine.resolve_read(&request.path, credentials) {
                Ok(resolution) => prepare_download(
                    DownloadRequest {
                        method,
                        request: &request,
                        version: self.version,
                        config: &engine.config.server,
                        store: &engine.store,
                        pins: &engine.pins,
                    },
                    resolution.resource,
                )
                .map(Action::Reply),
                Err(e) => Err(e),
            },
            Method::Put | Method::Post => engine
                .start_upload(self.id, &request, credentials)
                .map(Action::Upload),
            Method::Delete => engine
                .delete(&request.path, credentials)
                .map(|status| Action::Reply(Prepared::empty(reply::empty_reply(status)))),
            Method::Options => Ok(Action::Reply(Prepared::empty(reply::options_reply(
                &engine.config.server,
                &request,
            )))),
        };
        self.request = Some(request);
        self.act(engine, method, result);
    }

    fn act(&mut self, engine: &mut Engine, method: Method, result: liveorigin_common::Result<Action>) {
        match result {
            Ok(Action::Reply(prepared)) => self.start_reply(engine, prepared),
            Ok(Action::Upload(upload)) => {
                if self.request.as_ref().is_some_and(RequestHead::expects_continue) {
                    self.interim = continue_head(self.version);
                }
                self.state = SessionState::ReceivingUpload(Box::new(upload));
            }
            Err(e) => {
                // A rejected upload leaves its body unread on the wire.
                if method.has_upload_body() && self.request.as_ref().is_some_and(has_body) {
                    self.close_after = true;
                }
                self.reply_error(engine, e);
            }
        }
    }

    fn reply_error(&mut self, engine: &mut Engine, err: Error) {
        if matches!(err, Error::PeerDisconnected) {
            self.close(engine, "peer disconnected");
            return;
        }
        if err.closes_connection() {
            self.close_after = true;
        }
        let code = err.http_status();
        if code >= 500 {
            error!(session = %self.id, status = code, "request failed: {}", err);
        } else {
            debug!(session = %self.id, status = code, "request rejected: {}", err);
        }
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let detail = match &err {
            Error::ClientProtocol(_) | Error::UnsupportedRange(_) | Error::Conflict(_) => {
                Some(err.to_string())
            }
            _ => None,
        };
        let (head, body) = reply::error_reply(status, detail.as_deref());
        let mut prepared = Prepared::bytes(head, body);
        if self.request.as_ref().and_then(|r| r.method) == Some(Method::Head) {
            prepared.windows.clear();
        }
        self.start_reply(engine, prepared);
    }

    fn start_reply(&mut self, engine: &mut Engine, prepared: Prepared) {
        let status = prepared.head.status.as_u16();
        self.status = status;
        if status >= 400 {
            self.consecutive_errors += 1;
        } else {
            self.consecutive_errors = 0;
        }
        let max = engine.config.server.max_client_errors;
        if max > 0 && self.consecutive_errors >= max {
            debug!(session = %self.id, errors = self.consecutive_errors, "too many client errors");
            self.close_after = true;
        }
        if prepared.close {
            self.close_after = true;
        }
        let close = self.close_after || !self.keep_alive;
        let mut head = prepared.head;
        reply::finish_head(&mut head, &engine.config.server, self.request.as_ref(), close);
        let download = Download::new(
            head.encode(self.version),
            prepared.source,
            prepared.windows,
            prepared.chunked,
        );
        if let Some(id) = download.producer() {
            engine.producers.attach(id);
            self.attached = Some(id);
        }
        self.state = SessionState::StreamingDownload(Box::new(download));
    }

    fn stream(&mut self, engine: &mut Engine, mut download: Box<Download>) -> Step {
        let ctx = PumpContext {
            block_size: engine.config.server.block_size,
            max_backlog: engine.config.server.max_backlog,
            store: &engine.store,
            pins: &engine.pins,
        };
        match download.pump(self.transport.as_mut(), ctx) {
            Ok(Pump::Progressed) => {
                self.last_activity = self.now;
                self.state = SessionState::StreamingDownload(download);
                Step::Again
            }
            Ok(Pump::Idle) => {
                self.state = SessionState::StreamingDownload(download);
                Step::Wait
            }
            Ok(Pump::Done { truncated }) => {
                self.last_activity = self.now;
                if truncated {
                    warn!(session = %self.id, "resource shrank while sending, closing");
                    self.close_after = true;
                }
                self.detach(engine);
                info!(
                    session = %self.id,
                    status = self.status,
                    bytes = download.body_sent(),
                    "response sent"
                );
                self.state = SessionState::ResponseFlushed;
                Step::Again
            }
            Err(e) => {
                match e {
                    Error::PeerDisconnected => debug!(session = %self.id, "peer gone mid-response"),
                    ref other => warn!(session = %self.id, "response aborted: {}", other),
                }
                drop(download);
                self.close(engine, "send failed");
                Step::Wait
            }
        }
    }

    fn receive(&mut self, engine: &mut Engine, mut upload: Box<Upload>) -> Step {
        while !self.interim.is_empty() {
            match self.transport.write(&self.interim) {
                Ok(0) => {
                    upload.abort(engine);
                    self.close(engine, "peer closed");
                    return Step::Wait;
                }
                Ok(n) => {
                    self.interim.drain(..n);
                    self.last_activity = self.now;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.state = SessionState::ReceivingUpload(upload);
                    return Step::Wait;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => {
                    upload.abort(engine);
                    self.close(engine, "write error");
                    return Step::Wait;
                }
            }
        }

        if !self.inbuf.is_empty() {
            match upload.feed(engine, &self.inbuf) {
                Ok(n) => {
                    self.inbuf.drain(..n);
                }
                Err(e) => {
                    upload.abort(engine);
                    self.close_after = true;
                    self.reply_error(engine, e);
                    return Step::Again;
                }
            }
        }

        if upload.is_complete() {
            match upload.finish(engine) {
                Ok(status) => self.start_reply(engine, Prepared::empty(reply::empty_reply(status))),
                Err(e) => self.reply_error(engine, e),
            }
            return Step::Again;
        }

        match self.fill_inbuf() {
            Ok(true) => {
                self.state = SessionState::ReceivingUpload(upload);
                Step::Again
            }
            Ok(false) => {
                self.state = SessionState::ReceivingUpload(upload);
                Step::Wait
            }
            Err(e) => {
                debug!(session = %self.id, "upload interrupted: {}", e);
                upload.abort(engine);
                self.close(engine, "peer disconnected during upload");
                Step::Wait
            }
        }
    }

    fn detach(&mut self, engine: &mut Engine) {
        if let Some(id) = self.attached.take() {
            engine.producers.detach(id);
        }
    }

    /// Tear the session down. Safe to call more than once.
    pub(crate) fn close(&mut self, engine: &mut Engine, reason: &str) {
        match std::mem::replace(&mut self.state, SessionState::Closed) {
            SessionState::Closed => return,
            SessionState::ReceivingUpload(upload) => upload.abort(engine),
            _ => {}
        }
        self.detach(engine);
        self.transport.shutdown();
        info!(
            session = %self.id,
            peer = %self.peer,
            requests = self.requests,
            reason,
            "session closed"
        );
    }
}

enum Action {
    Reply(Prepared),
    Upload(Upload),
}

fn has_body(request: &RequestHead) -> bool {
    request.is_chunked() || matches!(request.content_length(), Ok(Some(n)) if n > 0)
}
