//! The origin server: one event loop driving every session.
//!
//! All mutable state lives in one [`Server`] value. Sessions are ticked in
//! turn on the loop's task, so the producer registry, the memory store and
//! the ACL cache are only ever touched from one place at a time.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use liveorigin_common::{IdAllocator, Result, SessionId};
use liveorigin_vfs::{MemStore, PinTable};

use crate::config::Config;
use crate::live::{ProducerRegistry, ResourceLocation};

pub mod acl;
pub mod hook;
pub mod limiter;
mod reply;
mod resolve;
pub mod session;
pub mod sink;
mod transfer;
pub mod transport;
mod upload;

pub use acl::{Access, Acl, DirectoryRule, Principal};
pub use hook::{BufferBody, HookBody, HookDecision, HookRequest, RequestHook};
pub use limiter::{ConnectionLimiter, ConnectionSlot, Refusal};
pub use session::Session;
pub use sink::{ChannelSink, IngestEvent, IngestSink};
pub use transport::{TcpTransport, Transport};

/// Loop wake interval when no session made progress.
const IDLE_WAKE: Duration = Duration::from_millis(50);

/// Everything a session needs besides itself.
pub(crate) struct Engine {
    pub(crate) config: Arc<Config>,
    pub(crate) acl: Acl,
    pub(crate) store: MemStore,
    pub(crate) pins: PinTable,
    pub(crate) producers: ProducerRegistry,
    pub(crate) hook: Option<Box<dyn RequestHook>>,
    pub(crate) sink: Option<Box<dyn IngestSink>>,
    pub(crate) limiter: ConnectionLimiter,
}

/// Server context: sessions plus the shared engine.
pub struct Server {
    engine: Engine,
    sessions: Vec<Session>,
    ids: IdAllocator,
}

impl Server {
    /// Build a server from a validated configuration.
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let store = MemStore::new();
        let pins = PinTable::new();
        let engine = Engine {
            acl: Acl::from_config(&config),
            producers: ProducerRegistry::new(config.live.clone(), store.clone(), pins.clone()),
            limiter: ConnectionLimiter::new(
                config.server.max_connections,
                config.server.max_per_peer,
            ),
            store,
            pins,
            hook: None,
            sink: None,
            config,
        };
        Self {
            engine,
            sessions: Vec::new(),
            ids: IdAllocator::new(),
        }
    }

    /// Install a request hook consulted before the core handles a request.
    pub fn with_hook(mut self, hook: impl RequestHook + 'static) -> Self {
        self.engine.hook = Some(Box::new(hook));
        self
    }

    /// Install the sink receiving uploads in source mode.
    pub fn with_sink(mut self, sink: impl IngestSink + 'static) -> Self {
        self.engine.sink = Some(Box::new(sink));
        self
    }

    pub fn config(&self) -> &Config {
        &self.engine.config
    }

    /// Adopt a new connection. Returns `None` when a connection cap refuses it.
    pub fn accept(&mut self, mut transport: Box<dyn Transport>) -> Option<SessionId> {
        let peer = transport.peer();
        let slot = match self.engine.limiter.try_acquire(peer.ip()) {
            Ok(slot) => slot,
            Err(_) => {
                transport.shutdown();
                return None;
            }
        };
        let id: SessionId = self.ids.next();
        info!(session = %id, %peer, "connection accepted");
        self.sessions.push(Session::new(
            id,
            transport,
            slot,
            self.engine.config.server.block_size,
            Instant::now(),
        ));
        Some(id)
    }

    /// Tick every session once, close idle ones and collect garbage.
    /// Returns whether any session made progress.
    pub fn tick(&mut self, now: Instant) -> bool {
        let timeout = match self.engine.config.server.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let mut progressed = false;
        for session in &mut self.sessions {
            if session.tick(&mut self.engine, now) {
                progressed = true;
            }
            if let Some(timeout) = timeout {
                if !session.is_closed() && session.idle_for(now) > timeout {
                    session.close(&mut self.engine, "idle timeout");
                }
            }
        }
        let before = self.sessions.len();
        self.sessions.retain(|s| !s.is_closed());
        if self.sessions.len() != before {
            debug!(
                released = before - self.sessions.len(),
                active = self.sessions.len(),
                "sessions released"
            );
        }
        self.engine.producers.gc();
        progressed
    }

    /// Run the event loop on `listener` until `cancel` fires.
    pub async fn run(&mut self, listener: TcpListener, cancel: CancellationToken) -> io::Result<()> {
        let mut wake = IDLE_WAKE;
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.accept(Box::new(TcpTransport::new(stream, peer)));
                    }
                    Err(e) => warn!("accept failed: {}", e),
                },
                _ = tokio::time::sleep(wake) => {}
                _ = cancel.cancelled() => break,
            }
            let progressed = self.tick(Instant::now());
            wake = if progressed { Duration::ZERO } else { IDLE_WAKE };
            if progressed {
                tokio::task::yield_now().await;
            }
        }
        self.shutdown();
        Ok(())
    }

    /// Close every session.
    pub fn shutdown(&mut self) {
        for session in &mut self.sessions {
            session.close(&mut self.engine, "server shutdown");
        }
        self.sessions.clear();
        self.engine.producers.gc();
    }

    pub fn producers(&self) -> &ProducerRegistry {
        &self.engine.producers
    }

    /// Drive live producers directly.
    pub fn producers_mut(&mut self) -> &mut ProducerRegistry {
        &mut self.engine.producers
    }

    pub fn store(&self) -> &MemStore {
        &self.engine.store
    }

    /// Where `path` is stored under the deepest writable mount.
    pub fn location_for(&self, path: &str) -> Result<ResourceLocation> {
        self.engine.location_for(path)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn limiter(&self) -> &ConnectionLimiter {
        &self.engine.limiter
    }
}

/// Bind the configured address and serve until Ctrl+C or SIGTERM.
pub async fn start_server(config: Config) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Starting server on {}", addr);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    let source_mode = config.server.source_mode;
    let mut server = Server::new(config);
    if source_mode {
        // Without an embedder the forwarded uploads only reach the log.
        let (sink, mut events) = ChannelSink::new();
        server = server.with_sink(sink);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    IngestEvent::Data { session, bytes } => {
                        tracing::trace!(%session, bytes = bytes.len(), "ingest data")
                    }
                    other => info!(?other, "ingest event"),
                }
            }
        });
    }
    server.run(listener, cancel).await?;
    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
