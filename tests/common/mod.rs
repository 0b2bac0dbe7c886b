//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which builds a [`Server`] over a temporary disk
//! mount plus a memory mount at `/mem`, and drives in-memory connections
//! ([`MockConn`]) tick by tick. [`TestHarness::spawn`] instead runs the real
//! event loop on a random port for HTTP-level testing with `reqwest`.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use liveorigin::config::{Config, MountConfig};
use liveorigin::server::{Server, Transport};
use liveorigin_http::ChunkedDecoder;

#[derive(Debug, Default)]
struct Wire {
    input: VecDeque<u8>,
    output: Vec<u8>,
    /// Client half-closed: reads return 0 once input is drained.
    eof: bool,
    /// Connection reset: every call fails.
    reset: bool,
    /// Bytes the "socket" still accepts; `None` is unlimited.
    budget: Option<usize>,
    shutdowns: usize,
}

/// Client end of an in-memory connection.
#[derive(Debug, Clone)]
pub struct MockConn {
    wire: Arc<Mutex<Wire>>,
    peer: SocketAddr,
}

impl MockConn {
    fn new(peer: SocketAddr) -> Self {
        Self {
            wire: Arc::new(Mutex::new(Wire::default())),
            peer,
        }
    }

    pub fn transport(&self) -> Box<dyn Transport> {
        Box::new(MockTransport { conn: self.clone() })
    }

    pub fn send(&self, bytes: &[u8]) {
        self.wire.lock().input.extend(bytes.iter().copied());
    }

    /// Everything the server wrote so far.
    pub fn output(&self) -> Vec<u8> {
        self.wire.lock().output.clone()
    }

    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.wire.lock().output)
    }

    /// Limit how many more bytes the server may write.
    pub fn set_budget(&self, budget: Option<usize>) {
        self.wire.lock().budget = budget;
    }

    pub fn close_input(&self) {
        self.wire.lock().eof = true;
    }

    pub fn reset(&self) {
        self.wire.lock().reset = true;
    }

    /// How many times the server shut the connection down.
    pub fn shutdowns(&self) -> usize {
        self.wire.lock().shutdowns
    }
}

struct MockTransport {
    conn: MockConn,
}

impl Transport for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut wire = self.conn.wire.lock();
        if wire.reset {
            return Err(io::ErrorKind::ConnectionReset.into());
        }
        if wire.input.is_empty() {
            return if wire.eof {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(wire.input.len());
        for (slot, byte) in buf.iter_mut().zip(wire.input.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut wire = self.conn.wire.lock();
        if wire.reset {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = match wire.budget {
            Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(budget) => budget.min(buf.len()),
            None => buf.len(),
        };
        if let Some(budget) = wire.budget.as_mut() {
            *budget -= n;
        }
        wire.output.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn peer(&self) -> SocketAddr {
        self.conn.peer
    }

    fn shutdown(&mut self) {
        self.conn.wire.lock().shutdowns += 1;
    }
}

/// A parsed response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parse one complete response from the front of `raw`. Returns it with
    /// the number of bytes used, or `None` when `raw` holds less than a
    /// full response.
    pub fn parse(raw: &[u8], head_only: bool) -> Option<(Self, usize)> {
        let end = raw.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
        let head = std::str::from_utf8(&raw[..end]).ok()?;
        let mut lines = head.split("\r\n");
        let status: u16 = lines.next()?.split(' ').nth(1)?.parse().ok()?;
        let headers: Vec<(String, String)> = lines
            .filter(|l| !l.is_empty())
            .filter_map(|l| l.split_once(':'))
            .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
            .collect();
        let mut response = Response {
            status,
            headers,
            body: Vec::new(),
        };
        if head_only || status == 204 || status == 304 || status == 100 {
            return Some((response, end));
        }
        let rest = &raw[end..];
        if response
            .header("transfer-encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
        {
            let mut decoder = ChunkedDecoder::new();
            let used = decoder.decode(rest, &mut response.body).ok()?;
            if !decoder.is_done() {
                return None;
            }
            return Some((response, end + used));
        }
        match response.header("content-length") {
            Some(len) => {
                let len: usize = len.parse().ok()?;
                if rest.len() < len {
                    return None;
                }
                response.body = rest[..len].to_vec();
                Some((response, end + len))
            }
            None => {
                response.body = rest.to_vec();
                Some((response, raw.len()))
            }
        }
    }
}

/// Test harness: a server over a temporary disk mount.
pub struct TestHarness {
    pub server: Server,
    pub dir: TempDir,
    next_port: u16,
}

impl TestHarness {
    /// Server with a read/write disk mount at `/` and a memory mount at `/mem`.
    pub fn new() -> Self {
        Self::with_config(|_, _| {})
    }

    /// Like [`TestHarness::new`], with `tweak` applied to the config first.
    pub fn with_config(tweak: impl FnOnce(&mut Config, &Path)) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let config = Self::config_for(dir.path(), tweak);
        Self {
            server: Server::new(config),
            dir,
            next_port: 40000,
        }
    }

    /// Rebuild the server through `f`, e.g. to install a hook or sink.
    pub fn map_server(self, f: impl FnOnce(Server) -> Server) -> Self {
        let Self {
            server,
            dir,
            next_port,
        } = self;
        Self {
            server: f(server),
            dir,
            next_port,
        }
    }

    pub fn config_for(root: &Path, tweak: impl FnOnce(&mut Config, &Path)) -> Config {
        let mut config = Config::default();
        config.mounts.push(MountConfig {
            write: "$ALL".to_string(),
            ..MountConfig::disk(root)
        });
        config.mounts.push(MountConfig::memory(Some("mem")));
        tweak(&mut config, root);
        config
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Create a file under the disk mount.
    pub fn write_file(&self, rel: &str, data: &[u8]) -> PathBuf {
        let path = self.dir.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("failed to create parent");
        }
        std::fs::write(&path, data).expect("failed to write file");
        path
    }

    /// Open a connection from 127.0.0.1.
    pub fn connect(&mut self) -> MockConn {
        self.connect_from(IpAddr::from([127, 0, 0, 1]))
            .expect("connection refused")
    }

    pub fn connect_from(&mut self, ip: IpAddr) -> Option<MockConn> {
        self.next_port += 1;
        let conn = MockConn::new(SocketAddr::new(ip, self.next_port));
        self.server.accept(conn.transport()).map(|_| conn)
    }

    /// Tick until nothing moves.
    pub fn run(&mut self) {
        for _ in 0..10_000 {
            if !self.server.tick(Instant::now()) {
                return;
            }
        }
        panic!("server never went idle");
    }

    /// Send one raw request on a fresh connection and parse the reply. The
    /// client hangs up afterwards so the session is released.
    pub fn request(&mut self, raw: &[u8]) -> Response {
        let head_only = raw.starts_with(b"HEAD ");
        let conn = self.connect();
        conn.send(raw);
        self.run();
        conn.close_input();
        self.run();
        let out = conn.output();
        Response::parse(&out, head_only)
            .map(|(r, _)| r)
            .unwrap_or_else(|| panic!("incomplete response: {:?}", String::from_utf8_lossy(&out)))
    }

    /// `GET path` with extra header lines.
    pub fn get(&mut self, path: &str, headers: &[(&str, &str)]) -> Response {
        self.request(&build("GET", path, headers, None))
    }

    /// `PUT path` with a content-length body.
    pub fn put(&mut self, path: &str, body: &[u8]) -> Response {
        self.request(&build("PUT", path, &[], Some(body)))
    }

    /// Run the real event loop on a random port.
    pub async fn spawn(config: Config) -> (SocketAddr, CancellationToken) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind random port");
        let addr = listener.local_addr().expect("failed to get local addr");
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            let mut server = Server::new(config);
            server.run(listener, token).await.ok();
        });
        (addr, cancel)
    }
}

/// Build a raw HTTP/1.1 request.
pub fn build(method: &str, path: &str, headers: &[(&str, &str)], body: Option<&[u8]>) -> Vec<u8> {
    let mut raw = format!("{method} {path} HTTP/1.1\r\nHost: test\r\n");
    for (name, value) in headers {
        raw.push_str(&format!("{name}: {value}\r\n"));
    }
    if let Some(body) = body {
        raw.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    raw.push_str("\r\n");
    let mut raw = raw.into_bytes();
    if let Some(body) = body {
        raw.extend_from_slice(body);
    }
    raw
}

/// Encode `parts` as a chunked body.
pub fn chunked(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for part in parts {
        liveorigin_http::encode_chunk(part, &mut out);
    }
    out.extend_from_slice(liveorigin_http::LAST_CHUNK);
    out
}
