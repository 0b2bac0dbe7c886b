//! Byte transport under a session.
//!
//! Sessions never await: they try to read or write and treat
//! [`io::ErrorKind::WouldBlock`] as "nothing to do this tick".

use std::io;
use std::net::{Shutdown, SocketAddr};

use liveorigin_common::HttpVersion;

/// Non-blocking byte stream of one session.
///
/// A TLS-wrapped stream or one HTTP/2 stream of a multiplexed connection
/// implements this the same way a plain TCP socket does.
pub trait Transport: Send {
    /// Read available bytes. `Ok(0)` means the peer closed its side.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write as much of `buf` as the socket accepts right now.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn peer(&self) -> SocketAddr;

    /// Protocol imposed by the transport, `None` when the request line decides.
    fn version(&self) -> Option<HttpVersion> {
        None
    }

    /// Close both directions.
    fn shutdown(&mut self);
}

/// Plain TCP transport over a tokio socket.
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<tokio::net::TcpStream>,
    peer: SocketAddr,
}

impl TcpTransport {
    pub fn new(stream: tokio::net::TcpStream, peer: SocketAddr) -> Self {
        let _ = stream.set_nodelay(true);
        Self {
            stream: Some(stream),
            peer,
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport shut down")
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.as_ref().ok_or_else(closed)?.try_read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.as_ref().ok_or_else(closed)?.try_write(buf)
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn shutdown(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Ok(std) = stream.into_std() {
                let _ = std.shutdown(Shutdown::Both);
            }
        }
    }
}
