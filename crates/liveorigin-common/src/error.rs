//! Request-level error type.
//!
//! Every failure that terminates a request funnels into [`Error`], which carries
//! enough context for the session manager to pick a reply status via
//! [`Error::http_status`] and decide whether the connection survives via
//! [`Error::closes_connection`].
//!
//! Would-block conditions are not represented here: they are absorbed at the
//! transport seam and simply mean "no progress this tick".

/// Unified error type for liveorigin.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed request line, header, body framing or range syntax.
    #[error("Bad request: {0}")]
    ClientProtocol(String),

    /// No producer, memory node or mount entry matches the request.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Credentials are required and were not supplied.
    #[error("Unauthorized")]
    Unauthorized,

    /// Credentials were supplied but do not grant access.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The method is known but cannot be applied to this resource.
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    /// The method is not handled at all.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Range syntax was valid but cannot be satisfied against the resource.
    #[error("Range not satisfiable: {0}")]
    UnsupportedRange(String),

    /// A second claimant tried to produce a destination already being produced.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The peer reset or closed the connection.
    #[error("Peer disconnected")]
    PeerDisconnected,

    /// Persisting upload data failed (disk or memory).
    #[error("Upstream write failure: {0}")]
    UpstreamWrite(String),

    /// An I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration is invalid.
    #[error("Config error: {0}")]
    Config(String),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new ClientProtocol error.
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::ClientProtocol(msg.into())
    }

    /// Create a new NotFound error.
    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a new Forbidden error.
    pub fn forbidden<S: Into<String>>(msg: S) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create a new UnsupportedRange error.
    pub fn range<S: Into<String>>(msg: S) -> Self {
        Self::UnsupportedRange(msg.into())
    }

    /// Create a new UpstreamWrite error.
    pub fn upstream<S: Into<String>>(msg: S) -> Self {
        Self::UpstreamWrite(msg.into())
    }

    /// Create a new Config error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new Internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Map this error to the status code sent back to the client.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::ClientProtocol(_) => 400,
            Error::NotFound(_) => 404,
            Error::Unauthorized => 401,
            Error::Forbidden(_) => 403,
            Error::MethodNotAllowed(_) => 405,
            Error::NotImplemented(_) => 501,
            Error::UnsupportedRange(_) => 416,
            Error::Conflict(_) => 409,
            Error::PeerDisconnected => 499,
            Error::UpstreamWrite(_) => 500,
            Error::Io(_) => 500,
            Error::Config(_) => 500,
            Error::Internal(_) => 500,
        }
    }

    /// Whether this error forces the underlying connection closed.
    ///
    /// Everything else resets the session for the next keep-alive request
    /// (subject to the consecutive-error limit enforced by the session).
    pub fn closes_connection(&self) -> bool {
        matches!(self, Error::PeerDisconnected | Error::UpstreamWrite(_))
    }

    /// Classify an I/O error raised while talking to the peer.
    pub fn from_peer_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected => Error::PeerDisconnected,
            _ => Error::Io(err),
        }
    }
}

/// Result type alias using the common Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::not_found("/live/seg.m4s");
        assert_eq!(err.to_string(), "Not found: /live/seg.m4s");

        let err = Error::Unauthorized;
        assert_eq!(err.to_string(), "Unauthorized");

        let err = Error::range("start beyond end");
        assert_eq!(err.to_string(), "Range not satisfiable: start beyond end");

        let err = Error::upstream("disk full");
        assert_eq!(err.to_string(), "Upstream write failure: disk full");
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(Error::protocol("bad line").http_status(), 400);
        assert_eq!(Error::Unauthorized.http_status(), 401);
        assert_eq!(Error::forbidden("alice").http_status(), 403);
        assert_eq!(Error::not_found("x").http_status(), 404);
        assert_eq!(Error::Conflict("x".into()).http_status(), 409);
        assert_eq!(Error::range("x").http_status(), 416);
        assert_eq!(Error::upstream("x").http_status(), 500);
        assert_eq!(Error::NotImplemented("TRACE".into()).http_status(), 501);
    }

    #[test]
    fn test_only_disconnect_and_upstream_close() {
        assert!(Error::PeerDisconnected.closes_connection());
        assert!(Error::upstream("x").closes_connection());
        assert!(!Error::not_found("x").closes_connection());
        assert!(!Error::range("x").closes_connection());
        assert!(!Error::Unauthorized.closes_connection());
    }

    #[test]
    fn test_from_peer_io() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(Error::from_peer_io(reset), Error::PeerDisconnected));

        let other = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(Error::from_peer_io(other), Error::Io(_)));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
    }
}
