//! Protocol enums shared by the wire helpers and the session engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Request method understood by the server.
///
/// Anything else is rejected with 501 before resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// Download a resource.
    Get,
    /// Download headers only.
    Head,
    /// Upload (create or overwrite) a resource.
    Put,
    /// Upload, treated like PUT.
    Post,
    /// Remove a resource.
    Delete,
    /// CORS preflight.
    Options,
}

impl Method {
    /// Parse a request-line method token. Method names are case-sensitive.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "GET" => Some(Self::Get),
            "HEAD" => Some(Self::Head),
            "PUT" => Some(Self::Put),
            "POST" => Some(Self::Post),
            "DELETE" => Some(Self::Delete),
            "OPTIONS" => Some(Self::Options),
            _ => None,
        }
    }

    /// Whether the method modifies the resource and needs a write principal.
    pub fn is_write(self) -> bool {
        matches!(self, Self::Put | Self::Post | Self::Delete)
    }

    /// Whether the method carries a request body to ingest.
    pub fn has_upload_body(self) -> bool {
        matches!(self, Self::Put | Self::Post)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Head => write!(f, "HEAD"),
            Self::Put => write!(f, "PUT"),
            Self::Post => write!(f, "POST"),
            Self::Delete => write!(f, "DELETE"),
            Self::Options => write!(f, "OPTIONS"),
        }
    }
}

/// Protocol version of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpVersion {
    /// HTTP/1.0, non-persistent unless asked for.
    Http10,
    /// HTTP/1.1, persistent by default.
    Http11,
    /// One logical HTTP/2 stream; framing belongs to the transport.
    Http2,
}

impl HttpVersion {
    /// Parse the version token of a request line.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "HTTP/1.0" => Some(Self::Http10),
            "HTTP/1.1" => Some(Self::Http11),
            "HTTP/2" | "HTTP/2.0" => Some(Self::Http2),
            _ => None,
        }
    }

    /// Whether body framing is handled by the transport rather than by
    /// chunked transfer coding.
    pub fn is_multiplexed(self) -> bool {
        matches!(self, Self::Http2)
    }

    /// Whether chunked transfer coding may be used on this connection.
    pub fn supports_chunked(self) -> bool {
        matches!(self, Self::Http11)
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http10 => write!(f, "HTTP/1.0"),
            Self::Http11 => write!(f, "HTTP/1.1"),
            Self::Http2 => write!(f, "HTTP/2"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse() {
        assert_eq!(Method::parse("GET"), Some(Method::Get));
        assert_eq!(Method::parse("DELETE"), Some(Method::Delete));
        assert_eq!(Method::parse("get"), None);
        assert_eq!(Method::parse("TRACE"), None);
    }

    #[test]
    fn test_method_classes() {
        assert!(Method::Put.is_write());
        assert!(Method::Delete.is_write());
        assert!(!Method::Head.is_write());
        assert!(Method::Post.has_upload_body());
        assert!(!Method::Delete.has_upload_body());
    }

    #[test]
    fn test_method_display_round_trip() {
        for m in [
            Method::Get,
            Method::Head,
            Method::Put,
            Method::Post,
            Method::Delete,
            Method::Options,
        ] {
            assert_eq!(Method::parse(&m.to_string()), Some(m));
        }
    }

    #[test]
    fn test_version_parse() {
        assert_eq!(HttpVersion::parse("HTTP/1.1"), Some(HttpVersion::Http11));
        assert_eq!(HttpVersion::parse("HTTP/1.0"), Some(HttpVersion::Http10));
        assert_eq!(HttpVersion::parse("HTTP/2"), Some(HttpVersion::Http2));
        assert_eq!(HttpVersion::parse("HTTP/3"), None);
    }

    #[test]
    fn test_version_framing() {
        assert!(HttpVersion::Http11.supports_chunked());
        assert!(!HttpVersion::Http10.supports_chunked());
        assert!(HttpVersion::Http2.is_multiplexed());
        assert!(!HttpVersion::Http2.supports_chunked());
    }
}
