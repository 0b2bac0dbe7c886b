//! Incremental HTTP/1.x request head parser.
//!
//! Bytes are accumulated by the session until [`parse_head`] finds the blank
//! line ending the head. Only the head is consumed; any body bytes that
//! arrived in the same read stay in the caller's buffer.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};

use liveorigin_common::paths::percent_decode;
use liveorigin_common::{Error, HttpVersion, Method, Result};

/// Largest request head accepted before the request is rejected.
pub const MAX_HEAD_SIZE: usize = 8192;

/// Header a client sends to state it understands open-ended ranges on a
/// resource whose total length is not known yet.
pub const OPEN_RANGE_HEADER: &str = "x-open-range";

/// Parsed request line and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Known method, `None` when the token is not one we handle.
    pub method: Option<Method>,
    /// Raw method token, kept for logging and the 501 reply.
    pub method_token: String,
    /// Percent-decoded path without query string.
    pub path: String,
    /// Raw query string, if any.
    pub query: Option<String>,
    pub version: HttpVersion,
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Declared `Content-Length`, rejecting garbage values.
    pub fn content_length(&self) -> Result<Option<u64>> {
        match self.header(header::CONTENT_LENGTH.as_str()) {
            None => Ok(None),
            Some(v) => v
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| Error::protocol(format!("invalid Content-Length: {v}"))),
        }
    }

    /// Whether the body uses chunked transfer coding.
    pub fn is_chunked(&self) -> bool {
        self.header(header::TRANSFER_ENCODING.as_str())
            .map(|v| {
                v.split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
            })
            .unwrap_or(false)
    }

    /// Whether the client wants the connection kept open after this exchange.
    pub fn wants_keep_alive(&self) -> bool {
        let connection = self.header(header::CONNECTION.as_str()).unwrap_or("");
        let has = |token: &str| {
            connection
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case(token))
        };
        match self.version {
            HttpVersion::Http10 => has("keep-alive"),
            HttpVersion::Http11 | HttpVersion::Http2 => !has("close"),
        }
    }

    /// Whether the client asked for an interim `100 Continue`.
    pub fn expects_continue(&self) -> bool {
        self.header(header::EXPECT.as_str())
            .map(|v| v.trim().eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false)
    }

    /// Whether the client signals it understands open-ended live ranges.
    pub fn accepts_open_ranges(&self) -> bool {
        self.header(OPEN_RANGE_HEADER)
            .map(|v| matches!(v.trim(), "1" | "yes" | "true"))
            .unwrap_or(false)
    }

    /// Decode `Authorization: Basic` credentials.
    ///
    /// Returns `None` when no header is present, and an error when the header
    /// is present but cannot be decoded.
    pub fn basic_credentials(&self) -> Result<Option<(String, String)>> {
        let Some(value) = self.header(header::AUTHORIZATION.as_str()) else {
            return Ok(None);
        };
        let encoded = value
            .strip_prefix("Basic ")
            .or_else(|| value.strip_prefix("basic "))
            .ok_or_else(|| Error::protocol("unsupported authorization scheme"))?;
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|_| Error::protocol("invalid basic credentials"))?;
        let decoded =
            String::from_utf8(decoded).map_err(|_| Error::protocol("invalid basic credentials"))?;
        let (user, pass) = decoded
            .split_once(':')
            .ok_or_else(|| Error::protocol("invalid basic credentials"))?;
        Ok(Some((user.to_owned(), pass.to_owned())))
    }
}

/// Try to parse a request head from the front of `buf`.
///
/// Returns `Ok(None)` while the head is incomplete, or the parsed head and
/// the number of bytes it occupied.
pub fn parse_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>> {
    let Some(end) = find_head_end(buf) else {
        if buf.len() > MAX_HEAD_SIZE {
            return Err(Error::protocol("request head too large"));
        }
        return Ok(None);
    };
    if end > MAX_HEAD_SIZE {
        return Err(Error::protocol("request head too large"));
    }

    let head = std::str::from_utf8(&buf[..end])
        .map_err(|_| Error::protocol("non-UTF-8 request head"))?;

    // Tolerate stray blank lines before the request line.
    let mut lines = head.split("\r\n").skip_while(|l| l.is_empty());

    let request_line = lines
        .next()
        .ok_or_else(|| Error::protocol("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method_token = parts
        .next()
        .ok_or_else(|| Error::protocol("missing method"))?
        .to_owned();
    let target = parts
        .next()
        .ok_or_else(|| Error::protocol("missing request target"))?;
    let version = parts
        .next()
        .and_then(HttpVersion::parse)
        .ok_or_else(|| Error::protocol("unsupported protocol version"))?;

    let (raw_path, query) = match target.split_once('?') {
        Some((p, q)) => (p, Some(q.to_owned())),
        None => (target, None),
    };
    // Absolute-form targets carry scheme and authority; keep only the path.
    let raw_path = match raw_path.find("://") {
        Some(idx) => {
            let after = &raw_path[idx + 3..];
            after.find('/').map(|p| &after[p..]).unwrap_or("/")
        }
        None => raw_path,
    };
    if !raw_path.starts_with('/') {
        return Err(Error::protocol(format!("invalid request target: {target}")));
    }

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::protocol(format!("malformed header line: {line}")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| Error::protocol(format!("invalid header name: {name}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| Error::protocol(format!("invalid header value for {name}")))?;
        headers.append(name, value);
    }

    let head = RequestHead {
        method: Method::parse(&method_token),
        method_token,
        path: percent_decode(raw_path),
        query,
        version,
        headers,
    };
    Ok(Some((head, end)))
}

/// Offset just past the `\r\n\r\n` terminating the head.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &[u8]) -> RequestHead {
        parse_head(raw).unwrap().unwrap().0
    }

    #[test]
    fn parses_simple_get() {
        let raw = b"GET /live/manifest.mpd HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (head, used) = parse_head(raw).unwrap().unwrap();
        assert_eq!(used, raw.len());
        assert_eq!(head.method, Some(Method::Get));
        assert_eq!(head.path, "/live/manifest.mpd");
        assert_eq!(head.version, HttpVersion::Http11);
        assert_eq!(head.header("host"), Some("localhost"));
    }

    #[test]
    fn incomplete_head_returns_none() {
        assert!(parse_head(b"GET / HTTP/1.1\r\nHost: x\r\n").unwrap().is_none());
    }

    #[test]
    fn leaves_body_bytes_unconsumed() {
        let raw = b"PUT /a.bin HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc";
        let (head, used) = parse_head(raw).unwrap().unwrap();
        assert_eq!(&raw[used..], b"abc");
        assert_eq!(head.content_length().unwrap(), Some(3));
    }

    #[test]
    fn unknown_method_is_kept_as_token() {
        let head = parse(b"TRACE / HTTP/1.1\r\n\r\n");
        assert_eq!(head.method, None);
        assert_eq!(head.method_token, "TRACE");
    }

    #[test]
    fn query_and_percent_decoding() {
        let head = parse(b"GET /my%20dir/file.mp4?t=10 HTTP/1.1\r\n\r\n");
        assert_eq!(head.path, "/my dir/file.mp4");
        assert_eq!(head.query.as_deref(), Some("t=10"));
    }

    #[test]
    fn absolute_form_target() {
        let head = parse(b"GET http://example.com:8080/x/y.ts HTTP/1.1\r\n\r\n");
        assert_eq!(head.path, "/x/y.ts");
    }

    #[test]
    fn rejects_oversized_head() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_SIZE + 10));
        assert!(parse_head(&raw).is_err());
    }

    #[test]
    fn rejects_bad_version_and_header() {
        assert!(parse_head(b"GET / SPDY/3\r\n\r\n").is_err());
        assert!(parse_head(b"GET / HTTP/1.1\r\nnocolon\r\n\r\n").is_err());
    }

    #[test]
    fn keep_alive_defaults_by_version() {
        assert!(parse(b"GET / HTTP/1.1\r\n\r\n").wants_keep_alive());
        assert!(!parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").wants_keep_alive());
        assert!(!parse(b"GET / HTTP/1.0\r\n\r\n").wants_keep_alive());
        assert!(parse(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n").wants_keep_alive());
    }

    #[test]
    fn chunked_and_expect() {
        let head = parse(
            b"PUT /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\nExpect: 100-continue\r\n\r\n",
        );
        assert!(head.is_chunked());
        assert!(head.expects_continue());
    }

    #[test]
    fn basic_credentials_decoding() {
        // "alice:secret"
        let head = parse(b"GET / HTTP/1.1\r\nAuthorization: Basic YWxpY2U6c2VjcmV0\r\n\r\n");
        assert_eq!(
            head.basic_credentials().unwrap(),
            Some(("alice".to_string(), "secret".to_string()))
        );

        let head = parse(b"GET / HTTP/1.1\r\nAuthorization: Bearer abc\r\n\r\n");
        assert!(head.basic_credentials().is_err());

        let head = parse(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(head.basic_credentials().unwrap(), None);
    }

    #[test]
    fn open_range_marker() {
        let head = parse(b"GET / HTTP/1.1\r\nX-Open-Range: 1\r\n\r\n");
        assert!(head.accepts_open_ranges());
        assert!(!parse(b"GET / HTTP/1.1\r\n\r\n").accepts_open_ranges());
    }
}
