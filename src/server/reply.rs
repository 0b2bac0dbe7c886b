//! Headers common to every reply, error bodies and CORS preflight.

use http::StatusCode;

use liveorigin_http::{date, RequestHead, ResponseHead};

use crate::config::{CorsMode, ServerConfig};

const ALLOWED_METHODS: &str = "GET, HEAD, PUT, POST, DELETE, OPTIONS";

/// Add `Server`, `Date`, `Connection` and CORS headers.
pub(crate) fn finish_head(
    head: &mut ResponseHead,
    config: &ServerConfig,
    request: Option<&RequestHead>,
    close: bool,
) {
    head.insert("Server", config.user_agent.clone());
    head.insert("Date", date::now());
    head.insert("Connection", if close { "close" } else { "keep-alive" });

    let origin = request.and_then(|r| r.header("origin"));
    match (config.cors, origin) {
        (CorsMode::Off, _) | (CorsMode::Auto, None) => {}
        (CorsMode::Auto, Some(origin)) | (CorsMode::On, Some(origin)) => {
            head.insert("Access-Control-Allow-Origin", origin.to_owned());
            head.insert("Access-Control-Allow-Credentials", "true");
            head.insert("Vary", vary_with(head.get("Vary"), "Origin"));
        }
        (CorsMode::On, None) => {
            head.insert("Access-Control-Allow-Origin", "*");
        }
    }
    if config.cors != CorsMode::Off && (origin.is_some() || config.cors == CorsMode::On) {
        head.insert(
            "Access-Control-Expose-Headers",
            "Content-Length, Content-Range, ETag",
        );
    }
}

fn vary_with(existing: Option<&str>, token: &str) -> String {
    match existing {
        Some(v) if v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)) => v.to_owned(),
        Some(v) => format!("{v}, {token}"),
        None => token.to_owned(),
    }
}

/// Reply head plus short `text/plain` body for an error status.
pub(crate) fn error_reply(status: StatusCode, detail: Option<&str>) -> (ResponseHead, Vec<u8>) {
    let mut body = format!(
        "{} {}\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Error")
    );
    if let Some(detail) = detail {
        body.push_str(detail);
        body.push('\n');
    }
    let mut head = ResponseHead::new(status)
        .with("Content-Type", "text/plain; charset=utf-8")
        .with("Content-Length", body.len().to_string());
    if status == StatusCode::UNAUTHORIZED {
        head.insert("WWW-Authenticate", "Basic realm=\"liveorigin\"");
    }
    if status == StatusCode::NOT_IMPLEMENTED || status == StatusCode::METHOD_NOT_ALLOWED {
        head.insert("Allow", ALLOWED_METHODS);
    }
    (head, body.into_bytes())
}

/// Bodyless reply (204, 304, upload completion).
pub(crate) fn empty_reply(status: StatusCode) -> ResponseHead {
    let head = ResponseHead::new(status);
    if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        head
    } else {
        head.with("Content-Length", "0")
    }
}

/// Answer to `OPTIONS`, including CORS preflight.
pub(crate) fn options_reply(config: &ServerConfig, request: &RequestHead) -> ResponseHead {
    let mut head = ResponseHead::new(StatusCode::NO_CONTENT).with("Allow", ALLOWED_METHODS);
    if config.cors != CorsMode::Off {
        head.insert("Access-Control-Allow-Methods", ALLOWED_METHODS);
        let requested = request
            .header("access-control-request-headers")
            .unwrap_or("Range, Content-Type, Authorization, X-Open-Range");
        head.insert("Access-Control-Allow-Headers", requested.to_owned());
        head.insert("Access-Control-Max-Age", "86400");
    }
    head
}
