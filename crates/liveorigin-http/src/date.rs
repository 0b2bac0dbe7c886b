//! HTTP dates (RFC 7231 IMF-fixdate).

use std::time::SystemTime;

use chrono::{DateTime, Utc};

/// Format a timestamp as an IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(at: SystemTime) -> String {
    let at: DateTime<Utc> = at.into();
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Current time as an IMF-fixdate.
pub fn now() -> String {
    http_date(SystemTime::now())
}

/// Strong entity tag built from modification time and size.
pub fn etag(modified: SystemTime, size: u64) -> String {
    let secs = modified
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("\"{secs:x}-{size:x}\"")
}
