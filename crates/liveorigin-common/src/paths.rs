//! Path utilities for content-type detection and URL path hygiene.
//!
//! MIME types are guessed from the file extension. Media segment, manifest
//! and text types are listed explicitly; anything else is served as
//! `application/octet-stream`.

use std::path::{Component, Path, PathBuf};

/// Extension to MIME type table.
const MIME_TYPES: &[(&str, &str)] = &[
    ("mpd", "application/dash+xml"),
    ("m3u8", "application/vnd.apple.mpegurl"),
    ("m4s", "video/iso.segment"),
    ("cmfv", "video/mp4"),
    ("cmfa", "audio/mp4"),
    ("mp4", "video/mp4"),
    ("m4v", "video/mp4"),
    ("m4a", "audio/mp4"),
    ("ts", "video/mp2t"),
    ("mkv", "video/x-matroska"),
    ("webm", "video/webm"),
    ("mp3", "audio/mpeg"),
    ("aac", "audio/aac"),
    ("vtt", "text/vtt"),
    ("ttml", "application/ttml+xml"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("txt", "text/plain"),
    ("css", "text/css"),
    ("js", "text/javascript"),
    ("json", "application/json"),
    ("xml", "application/xml"),
    ("svg", "image/svg+xml"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
];

/// Guess the MIME type of a path from its extension.
///
/// # Examples
///
/// ```
/// use liveorigin_common::paths::mime_for_path;
///
/// assert_eq!(mime_for_path("/live/manifest.mpd"), "application/dash+xml");
/// assert_eq!(mime_for_path("index.M3U8"), "application/vnd.apple.mpegurl");
/// assert_eq!(mime_for_path("blob"), "application/octet-stream");
/// ```
pub fn mime_for_path(path: impl AsRef<Path>) -> &'static str {
    path.as_ref()
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| {
            let ext = ext.to_ascii_lowercase();
            MIME_TYPES
                .iter()
                .find(|(e, _)| *e == ext)
                .map(|(_, mime)| *mime)
        })
        .unwrap_or("application/octet-stream")
}

/// Whether a MIME type is text-like and worth compressing.
///
/// # Examples
///
/// ```
/// use liveorigin_common::paths::is_compressible;
///
/// assert!(is_compressible("application/dash+xml"));
/// assert!(is_compressible("text/vtt"));
/// assert!(!is_compressible("video/mp4"));
/// ```
pub fn is_compressible(mime: &str) -> bool {
    mime.starts_with("text/")
        || mime.ends_with("+xml")
        || mime.ends_with("/xml")
        || mime.ends_with("/json")
        || mime == "application/vnd.apple.mpegurl"
}

/// Turn a decoded URL path into a relative filesystem path.
///
/// Returns `None` when the path tries to escape its root (`..`), so callers
/// can never be tricked into joining outside a mount.
///
/// # Examples
///
/// ```
/// use std::path::PathBuf;
/// use liveorigin_common::paths::sanitize_url_path;
///
/// assert_eq!(sanitize_url_path("/a/b.mp4"), Some(PathBuf::from("a/b.mp4")));
/// assert_eq!(sanitize_url_path("/a/../../etc/passwd"), None);
/// ```
#[must_use]
pub fn sanitize_url_path(url_path: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(url_path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Percent-decode a URL path. Invalid escapes are kept verbatim.
///
/// # Examples
///
/// ```
/// use liveorigin_common::paths::percent_decode;
///
/// assert_eq!(percent_decode("/my%20file.mp4"), "/my file.mp4");
/// assert_eq!(percent_decode("/100%"), "/100%");
/// ```
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            if let Some(b) = hex {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
