//! Connection handling: keep-alive, limits, access control and headers.

mod common;

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use common::{build, Response, TestHarness};
use liveorigin::config::{CorsMode, UserConfig};
use liveorigin::server::{BufferBody, HookDecision, HookRequest, RequestHook};
use tokio::sync::oneshot;

fn responses(raw: &[u8]) -> Vec<Response> {
    let mut out = Vec::new();
    let mut rest = raw;
    while let Some((resp, used)) = Response::parse(rest, false) {
        out.push(resp);
        rest = &rest[used..];
        if rest.is_empty() {
            break;
        }
    }
    out
}

#[tokio::test]
async fn test_pipelined_requests_on_one_connection() {
    let mut h = TestHarness::new();
    h.write_file("a.txt", b"alpha");
    h.write_file("b.txt", b"beta");

    let conn = h.connect();
    let mut raw = build("GET", "/a.txt", &[], None);
    raw.extend(build("GET", "/b.txt", &[], None));
    conn.send(&raw);
    h.run();

    let got = responses(&conn.output());
    assert_eq!(got.len(), 2);
    assert_eq!(got[0].body, b"alpha");
    assert_eq!(got[0].header("connection"), Some("keep-alive"));
    assert_eq!(got[1].body, b"beta");
    assert_eq!(conn.shutdowns(), 0);
    assert_eq!(h.server.session_count(), 1);
}

#[tokio::test]
async fn test_connection_close_is_honored() {
    let mut h = TestHarness::new();
    h.write_file("a.txt", b"alpha");

    let conn = h.connect();
    conn.send(&build("GET", "/a.txt", &[("Connection", "close")], None));
    h.run();
    let (resp, _) = Response::parse(&conn.output(), false).unwrap();
    assert_eq!(resp.header("connection"), Some("close"));
    assert_eq!(conn.shutdowns(), 1);

    let conn = h.connect();
    conn.send(b"GET /a.txt HTTP/1.0\r\n\r\n");
    h.run();
    let text = String::from_utf8_lossy(&conn.output()).into_owned();
    assert!(text.starts_with("HTTP/1.0 200"), "{text}");
    assert_eq!(conn.shutdowns(), 1);
    assert_eq!(h.server.session_count(), 0);
}

#[tokio::test]
async fn test_too_many_client_errors_closes() {
    let mut h = TestHarness::with_config(|config, _| config.server.max_client_errors = 2);

    let conn = h.connect();
    let mut raw = Vec::new();
    for path in ["/missing1", "/missing2", "/missing3"] {
        raw.extend(build("GET", path, &[], None));
    }
    conn.send(&raw);
    h.run();

    let got = responses(&conn.output());
    assert_eq!(got.len(), 2);
    assert!(got.iter().all(|r| r.status == 404));
    assert_eq!(got[0].header("connection"), Some("keep-alive"));
    assert_eq!(got[1].header("connection"), Some("close"));
    assert_eq!(conn.shutdowns(), 1);
}

#[tokio::test]
async fn test_success_resets_error_count() {
    let mut h = TestHarness::with_config(|config, _| config.server.max_client_errors = 2);
    h.write_file("ok.txt", b"ok");

    let conn = h.connect();
    let mut raw = Vec::new();
    for path in ["/missing", "/ok.txt", "/missing", "/ok.txt"] {
        raw.extend(build("GET", path, &[], None));
    }
    conn.send(&raw);
    h.run();

    assert_eq!(responses(&conn.output()).len(), 4);
    assert_eq!(conn.shutdowns(), 0);
}

#[tokio::test]
async fn test_malformed_request_gets_400_and_close() {
    let mut h = TestHarness::new();
    let conn = h.connect();
    conn.send(b"GET relative HTTP/1.1\r\n\r\n");
    h.run();

    let (resp, _) = Response::parse(&conn.output(), false).unwrap();
    assert_eq!(resp.status, 400);
    assert_eq!(resp.header("connection"), Some("close"));
    assert_eq!(conn.shutdowns(), 1);
}

#[tokio::test]
async fn test_unknown_method_is_not_implemented() {
    let mut h = TestHarness::new();
    let resp = h.request(b"BREW /pot HTTP/1.1\r\nHost: test\r\n\r\n");
    assert_eq!(resp.status, 501);
    assert_eq!(
        resp.header("allow"),
        Some("GET, HEAD, PUT, POST, DELETE, OPTIONS")
    );
}

#[tokio::test]
async fn test_per_peer_and_global_caps() {
    let mut h = TestHarness::with_config(|config, _| {
        config.server.max_per_peer = 2;
        config.server.max_connections = 3;
    });
    let a: IpAddr = [10, 0, 0, 1].into();
    let b: IpAddr = [10, 0, 0, 2].into();
    let c: IpAddr = [10, 0, 0, 3].into();

    let first = h.connect_from(a).unwrap();
    let _second = h.connect_from(a).unwrap();
    assert!(h.connect_from(a).is_none());
    let _third = h.connect_from(b).unwrap();
    assert!(h.connect_from(c).is_none());
    assert_eq!(h.server.limiter().active(), 3);

    first.close_input();
    h.run();
    assert_eq!(h.server.limiter().active_from(a), 1);
    assert!(h.connect_from(c).is_some());
}

#[tokio::test]
async fn test_idle_timeout_closes_once() {
    let mut h = TestHarness::with_config(|config, _| config.server.idle_timeout_secs = 1);
    let conn = h.connect();
    assert_eq!(h.server.limiter().active(), 1);

    h.server.tick(Instant::now());
    assert_eq!(conn.shutdowns(), 0);

    let later = Instant::now() + Duration::from_secs(3);
    h.server.tick(later);
    h.server.tick(later);
    assert_eq!(conn.shutdowns(), 1);
    assert_eq!(h.server.session_count(), 0);
    assert_eq!(h.server.limiter().active(), 0);
}

#[tokio::test]
async fn test_idle_timeout_disabled() {
    let mut h = TestHarness::with_config(|config, _| config.server.idle_timeout_secs = 0);
    let conn = h.connect();
    h.server.tick(Instant::now() + Duration::from_secs(3600));
    assert_eq!(conn.shutdowns(), 0);
    assert_eq!(h.server.session_count(), 1);
}

fn with_user(config: &mut liveorigin::config::Config) {
    let hash = bcrypt::hash("secret", 4).unwrap();
    let mut users = HashMap::new();
    users.insert(
        "alice".to_string(),
        UserConfig {
            password_hash: hash,
            groups: vec!["staff".to_string()],
        },
    );
    config.users = users;
    config.mounts[0].read = "@staff".to_string();
    config.mounts[0].write = "alice".to_string();
}

#[tokio::test]
async fn test_basic_auth_on_restricted_mount() {
    let mut h = TestHarness::with_config(|config, _| with_user(config));
    h.write_file("private.txt", b"members only");

    let resp = h.get("/private.txt", &[]);
    assert_eq!(resp.status, 401);
    assert_eq!(
        resp.header("www-authenticate"),
        Some("Basic realm=\"liveorigin\"")
    );

    let resp = h.get("/private.txt", &[("Authorization", "Basic YWxpY2U6bm9wZQ==")]);
    assert_eq!(resp.status, 403);

    let resp = h.get("/private.txt", &[("Authorization", "Basic YWxpY2U6c2VjcmV0")]);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"members only");

    let resp = h.request(&build(
        "PUT",
        "/upload.txt",
        &[("Authorization", "Basic YWxpY2U6c2VjcmV0")],
        Some(b"data"),
    ));
    assert_eq!(resp.status, 201);
}

#[tokio::test]
async fn test_etag_and_not_modified() {
    let mut h = TestHarness::new();
    h.write_file("clip.ts", b"video");

    let resp = h.get("/clip.ts", &[]);
    let etag = resp.header("etag").unwrap().to_string();
    assert!(resp.header("last-modified").is_some());

    let resp = h.get("/clip.ts", &[("If-None-Match", &etag)]);
    assert_eq!(resp.status, 304);
    assert!(resp.body.is_empty());

    let resp = h.get("/clip.ts", &[("If-None-Match", "\"other\"")]);
    assert_eq!(resp.status, 200);
}

#[tokio::test]
async fn test_cache_control_none_disables_etags() {
    let mut h = TestHarness::with_config(|config, _| {
        config.server.cache_control = Some("none".to_string())
    });
    h.write_file("clip.ts", b"video");
    let resp = h.get("/clip.ts", &[]);
    assert!(resp.header("etag").is_none());
    assert!(resp.header("cache-control").is_none());

    let mut h = TestHarness::with_config(|config, _| {
        config.server.cache_control = Some("max-age=60".to_string())
    });
    h.write_file("clip.ts", b"video");
    let resp = h.get("/clip.ts", &[]);
    assert_eq!(resp.header("cache-control"), Some("max-age=60"));
}

#[tokio::test]
async fn test_options_and_cors() {
    let mut h = TestHarness::new();
    let resp = h.request(&build(
        "OPTIONS",
        "/anything",
        &[("Origin", "https://player.example")],
        None,
    ));
    assert_eq!(resp.status, 204);
    assert!(resp.header("allow").is_some());
    assert!(resp.header("access-control-allow-methods").is_some());
    assert_eq!(
        resp.header("access-control-allow-origin"),
        Some("https://player.example")
    );

    let mut h = TestHarness::with_config(|config, _| config.server.cors = CorsMode::Off);
    let resp = h.request(&build(
        "OPTIONS",
        "/anything",
        &[("Origin", "https://player.example")],
        None,
    ));
    assert_eq!(resp.status, 204);
    assert!(resp.header("access-control-allow-origin").is_none());
    assert!(resp.header("access-control-allow-methods").is_none());
}

#[tokio::test]
async fn test_small_text_is_compressed() {
    let mut h = TestHarness::new();
    let playlist = "#EXTM3U\n#EXT-X-VERSION:3\n".repeat(40);
    h.write_file("index.m3u8", playlist.as_bytes());

    let resp = h.get("/index.m3u8", &[("Accept-Encoding", "gzip")]);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("content-encoding"), Some("gzip"));
    assert_eq!(resp.header("vary"), Some("Accept-Encoding"));
    assert_eq!(&resp.body[..2], &[0x1f, 0x8b]);
    assert!(resp.body.len() < playlist.len());

    // Ranged requests get the identity encoding.
    let resp = h.get(
        "/index.m3u8",
        &[("Accept-Encoding", "gzip"), ("Range", "bytes=0-6")],
    );
    assert_eq!(resp.status, 206);
    assert!(resp.header("content-encoding").is_none());
    assert_eq!(resp.body, b"#EXTM3U");
}

#[tokio::test]
async fn test_directory_listing() {
    let mut h = TestHarness::new();
    h.write_file("shows/ep1.ts", b"1");
    h.write_file("shows/ep2.ts", b"2");
    assert_eq!(h.get("/shows/", &[]).status, 404);

    let mut h = TestHarness::with_config(|config, _| config.server.directory_listing = true);
    h.write_file("shows/ep1.ts", b"1");
    h.write_file("shows/ep2.ts", b"2");
    let resp = h.get("/shows/", &[]);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("content-type"), Some("text/html; charset=utf-8"));
    let html = resp.text();
    assert!(html.contains("ep1.ts"));
    assert!(html.contains("ep2.ts"));
}

#[tokio::test]
async fn test_path_escape_is_refused() {
    let mut h = TestHarness::new();
    let resp = h.get("/../etc/passwd", &[]);
    assert!(resp.status == 403 || resp.status == 404, "{}", resp.status);
}

fn route(req: &HookRequest<'_>) -> HookDecision {
    match req.path {
        "/blocked" => HookDecision::Reply {
            status: 403,
            body: None,
        },
        "/virtual.txt" => HookDecision::Reply {
            status: 200,
            body: Some(Box::new(
                BufferBody::new("generated").with_content_type("text/plain"),
            )),
        },
        _ => HookDecision::FallThrough,
    }
}

#[tokio::test]
async fn test_request_hook_answers() {
    let mut h = TestHarness::new().map_server(|server| server.with_hook(route));
    h.write_file("real.txt", b"on disk");

    assert_eq!(h.get("/blocked", &[]).status, 403);

    let resp = h.get("/virtual.txt", &[]);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"generated");
    assert_eq!(resp.header("content-type"), Some("text/plain"));

    assert_eq!(h.get("/real.txt", &[]).body, b"on disk");
}

/// Defers the first request to a channel, lets later ones through.
struct Deferred(Option<oneshot::Receiver<HookDecision>>);

impl RequestHook for Deferred {
    fn decide(&mut self, _request: &HookRequest<'_>) -> HookDecision {
        match self.0.take() {
            Some(rx) => HookDecision::Pending(rx),
            None => HookDecision::FallThrough,
        }
    }
}

#[tokio::test]
async fn test_request_hook_can_defer() {
    let (tx, rx) = oneshot::channel();
    let mut h = TestHarness::new().map_server(|server| server.with_hook(Deferred(Some(rx))));
    h.write_file("later.txt", b"worth the wait");

    let conn = h.connect();
    conn.send(&build("GET", "/later.txt", &[], None));
    h.run();
    assert!(conn.output().is_empty());

    tx.send(HookDecision::FallThrough).unwrap();
    h.run();
    let (resp, _) = Response::parse(&conn.output(), false).unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"worth the wait");
}
