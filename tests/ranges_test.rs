//! Byte-range requests against stored resources.

mod common;

use common::{build, TestHarness};

const DIGITS: &[u8] = b"0123456789";

#[tokio::test]
async fn test_full_get_advertises_ranges() {
    let mut h = TestHarness::new();
    h.write_file("clip.bin", DIGITS);

    let resp = h.get("/clip.bin", &[]);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, DIGITS);
    assert_eq!(resp.header("content-length"), Some("10"));
    assert_eq!(resp.header("accept-ranges"), Some("bytes"));
    assert!(resp.header("content-range").is_none());
}

#[tokio::test]
async fn test_closed_range() {
    let mut h = TestHarness::new();
    h.write_file("clip.bin", DIGITS);

    let resp = h.get("/clip.bin", &[("Range", "bytes=2-5")]);
    assert_eq!(resp.status, 206);
    assert_eq!(resp.body, b"2345");
    assert_eq!(resp.header("content-range"), Some("bytes 2-5/10"));
    assert_eq!(resp.header("content-length"), Some("4"));
}

#[tokio::test]
async fn test_open_and_suffix_ranges() {
    let mut h = TestHarness::new();
    h.write_file("clip.bin", DIGITS);

    let resp = h.get("/clip.bin", &[("Range", "bytes=7-")]);
    assert_eq!(resp.status, 206);
    assert_eq!(resp.body, b"789");
    assert_eq!(resp.header("content-range"), Some("bytes 7-9/10"));

    let resp = h.get("/clip.bin", &[("Range", "bytes=-4")]);
    assert_eq!(resp.status, 206);
    assert_eq!(resp.body, b"6789");
    assert_eq!(resp.header("content-range"), Some("bytes 6-9/10"));
}

#[tokio::test]
async fn test_range_covering_everything_is_plain_200() {
    let mut h = TestHarness::new();
    h.write_file("clip.bin", DIGITS);

    let resp = h.get("/clip.bin", &[("Range", "bytes=0-9")]);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, DIGITS);
}

#[tokio::test]
async fn test_unsatisfiable_ranges() {
    let mut h = TestHarness::new();
    h.write_file("clip.bin", DIGITS);

    for range in ["bytes=5-20", "bytes=10-", "bytes=6-3", "bytes=-0"] {
        let resp = h.get("/clip.bin", &[("Range", range)]);
        assert_eq!(resp.status, 416, "range {range}");
    }
}

#[tokio::test]
async fn test_malformed_range_is_bad_request() {
    let mut h = TestHarness::new();
    h.write_file("clip.bin", DIGITS);

    let resp = h.get("/clip.bin", &[("Range", "items=0-1")]);
    assert_eq!(resp.status, 400);
    let resp = h.get("/clip.bin", &[("Range", "bytes=a-b")]);
    assert_eq!(resp.status, 400);
}

#[tokio::test]
async fn test_multiple_ranges_are_concatenated() {
    let mut h = TestHarness::new();
    h.write_file("clip.bin", DIGITS);

    let resp = h.get("/clip.bin", &[("Range", "bytes=0-1,4-5,-2")]);
    assert_eq!(resp.status, 206);
    assert_eq!(resp.header("transfer-encoding"), Some("chunked"));
    assert_eq!(resp.body, b"014589");
}

#[tokio::test]
async fn test_head_sends_no_body() {
    let mut h = TestHarness::new();
    h.write_file("clip.bin", DIGITS);

    let conn = h.connect();
    conn.send(&build("HEAD", "/clip.bin", &[("Range", "bytes=1-3")], None));
    h.run();
    let out = conn.output();
    let text = String::from_utf8_lossy(&out);
    assert!(text.starts_with("HTTP/1.1 206"), "{text}");
    assert!(text.contains("Content-Length: 3\r\n"), "{text}");
    assert!(text.ends_with("\r\n\r\n"), "HEAD reply carried a body: {text}");
}

#[tokio::test]
async fn test_ranges_on_memory_nodes() {
    let mut h = TestHarness::new();
    let resp = h.put("/mem/buf.bin", DIGITS);
    assert_eq!(resp.status, 201);

    let resp = h.get("/mem/buf.bin", &[("Range", "bytes=3-4")]);
    assert_eq!(resp.status, 206);
    assert_eq!(resp.body, b"34");
    assert_eq!(resp.header("content-range"), Some("bytes 3-4/10"));
}

#[tokio::test]
async fn test_empty_file() {
    let mut h = TestHarness::new();
    h.write_file("empty.bin", b"");

    let resp = h.get("/empty.bin", &[]);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("content-length"), Some("0"));
    assert!(resp.body.is_empty());

    let resp = h.get("/empty.bin", &[("Range", "bytes=0-0")]);
    assert_eq!(resp.status, 416);
}
