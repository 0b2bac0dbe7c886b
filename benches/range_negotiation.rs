//! Benchmarks for request parsing and range negotiation
//!
//! Covers the per-request work done before any body byte moves.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use liveorigin_http::{negotiate, parse_head, ChunkedDecoder, ResourceExtent};

const SIZE: u64 = 4 * 1024 * 1024 * 1024;

fn request_with_range(range: &str) -> Vec<u8> {
    format!(
        "GET /live/channel1/segment_000123.ts HTTP/1.1\r\n\
         Host: origin.example\r\n\
         User-Agent: player/2.1\r\n\
         Accept: */*\r\n\
         Range: {range}\r\n\
         Connection: keep-alive\r\n\r\n"
    )
    .into_bytes()
}

fn bench_parse_head(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_head");

    let plain = b"GET /index.m3u8 HTTP/1.1\r\nHost: origin.example\r\n\r\n".to_vec();
    let ranged = request_with_range("bytes=0-1023");
    let partial = &ranged[..ranged.len() - 10];

    group.bench_function("minimal", |b| {
        b.iter(|| parse_head(black_box(&plain)));
    });
    group.bench_function("with_range", |b| {
        b.iter(|| parse_head(black_box(&ranged)));
    });
    group.bench_function("incomplete", |b| {
        b.iter(|| parse_head(black_box(partial)));
    });

    group.finish();
}

fn bench_negotiate(c: &mut Criterion) {
    let mut group = c.benchmark_group("negotiate");

    let cases = [
        ("none", None),
        ("closed", Some("bytes=1048576-2097151")),
        ("suffix", Some("bytes=-65536")),
        ("open", Some("bytes=1024-")),
    ];
    for (name, header) in cases {
        group.bench_with_input(BenchmarkId::new("known", name), &header, |b, header| {
            b.iter(|| negotiate(black_box(*header), ResourceExtent::Known(SIZE), false));
        });
    }

    group.bench_function("growing/open_opt_in", |b| {
        b.iter(|| negotiate(black_box(Some("bytes=4096-")), ResourceExtent::Growing, true));
    });

    for count in [2usize, 8, 32] {
        let header = (0..count)
            .map(|i| format!("{}-{}", i * 4096, i * 4096 + 1023))
            .collect::<Vec<_>>()
            .join(",");
        let header = format!("bytes={header}");
        group.bench_with_input(BenchmarkId::new("multi", count), &header, |b, header| {
            b.iter(|| negotiate(black_box(Some(header.as_str())), ResourceExtent::Known(SIZE), false));
        });
    }

    group.finish();
}

fn bench_chunked_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunked_decode");

    for block in [512usize, 4096, 65536] {
        let mut body = Vec::new();
        let data = vec![0x47u8; block];
        for _ in 0..16 {
            liveorigin_http::encode_chunk(&data, &mut body);
        }
        body.extend_from_slice(liveorigin_http::LAST_CHUNK);

        group.bench_with_input(BenchmarkId::from_parameter(block), &body, |b, body| {
            b.iter(|| {
                let mut decoder = ChunkedDecoder::new();
                let mut out = Vec::with_capacity(block * 16);
                decoder.decode(black_box(body), &mut out)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_parse_head, bench_negotiate, bench_chunked_decode);
criterion_main!(benches);
