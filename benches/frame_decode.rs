//! Frame decoding micro-benchmark.
//!
//! Measures `protocol::decode` across payload sizes and batch widths.
//!
//! ```bash
//! cargo bench --bench frame_decode
//! ```

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use toolbridge::protocol::decode;

/// Minimal tools/call request (~120 bytes).
fn small_request() -> Vec<u8> {
    json!({
        "jsonrpc": "2.0",
        "method": "tools/call",
        "params": {"name": "echo", "arguments": {"msg": "hi"}},
        "id": 1
    })
    .to_string()
    .into_bytes()
}

/// Medium request with nested arguments (~600 bytes).
fn medium_request() -> Vec<u8> {
    json!({
        "jsonrpc": "2.0",
        "method": "tools/call",
        "params": {
            "name": "http.fetch",
            "arguments": {
                "url": "https://internal.example/api/v2/records",
                "method": "POST",
                "headers": {
                    "content-type": "application/json",
                    "x-request-id": "req-abc-123"
                },
                "body": {
                    "query": "status:open assignee:me sort:updated",
                    "page_size": 50,
                    "include": ["comments", "attachments", "watchers"]
                }
            },
            "_meta": {"timeoutMs": 15000}
        },
        "id": "req-42"
    })
    .to_string()
    .into_bytes()
}

/// Batch of n small requests.
fn batch_request(n: usize) -> Vec<u8> {
    let items: Vec<serde_json::Value> = (0..n)
        .map(|i| {
            json!({
                "jsonrpc": "2.0",
                "method": "ping",
                "id": i
            })
        })
        .collect();
    serde_json::to_vec(&items).expect("serialize batch")
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    let small = small_request();
    group.bench_function("single_small", |b| {
        b.iter(|| decode(std::hint::black_box(&small)))
    });

    let medium = medium_request();
    group.bench_function("single_medium", |b| {
        b.iter(|| decode(std::hint::black_box(&medium)))
    });

    for width in [2usize, 10, 50] {
        let batch = batch_request(width);
        group.bench_with_input(BenchmarkId::new("batch", width), &batch, |b, bytes| {
            b.iter(|| decode(std::hint::black_box(bytes)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_decode);
criterion_main!(benches);
