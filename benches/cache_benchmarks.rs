//! Benchmarks for the hot path: cache lookups, negotiation and encoding.

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use static_serve::cache::{CacheEntry, CacheKey, ResponseCache};
use static_serve::compression::{self, CompressionPolicy, Encoding};
use static_serve::storage::ObjectMetadata;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn entry(size: usize) -> Arc<CacheEntry> {
    Arc::new(CacheEntry {
        body: Bytes::from(vec![b'x'; size]),
        encoding: Encoding::Identity,
        content_type: "text/css; charset=utf-8".to_string(),
        cache_control: "public, max-age=31536000, immutable".to_string(),
        etag: "\"bench\"".to_string(),
        metadata: ObjectMetadata::file("bench.css", size as u64, None),
        stored_at: Instant::now(),
        ttl: Duration::from_secs(600),
    })
}

fn bench_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache");

    let cache = ResponseCache::new(64 * 1024 * 1024);
    for i in 0..1000 {
        cache.insert(CacheKey::new(format!("assets/{}.css", i), Encoding::Identity), entry(4096));
    }
    let hot = CacheKey::new("assets/500.css", Encoding::Identity);
    let cold = CacheKey::new("assets/missing.css", Encoding::Identity);

    group.bench_function("get_hit", |b| {
        b.iter(|| black_box(cache.get(black_box(&hot))));
    });

    group.bench_function("get_miss", |b| {
        b.iter(|| black_box(cache.get(black_box(&cold))));
    });

    let small = ResponseCache::new(64 * 4096);
    let mut i = 0u64;
    group.bench_function("insert_with_eviction", |b| {
        b.iter(|| {
            i += 1;
            black_box(small.insert(CacheKey::new(format!("k{}", i), Encoding::Identity), entry(4096)));
        });
    });

    group.finish();
}

fn bench_negotiation(c: &mut Criterion) {
    let policy = CompressionPolicy::new(256, None);
    let headers = [
        "gzip",
        "gzip, deflate, br, zstd",
        "br;q=1.0, gzip;q=0.8, *;q=0.1",
    ];

    let mut group = c.benchmark_group("negotiation");
    for header in headers {
        group.bench_with_input(BenchmarkId::from_parameter(header), header, |b, header| {
            b.iter(|| black_box(policy.negotiate(Some(header), 4096, "text/css")));
        });
    }
    group.finish();
}

fn bench_encoding(c: &mut Criterion) {
    let body = "body { margin: 0; padding: 0; color: #333; }\n".repeat(2048);

    let mut group = c.benchmark_group("encoding");
    group.sample_size(20);
    for encoding in [Encoding::Gzip, Encoding::Brotli, Encoding::Zstd] {
        group.bench_with_input(BenchmarkId::from_parameter(encoding.token()), &encoding, |b, encoding| {
            b.iter(|| black_box(compression::encode(*encoding, body.as_bytes())));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_cache, bench_negotiation, bench_encoding);
criterion_main!(benches);
