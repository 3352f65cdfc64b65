use criterion::{criterion_group, criterion_main, Criterion};
use quorumkv_storage::StorageEngine;
use tempfile::TempDir;

fn bench_put(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = StorageEngine::open(dir.path()).unwrap();

    let mut ts = 0u64;
    c.bench_function("engine_put", |b| {
        b.iter(|| {
            ts += 1;
            engine.put("bench-key", "bench-value", ts, "bench-node");
        })
    });
}

fn bench_get(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = StorageEngine::open(dir.path()).unwrap();
    for i in 0..10_000u64 {
        engine.put(&format!("key-{i}"), "value", i, "bench-node");
    }

    c.bench_function("engine_get", |b| {
        b.iter(|| engine.get("key-5000"))
    });
}

fn bench_recover(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    {
        let engine = StorageEngine::open(dir.path()).unwrap();
        for i in 0..10_000u64 {
            engine.put(&format!("key-{i}"), "value", i, "bench-node");
        }
    }

    c.bench_function("engine_recover_10k", |b| {
        b.iter(|| {
            let engine = StorageEngine::open(dir.path()).unwrap();
            engine.recover().unwrap();
            assert_eq!(engine.size(), 10_000);
        })
    });
}

criterion_group!(benches, bench_put, bench_get, bench_recover);
criterion_main!(benches);
