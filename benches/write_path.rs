//! Write-path throughput: how many `Table::put` calls per second at a
//! realistic payload size, with the default memtable rotation
//! threshold.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use seqstore::{Engine, EngineConfig};
use tempfile::TempDir;

fn bench_put(c: &mut Criterion) {
    c.bench_function("table_put_100b_payload", |b| {
        b.iter_batched(
            || {
                let tmp = TempDir::new().unwrap();
                let engine = Engine::open(tmp.path()).unwrap();
                let table = engine.create_table("events", EngineConfig::default()).unwrap();
                (tmp, table)
            },
            |(_tmp, table)| {
                for i in 0..1_000u64 {
                    table.put(i, vec![0u8; 100]).unwrap();
                }
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, bench_put);
criterion_main!(benches);
