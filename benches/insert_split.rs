use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use btcow::{Engine, OpenOptions, PutFlags};

const VALUE_SIZE: usize = 100;
const SEED: u64 = 42;

/// Pre-existing entry counts to measure insert latency against, forcing the
/// tree through progressively deeper split paths.
const DB_SIZES: &[usize] = &[0, 1_000, 10_000, 100_000];

fn bench_data_dir() -> PathBuf {
    PathBuf::from("target/bench-data-insert-split")
}

fn db_path(name: &str) -> PathBuf {
    bench_data_dir().join(format!("{name}.btcow"))
}

fn sequential_key(i: usize) -> Vec<u8> {
    format!("key_{i:010}").into_bytes()
}

fn random_key(rng: &mut StdRng) -> Vec<u8> {
    format!("key_{:016x}", rng.next_u64()).into_bytes()
}

fn create_engine(name: &str, pre_populate: usize) -> Engine {
    let path = db_path(name);
    let _ = fs::remove_file(&path);
    let mut engine = Engine::open(&path, OpenOptions::new()).expect("open");
    let value = vec![b'x'; VALUE_SIZE];
    for i in 0..pre_populate {
        engine.put(&sequential_key(i), &value, PutFlags::empty()).expect("seed insert");
    }
    engine
}

fn insert_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_latency");
    group.sample_size(30);
    group.measurement_time(Duration::from_secs(15));

    let value = vec![b'x'; VALUE_SIZE];
    let _ = fs::remove_dir_all(bench_data_dir());

    for db_size in DB_SIZES {
        let mut engine = create_engine(&format!("db_{db_size}"), *db_size);
        let mut rng = StdRng::seed_from_u64(SEED);
        let keys: Vec<Vec<u8>> = (0..1000).map(|_| random_key(&mut rng)).collect();
        let idx = std::cell::Cell::new(0);

        group.bench_with_input(BenchmarkId::from_parameter(db_size), db_size, |b, _| {
            b.iter(|| {
                let i = idx.get();
                let key = &keys[i % keys.len()];
                engine.put(key, &value, PutFlags::empty()).expect("insert");
                idx.set(i + 1);
                black_box(&engine);
            });
        });
    }

    group.finish();
}

fn bulk_load_and_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulk_load");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(15));

    let value = vec![b'x'; VALUE_SIZE];

    group.bench_function("sequential_10k", |b| {
        b.iter(|| {
            let path = db_path("bulk_load_scratch");
            let _ = fs::remove_file(&path);
            let mut engine = Engine::open(&path, OpenOptions::new()).expect("open");
            for i in 0..10_000 {
                engine.put(&sequential_key(i), &value, PutFlags::empty()).expect("insert");
            }
            black_box(engine.stat().depth);
        });
    });

    group.finish();
}

criterion_group!(benches, insert_latency, bulk_load_and_split);
criterion_main!(benches);
