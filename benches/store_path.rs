//! Benchmarks for the store path
//!
//! Run with: cargo bench --bench store_path

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use tempfile::tempdir;

use loamdb::dict::{TypeDefinition, TypeMember};
use loamdb::{DistributionStrategy, StorageConfig, StorageManager};

fn bench_storage(dir: &std::path::Path, channels: usize) -> StorageManager {
  let config = StorageConfig::new(dir)
    .channel_count(channels)
    .housekeeping_interval_ms(3_600_000)
    .distribution_strategy(DistributionStrategy::HashByObjectId);
  StorageManager::start(config).expect("storage starts")
}

fn record_type() -> TypeDefinition {
  TypeDefinition::new(
    "BenchRecord",
    false,
    vec![TypeMember::variable("bytes", "byte[]", 0)],
  )
}

fn bench_store_batches(c: &mut Criterion) {
  let mut group = c.benchmark_group("store");

  for &(channels, batch, payload) in &[(1usize, 64usize, 256usize), (4, 64, 256), (4, 256, 1024)] {
    let temp_dir = tempdir().expect("tempdir");
    let storage = bench_storage(temp_dir.path(), channels);
    let tid = storage
      .type_dictionary()
      .register_type(record_type())
      .expect("register");

    group.throughput(Throughput::Elements(batch as u64));
    group.bench_function(
      format!("{channels}ch_{batch}x{payload}B"),
      |bencher| {
        bencher.iter_batched(
          || vec![0xA5u8; payload],
          |payload_bytes| {
            let mut storer = storage.create_storer();
            for _ in 0..batch {
              storer.put(tid, payload_bytes.clone());
            }
            storer.commit().expect("commit");
          },
          BatchSize::SmallInput,
        );
      },
    );
    storage.shutdown();
  }
  group.finish();
}

fn bench_load_after_eviction(c: &mut Criterion) {
  let temp_dir = tempdir().expect("tempdir");
  let config = StorageConfig::new(temp_dir.path())
    .channel_count(2)
    .housekeeping_interval_ms(3_600_000)
    .entity_cache_timeout_ms(0);
  let storage = StorageManager::start(config).expect("storage starts");
  let tid = storage
    .type_dictionary()
    .register_type(record_type())
    .expect("register");

  let mut storer = storage.create_storer();
  let oids: Vec<_> = (0..1024).map(|_| storer.put(tid, vec![7u8; 512])).collect();
  storer.commit().expect("commit");

  c.bench_function("load_1k_cold", |bencher| {
    bencher.iter(|| {
      std::thread::sleep(std::time::Duration::from_millis(1));
      storage.issue_full_cache_check().expect("evict");
      storage.load(&oids).expect("load")
    });
  });
  storage.shutdown();
}

criterion_group!(benches, bench_store_batches, bench_load_after_eviction);
criterion_main!(benches);
