mod common;

use std::time::{Duration, Instant};

use loamdb::dict::encode_reference_list;
use loamdb::{EntityChunk, ObjectGraph, StorageManager};
use tempfile::tempdir;

/// With the scheduler enabled, unreachable entities disappear and idle
/// payloads get evicted without any explicit housekeeping calls.
#[test]
fn background_housekeeping_reclaims_and_evicts() {
  let dir = tempdir().expect("tempdir");
  let config = common::test_config(dir.path(), 2)
    .housekeeping_interval_ms(10)
    .entity_cache_timeout_ms(50);
  let storage = StorageManager::start(config).expect("start");

  let person_tid = common::register_person(&storage);
  let folder_tid = common::register_folder(&storage);

  let storer = storage.create_storer();
  let kept = storer.reserve(person_tid);
  let orphan = storer.reserve(person_tid);
  drop(storer);

  storage.set_root(
    ObjectGraph::new(EntityChunk::new(
      0,
      folder_tid,
      encode_reference_list(&[kept]),
    ))
    .with_referenced(vec![
      EntityChunk::new(kept, person_tid, common::encode_person("kept", 1)),
      EntityChunk::new(orphan, person_tid, common::encode_person("orphan", 2)),
    ]),
  );
  storage.store_root().expect("store root");

  // The background collector reaps the orphan on its own.
  let deadline = Instant::now() + Duration::from_secs(10);
  loop {
    if storage.load(&[orphan]).expect("probe").is_empty() {
      break;
    }
    assert!(Instant::now() < deadline, "orphan was never collected");
    std::thread::sleep(Duration::from_millis(20));
  }
  assert_eq!(storage.load(&[kept]).expect("load kept").len(), 1);

  // And with a 50ms cache timeout, idle payloads drain to zero bytes.
  let deadline = Instant::now() + Duration::from_secs(10);
  loop {
    if storage.statistics().expect("stats").cached_bytes == 0 {
      break;
    }
    assert!(Instant::now() < deadline, "cache never drained");
    std::thread::sleep(Duration::from_millis(20));
  }

  // The data is all still on disk.
  let root = storage.root().expect("root").expect("exists");
  assert_eq!(
    loamdb::dict::decode_reference_list(root.tid, &root.payload).expect("refs"),
    vec![kept]
  );
  let stats = storage.statistics().expect("stats");
  assert!(stats.housekeeping.cycles_run > 0);
  assert!(storage.shutdown());
}
