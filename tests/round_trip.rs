mod common;

use loamdb::{EntityChunk, LoamError, ObjectGraph, StorageManager};
use tempfile::tempdir;

#[test]
fn single_entity_round_trip() {
  let dir = tempdir().expect("tempdir");

  let root_oid = {
    let storage = common::start(dir.path(), 4);
    let person_tid = common::register_person(&storage);
    storage.set_root(ObjectGraph::new(EntityChunk::new(
      0,
      person_tid,
      common::encode_person("alice", 30),
    )));
    let root_oid = storage.store_root().expect("store root");
    assert!(storage.shutdown());
    root_oid
  };

  let storage = common::start(dir.path(), 4);
  assert_eq!(storage.root_oid(), Some(root_oid));
  let root = storage.root().expect("load root").expect("root exists");
  let (name, age) = common::decode_person(&root.payload);
  assert_eq!(name, "alice");
  assert_eq!(age, 30);
  assert!(storage.shutdown());
}

#[test]
fn restore_root_after_restart_keeps_type() {
  let dir = tempdir().expect("tempdir");
  let person_tid = {
    let storage = common::start(dir.path(), 2);
    let person_tid = common::register_person(&storage);
    storage.set_root(ObjectGraph::new(EntityChunk::new(
      0,
      person_tid,
      common::encode_person("bob", 44),
    )));
    storage.store_root().expect("store root");
    assert!(storage.shutdown());
    person_tid
  };

  let storage = common::start(dir.path(), 2);
  let root = storage.root().expect("load").expect("exists");
  assert_eq!(root.tid, person_tid);
  // The dictionary was reloaded with the same id for the same type.
  assert_eq!(storage.type_dictionary().type_id("Person"), Some(person_tid));
  assert!(storage.shutdown());
}

#[test]
fn single_channel_boundary() {
  let dir = tempdir().expect("tempdir");

  let oids = {
    let storage = common::start(dir.path(), 1);
    let person_tid = common::register_person(&storage);
    let mut storer = storage.create_storer();
    let oids: Vec<_> = (0..20)
      .map(|i| storer.put(person_tid, common::encode_person(&format!("p{i}"), i)))
      .collect();
    assert_eq!(storer.commit().expect("commit"), 20);
    assert!(storage.shutdown());
    oids
  };

  let storage = common::start(dir.path(), 1);
  let loaded = storage.load(&oids).expect("load");
  assert_eq!(loaded.len(), 20);
  let stats = storage.statistics().expect("stats");
  assert_eq!(stats.channels.len(), 1);
  assert_eq!(stats.channels[0].entity_count, 20);
  assert!(storage.shutdown());
}

#[test]
fn payload_survives_eviction_and_reload() {
  let dir = tempdir().expect("tempdir");
  let config = common::test_config(dir.path(), 2).entity_cache_timeout_ms(0);
  let storage = StorageManager::start(config).expect("start");

  let person_tid = common::register_person(&storage);
  let mut storer = storage.create_storer();
  let oid = storer.put(person_tid, common::encode_person("carol", 52));
  storer.commit().expect("commit");

  std::thread::sleep(std::time::Duration::from_millis(5));
  storage.issue_full_cache_check().expect("cache check");
  let stats = storage.statistics().expect("stats");
  assert_eq!(stats.cached_bytes, 0, "all payloads evicted");

  // Loading reads the exact bytes back from disk.
  let loaded = storage.load(&[oid]).expect("load");
  assert_eq!(loaded.len(), 1);
  assert_eq!(common::decode_person(&loaded[0].payload), ("carol".to_string(), 52));
  assert!(storage.shutdown());
}

#[test]
fn storage_directory_is_exclusive() {
  let dir = tempdir().expect("tempdir");
  let storage = common::start(dir.path(), 2);

  let second = StorageManager::start(common::test_config(dir.path(), 2));
  assert!(matches!(second, Err(LoamError::Initialization(_))));

  assert!(storage.shutdown());
  // After shutdown the lock is released and a restart works.
  let third = common::start(dir.path(), 2);
  assert!(third.shutdown());
}

#[test]
fn operations_rejected_after_shutdown() {
  let dir = tempdir().expect("tempdir");
  let storage = common::start(dir.path(), 2);
  assert!(storage.shutdown());
  assert!(!storage.shutdown(), "second shutdown reports false");
  assert!(matches!(storage.root(), Err(LoamError::NotRunning)));
  assert!(matches!(storage.issue_gc(1_000), Err(LoamError::NotRunning)));
}

#[test]
fn store_order_is_serialized_within_channel() {
  let dir = tempdir().expect("tempdir");
  let storage = common::start(dir.path(), 1);
  let person_tid = common::register_person(&storage);

  // Two commits; the second supersedes an entity of the first.
  let mut storer = storage.create_storer();
  let oid = storer.put(person_tid, common::encode_person("old", 1));
  storer.commit().expect("commit");
  let mut storer = storage.create_storer();
  storer.put_with_oid(oid, person_tid, common::encode_person("new", 2));
  storer.commit().expect("commit");

  let loaded = storage.load(&[oid]).expect("load");
  assert_eq!(common::decode_person(&loaded[0].payload), ("new".to_string(), 2));
  assert!(storage.shutdown());
}
