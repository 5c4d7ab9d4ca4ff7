mod common;

use tempfile::tempdir;

/// Registering a structurally different Person appends a lineage version.
/// Records stored under the old version keep parsing with the old
/// definition; new stores use the new one.
#[test]
fn evolved_type_parses_old_and_new_records() {
  let dir = tempdir().expect("tempdir");
  let storage = common::start(dir.path(), 2);

  let v1_tid = common::register_person(&storage);
  let mut storer = storage.create_storer();
  let old_oid = storer.put(v1_tid, common::encode_person("alice", 30));
  storer.commit().expect("commit v1");

  let v2_tid = storage
    .type_dictionary()
    .register_type(common::person_definition_v2())
    .expect("register v2");
  assert_ne!(v1_tid, v2_tid);

  let lineage = storage.type_dictionary().lineage("Person").expect("lineage");
  assert_eq!(lineage.version_ids, vec![v1_tid, v2_tid]);
  assert_eq!(
    storage.type_dictionary().definition(v2_tid).expect("v2").version,
    2
  );
  // The canonical name now resolves to the latest version.
  assert_eq!(storage.type_dictionary().type_id("Person"), Some(v2_tid));

  let mut storer = storage.create_storer();
  let new_oid = storer.put(v2_tid, common::encode_person_v2("bob", 40, "bob@example.com"));
  storer.commit().expect("commit v2");

  // The old record still carries the old type id and parses with the old
  // definition.
  let old = storage.load(&[old_oid]).expect("load old");
  assert_eq!(old[0].tid, v1_tid);
  assert_eq!(common::decode_person(&old[0].payload), ("alice".to_string(), 30));

  let new = storage.load(&[new_oid]).expect("load new");
  assert_eq!(new[0].tid, v2_tid);
  assert_eq!(
    common::decode_person_v2(&new[0].payload),
    ("bob".to_string(), 40, "bob@example.com".to_string())
  );
  assert!(storage.shutdown());
}

/// Re-registering an identical definition is a no-op: same id, no lineage
/// growth.
#[test]
fn identical_registration_is_idempotent() {
  let dir = tempdir().expect("tempdir");
  let storage = common::start(dir.path(), 2);

  let first = common::register_person(&storage);
  let second = common::register_person(&storage);
  assert_eq!(first, second);
  assert_eq!(
    storage
      .type_dictionary()
      .lineage("Person")
      .expect("lineage")
      .version_ids
      .len(),
    1
  );
  assert!(storage.shutdown());
}

/// The dictionary file round-trips the lineage across restarts.
#[test]
fn lineage_survives_restart() {
  let dir = tempdir().expect("tempdir");
  let (v1_tid, v2_tid) = {
    let storage = common::start(dir.path(), 2);
    let v1 = common::register_person(&storage);
    let v2 = storage
      .type_dictionary()
      .register_type(common::person_definition_v2())
      .expect("register v2");
    assert!(storage.shutdown());
    (v1, v2)
  };

  let storage = common::start(dir.path(), 2);
  let lineage = storage.type_dictionary().lineage("Person").expect("lineage");
  assert_eq!(lineage.version_ids, vec![v1_tid, v2_tid]);
  assert_eq!(storage.type_dictionary().type_id("Person"), Some(v2_tid));
  // Old versions stay addressable after reload.
  assert!(storage.type_dictionary().definition(v1_tid).is_some());

  // A further registration continues the sequence instead of reusing ids.
  let v3 = storage
    .type_dictionary()
    .register_type(loamdb::dict::TypeDefinition::new(
      "Address",
      false,
      vec![loamdb::dict::TypeMember::variable("street", "string", 0)],
    ))
    .expect("register Address");
  assert!(v3 > v2_tid);
  assert!(storage.shutdown());
}
