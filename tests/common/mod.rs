//! Shared fixtures: a minimal serializer layer over the engine's byte-record
//! interface, the way an embedding application would provide one.

#![allow(dead_code)]

use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use loamdb::dict::{TypeDefinition, TypeMember};
use loamdb::{StorageConfig, StorageManager, Tid};

/// Storage config tuned for tests: small files, housekeeping effectively
/// disabled so background work never races the assertions.
pub fn test_config(dir: &Path, channels: usize) -> StorageConfig {
  StorageConfig::new(dir)
    .channel_count(channels)
    .data_file_minimum_size(64)
    .data_file_maximum_size(64 * 1024)
    .housekeeping_interval_ms(3_600_000)
    .distribution_strategy(loamdb::DistributionStrategy::HashByObjectId)
}

pub fn start(dir: &Path, channels: usize) -> StorageManager {
  StorageManager::start(test_config(dir, channels)).expect("storage starts")
}

// ============================================================================
// Person: a fixed int32 plus a trailing string
// ============================================================================

pub fn person_definition() -> TypeDefinition {
  TypeDefinition::new(
    "Person",
    false,
    vec![
      TypeMember::fixed("age", "int32", 0, 4),
      TypeMember::variable("name", "string", 4),
    ],
  )
}

pub fn person_definition_v2() -> TypeDefinition {
  TypeDefinition::new(
    "Person",
    false,
    vec![
      TypeMember::fixed("age", "int32", 0, 4),
      TypeMember::variable("name", "string", 4),
      TypeMember::variable("email", "string", 4),
    ],
  )
}

pub fn register_person(storage: &StorageManager) -> Tid {
  storage
    .type_dictionary()
    .register_type(person_definition())
    .expect("register Person")
}

pub fn encode_person(name: &str, age: i32) -> Vec<u8> {
  let mut payload = vec![0u8; 4 + name.len()];
  LittleEndian::write_i32(&mut payload[0..4], age);
  payload[4..].copy_from_slice(name.as_bytes());
  payload
}

pub fn decode_person(payload: &[u8]) -> (String, i32) {
  let age = LittleEndian::read_i32(&payload[0..4]);
  let name = String::from_utf8(payload[4..].to_vec()).expect("utf8 name");
  (name, age)
}

/// Person v2 appends a length-prefixed email after the name.
pub fn encode_person_v2(name: &str, age: i32, email: &str) -> Vec<u8> {
  let mut payload = vec![0u8; 4 + 4 + name.len() + email.len()];
  LittleEndian::write_i32(&mut payload[0..4], age);
  LittleEndian::write_u32(&mut payload[4..8], name.len() as u32);
  payload[8..8 + name.len()].copy_from_slice(name.as_bytes());
  payload[8 + name.len()..].copy_from_slice(email.as_bytes());
  payload
}

pub fn decode_person_v2(payload: &[u8]) -> (String, i32, String) {
  let age = LittleEndian::read_i32(&payload[0..4]);
  let name_len = LittleEndian::read_u32(&payload[4..8]) as usize;
  let name = String::from_utf8(payload[8..8 + name_len].to_vec()).expect("utf8 name");
  let email = String::from_utf8(payload[8 + name_len..].to_vec()).expect("utf8 email");
  (name, age, email)
}

// ============================================================================
// Folder: a variable-length list of references
// ============================================================================

pub fn folder_definition() -> TypeDefinition {
  TypeDefinition::new(
    "Folder",
    false,
    vec![TypeMember::reference_list("entries", 0)],
  )
}

pub fn register_folder(storage: &StorageManager) -> Tid {
  storage
    .type_dictionary()
    .register_type(folder_definition())
    .expect("register Folder")
}
