//! Type dictionary persistence.
//!
//! The dictionary is stored as a single JSON document under
//! `types/type_dictionary.json`. Loading replays every definition and
//! lineage; `next_type_id` is recomputed as `max(all tids) + 1` so a stale
//! counter in the file can never cause a collision.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::blob::{BlobConnector, BlobPath};
use crate::error::{LoamError, Result};
use crate::types::Tid;

use super::definition::{TypeDefinition, TypeLineage};
use super::TypeDictionary;

#[derive(Debug, Serialize, Deserialize)]
struct DictionaryDocument {
  next_type_id: Tid,
  type_definitions: Vec<TypeDefinition>,
  type_lineages: Vec<TypeLineage>,
}

impl TypeDictionary {
  /// Persist the dictionary as JSON at `path`, replacing any previous file.
  pub fn save(&self, connector: &dyn BlobConnector, path: &BlobPath) -> Result<()> {
    let document = DictionaryDocument {
      next_type_id: self.next_tid(),
      type_definitions: self
        .snapshot_definitions()
        .iter()
        .map(|d| TypeDefinition::clone(d))
        .collect(),
      type_lineages: self.snapshot_lineages(),
    };
    let json = serde_json::to_vec_pretty(&document)?;

    if let Some(parent) = path.parent() {
      connector.create_directory(&parent)?;
    }
    if connector.file_exists(path)? {
      connector.truncate(path, 0)?;
    } else {
      connector.create_file(path)?;
    }
    connector.append(path, &json)?;
    Ok(())
  }

  /// Load a persisted dictionary. Built-ins are always present; the file's
  /// definitions and lineages are replayed on top of them.
  pub fn load(connector: &dyn BlobConnector, path: &BlobPath) -> Result<Arc<TypeDictionary>> {
    let dictionary = Arc::new(TypeDictionary::new());
    if !connector.file_exists(path)? {
      return Ok(dictionary);
    }

    let bytes = connector.read_all(path)?;
    let document: DictionaryDocument = serde_json::from_slice(&bytes)
      .map_err(|e| LoamError::Initialization(format!("type dictionary corrupt: {e}")))?;

    let mut definitions = document.type_definitions;
    definitions.sort_by_key(|d| d.tid);
    for definition in definitions {
      if definition.tid == 0 {
        return Err(LoamError::Initialization(
          "type dictionary contains a definition with tid 0".to_string(),
        ));
      }
      dictionary.restore_definition(definition)?;
    }
    for lineage in document.type_lineages {
      dictionary.restore_lineage(lineage)?;
    }
    Ok(dictionary)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::blob::LocalFileConnector;
  use crate::constants::TID_FIRST_USER;
  use crate::dict::definition::TypeMember;
  use tempfile::tempdir;

  fn dictionary_path() -> BlobPath {
    BlobPath::parse("types/type_dictionary.json")
  }

  fn sample_dictionary() -> TypeDictionary {
    let dictionary = TypeDictionary::new();
    dictionary
      .register_type(TypeDefinition::new(
        "Person",
        false,
        vec![
          TypeMember::variable("name", "string", 0),
          TypeMember::fixed("age", "int32", 0, 4),
        ],
      ))
      .expect("register Person");
    dictionary
      .register_type(TypeDefinition::new(
        "Person",
        false,
        vec![
          TypeMember::variable("name", "string", 0),
          TypeMember::fixed("age", "int32", 0, 4),
          TypeMember::variable("email", "string", 4),
        ],
      ))
      .expect("register Person v2");
    dictionary
  }

  #[test]
  fn test_save_load_round_trip() {
    let dir = tempdir().expect("tempdir");
    let connector = LocalFileConnector::new(dir.path());
    let path = dictionary_path();

    let original = sample_dictionary();
    original.save(&connector, &path).expect("save");

    let loaded = TypeDictionary::load(&connector, &path).expect("load");
    assert_eq!(loaded.type_id("Person"), original.type_id("Person"));
    let lineage = loaded.lineage("Person").expect("lineage");
    assert_eq!(lineage.version_ids, vec![TID_FIRST_USER, TID_FIRST_USER + 1]);
    assert_eq!(loaded.next_tid(), TID_FIRST_USER + 2);
    // Old versions stay parseable after reload.
    assert_eq!(loaded.definition(TID_FIRST_USER).expect("v1").version, 1);
  }

  #[test]
  fn test_load_missing_file_yields_built_ins() {
    let dir = tempdir().expect("tempdir");
    let connector = LocalFileConnector::new(dir.path());
    let loaded = TypeDictionary::load(&connector, &dictionary_path()).expect("load");
    assert_eq!(loaded.next_tid(), TID_FIRST_USER);
  }

  #[test]
  fn test_corrupt_file_fails_initialization() {
    let dir = tempdir().expect("tempdir");
    let connector = LocalFileConnector::new(dir.path());
    let path = dictionary_path();
    connector
      .create_directory(&path.parent().expect("parent"))
      .expect("mkdir");
    connector.append(&path, b"{not json").expect("write");

    assert!(matches!(
      TypeDictionary::load(&connector, &path),
      Err(LoamError::Initialization(_))
    ));
  }

  #[test]
  fn test_save_overwrites_previous_content() {
    let dir = tempdir().expect("tempdir");
    let connector = LocalFileConnector::new(dir.path());
    let path = dictionary_path();

    let dictionary = sample_dictionary();
    dictionary.save(&connector, &path).expect("save");
    let first_size = connector.file_size(&path).expect("size");
    dictionary.save(&connector, &path).expect("save again");
    assert_eq!(connector.file_size(&path).expect("size"), first_size);
  }
}
