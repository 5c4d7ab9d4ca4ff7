//! Type dictionary: type id <-> definition mapping with lineage.
//!
//! Registration takes the write lock; lookups take the read lock. Built-in
//! primitive types are pre-registered at fixed ids, user types start at 1000.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::blob::{BlobConnector, BlobPath};
use crate::constants::TID_FIRST_USER;
use crate::error::{LoamError, Result};
use crate::types::{Oid, Tid};

pub mod definition;
pub mod handler;
pub mod persistence;

pub use definition::{built_in_definitions, TypeDefinition, TypeLineage, TypeMember};
pub use handler::{
  decode_reference_list, default_handler, encode_reference_list, FixedLayoutHandler,
  ReferenceListHandler, TypeHandler,
};

struct DictionaryState {
  next_tid: Tid,
  by_tid: HashMap<Tid, Arc<TypeDefinition>>,
  /// Name -> canonical (latest) tid.
  by_name: HashMap<String, Tid>,
  lineages: HashMap<String, TypeLineage>,
  handlers: HashMap<Tid, Arc<dyn TypeHandler>>,
}

pub struct TypeDictionary {
  state: RwLock<DictionaryState>,
  /// When bound, every successful registration is written through before it
  /// is acknowledged, so a crash can never leave stored records with
  /// unknown type ids.
  persistence: Mutex<Option<(Arc<dyn BlobConnector>, BlobPath)>>,
}

impl Default for TypeDictionary {
  fn default() -> Self {
    Self::new()
  }
}

impl TypeDictionary {
  /// A dictionary with the built-in primitives pre-registered.
  pub fn new() -> Self {
    let mut state = DictionaryState {
      next_tid: TID_FIRST_USER,
      by_tid: HashMap::new(),
      by_name: HashMap::new(),
      lineages: HashMap::new(),
      handlers: HashMap::new(),
    };
    for definition in built_in_definitions() {
      install(&mut state, definition);
    }
    Self {
      state: RwLock::new(state),
      persistence: Mutex::new(None),
    }
  }

  /// Write registrations through to `path` from now on.
  pub fn bind_persistence(&self, connector: Arc<dyn BlobConnector>, path: BlobPath) {
    *self.persistence.lock() = Some((connector, path));
  }

  fn persist(&self) -> Result<()> {
    let binding = self.persistence.lock();
    if let Some((connector, path)) = binding.as_ref() {
      self.save(connector.as_ref(), path)?;
    }
    Ok(())
  }

  // ==========================================================================
  // Registration
  // ==========================================================================

  /// Register a type. The first call for a name assigns the next free tid;
  /// re-registering an identical definition returns the same tid; a
  /// structurally different definition appends a new lineage version.
  pub fn register_type(&self, definition: TypeDefinition) -> Result<Tid> {
    self.register_type_with_handler(definition, None)
  }

  /// Like [`register_type`](Self::register_type), with a caller-supplied
  /// handler replacing the synthesized one.
  pub fn register_type_with_handler(
    &self,
    mut definition: TypeDefinition,
    custom_handler: Option<Arc<dyn TypeHandler>>,
  ) -> Result<Tid> {
    let tid = {
      let mut state = self.state.write();

      if let Some(&latest_tid) = state.by_name.get(&definition.name) {
        let latest = state.by_tid.get(&latest_tid).expect("latest exists").clone();
        if latest.structurally_equal(&definition) {
          if let Some(handler) = custom_handler {
            state.handlers.insert(latest_tid, handler);
          }
          return Ok(latest_tid);
        }
        if latest.is_primitive != definition.is_primitive {
          return Err(LoamError::InvalidConfiguration(format!(
            "type '{}' cannot change primitiveness across versions",
            definition.name
          )));
        }
        if definition.version != 0 && definition.version <= latest.version {
          return Err(LoamError::InvalidConfiguration(format!(
            "type '{}' version {} must exceed current version {}",
            definition.name, definition.version, latest.version
          )));
        }
        if definition.version == 0 {
          definition.version = latest.version + 1;
        }
      } else if definition.version == 0 {
        definition.version = 1;
      }

      definition.tid = state.next_tid;
      state.next_tid += 1;
      let tid = definition.tid;
      let name = definition.name.clone();

      let handler = custom_handler.unwrap_or_else(|| default_handler(&definition));
      state.handlers.insert(tid, handler);
      state.by_tid.insert(tid, Arc::new(definition));
      state.by_name.insert(name.clone(), tid);
      state
        .lineages
        .entry(name.clone())
        .and_modify(|lineage| lineage.version_ids.push(tid))
        .or_insert_with(|| TypeLineage::new(name, tid));
      tid
    };

    // Durability before acknowledgement: stores of this tid only happen
    // after the definition is safely on disk.
    self.persist()?;
    Ok(tid)
  }

  // ==========================================================================
  // Lookup
  // ==========================================================================

  /// Canonical (latest) tid for a type name.
  pub fn type_id(&self, name: &str) -> Option<Tid> {
    self.state.read().by_name.get(name).copied()
  }

  pub fn definition(&self, tid: Tid) -> Option<Arc<TypeDefinition>> {
    self.state.read().by_tid.get(&tid).cloned()
  }

  /// Stable type name for a tid.
  pub fn type_of(&self, tid: Tid) -> Option<String> {
    self.state.read().by_tid.get(&tid).map(|d| d.name.clone())
  }

  /// Latest definition for a type name.
  pub fn latest_definition(&self, name: &str) -> Option<Arc<TypeDefinition>> {
    let state = self.state.read();
    let tid = state.by_name.get(name)?;
    state.by_tid.get(tid).cloned()
  }

  pub fn lineage(&self, name: &str) -> Option<TypeLineage> {
    self.state.read().lineages.get(name).cloned()
  }

  pub fn handler(&self, tid: Tid) -> Option<Arc<dyn TypeHandler>> {
    self.state.read().handlers.get(&tid).cloned()
  }

  pub fn highest_tid(&self) -> Tid {
    let state = self.state.read();
    state.by_tid.keys().copied().max().unwrap_or(0)
  }

  /// Every `(length, tid, oid)` observed on disk must pass this before the
  /// storage accepts the record.
  pub fn validate_entity(&self, length: u64, tid: Tid, oid: Oid) -> Result<()> {
    let definition = self
      .definition(tid)
      .ok_or(LoamError::TypeHandlerConsistency(tid))?;
    if length < definition.min_length || length > definition.max_length {
      return Err(LoamError::InvalidEntityLength {
        oid,
        tid,
        length,
        min: definition.min_length,
        max: definition.max_length,
      });
    }
    Ok(())
  }

  pub(crate) fn snapshot_definitions(&self) -> Vec<Arc<TypeDefinition>> {
    let state = self.state.read();
    let mut definitions: Vec<_> = state.by_tid.values().cloned().collect();
    definitions.sort_by_key(|d| d.tid);
    definitions
  }

  pub(crate) fn snapshot_lineages(&self) -> Vec<TypeLineage> {
    let state = self.state.read();
    let mut lineages: Vec<_> = state.lineages.values().cloned().collect();
    lineages.sort_by(|a, b| a.type_name.cmp(&b.type_name));
    lineages
  }

  pub(crate) fn next_tid(&self) -> Tid {
    self.state.read().next_tid
  }

  /// Replay a persisted definition during load. Keeps the stored tid and
  /// refuses collisions.
  pub(crate) fn restore_definition(&self, definition: TypeDefinition) -> Result<()> {
    let mut state = self.state.write();
    if let Some(existing) = state.by_tid.get(&definition.tid) {
      if !existing.structurally_equal(&definition) {
        return Err(LoamError::Initialization(format!(
          "type dictionary conflict: tid {} maps to both '{}' and '{}'",
          definition.tid, existing.name, definition.name
        )));
      }
      return Ok(());
    }
    install(&mut state, definition);
    Ok(())
  }

  pub(crate) fn restore_lineage(&self, lineage: TypeLineage) -> Result<()> {
    let mut state = self.state.write();
    for tid in &lineage.version_ids {
      if !state.by_tid.contains_key(tid) {
        return Err(LoamError::Initialization(format!(
          "lineage for '{}' references unknown tid {}",
          lineage.type_name, tid
        )));
      }
    }
    if let Some(&latest) = lineage.version_ids.last() {
      state.by_name.insert(lineage.type_name.clone(), latest);
    }
    state.lineages.insert(lineage.type_name.clone(), lineage);
    Ok(())
  }
}

/// Insert a fully-formed definition (fixed tid) into the state.
fn install(state: &mut DictionaryState, definition: TypeDefinition) {
  let tid = definition.tid;
  let name = definition.name.clone();
  state.handlers.insert(tid, default_handler(&definition));
  state.by_tid.insert(tid, Arc::new(definition));
  // Only move the canonical name pointer forward.
  let advance = state
    .by_name
    .get(&name)
    .map(|&current| tid > current)
    .unwrap_or(true);
  if advance {
    state.by_name.insert(name.clone(), tid);
  }
  state
    .lineages
    .entry(name.clone())
    .and_modify(|lineage| {
      if !lineage.version_ids.contains(&tid) {
        lineage.version_ids.push(tid);
      }
    })
    .or_insert_with(|| TypeLineage::new(name, tid));
  if tid >= state.next_tid {
    state.next_tid = tid + 1;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::constants::{TID_ROOT_REGISTRY, TID_STRING};

  fn person_v1() -> TypeDefinition {
    TypeDefinition::new(
      "Person",
      false,
      vec![
        TypeMember::variable("name", "string", 0),
        TypeMember::fixed("age", "int32", 0, 4),
      ],
    )
  }

  #[test]
  fn test_built_ins_resolve() {
    let dictionary = TypeDictionary::new();
    assert_eq!(dictionary.type_id("string"), Some(TID_STRING));
    assert!(dictionary.handler(TID_ROOT_REGISTRY).is_some());
    assert!(dictionary.definition(TID_STRING).expect("string").is_primitive);
  }

  #[test]
  fn test_first_user_type_gets_1000() {
    let dictionary = TypeDictionary::new();
    let tid = dictionary.register_type(person_v1()).expect("register");
    assert_eq!(tid, TID_FIRST_USER);
  }

  #[test]
  fn test_reregistration_is_idempotent() {
    let dictionary = TypeDictionary::new();
    let first = dictionary.register_type(person_v1()).expect("register");
    let second = dictionary.register_type(person_v1()).expect("register again");
    assert_eq!(first, second);
    let lineage = dictionary.lineage("Person").expect("lineage");
    assert_eq!(lineage.version_ids.len(), 1);
  }

  #[test]
  fn test_structural_change_appends_version() {
    let dictionary = TypeDictionary::new();
    let v1 = dictionary.register_type(person_v1()).expect("v1");

    let v2_definition = TypeDefinition::new(
      "Person",
      false,
      vec![
        TypeMember::variable("name", "string", 0),
        TypeMember::fixed("age", "int32", 0, 4),
        TypeMember::variable("email", "string", 4),
      ],
    );
    let v2 = dictionary.register_type(v2_definition).expect("v2");

    assert_ne!(v1, v2);
    assert_eq!(dictionary.type_id("Person"), Some(v2));
    let lineage = dictionary.lineage("Person").expect("lineage");
    assert_eq!(lineage.version_ids, vec![v1, v2]);
    assert_eq!(dictionary.definition(v2).expect("v2 def").version, 2);
    // The old version stays addressable for parsing old records.
    assert!(dictionary.definition(v1).is_some());
  }

  #[test]
  fn test_primitive_flip_is_rejected() {
    let dictionary = TypeDictionary::new();
    dictionary.register_type(person_v1()).expect("v1");
    let flipped = TypeDefinition::new("Person", true, Vec::new());
    assert!(dictionary.register_type(flipped).is_err());
  }

  #[test]
  fn test_validate_entity_bounds() {
    let dictionary = TypeDictionary::new();
    let tid = dictionary
      .register_type(TypeDefinition::new(
        "Point",
        false,
        vec![
          TypeMember::fixed("x", "int64", 0, 8),
          TypeMember::fixed("y", "int64", 8, 8),
        ],
      ))
      .expect("register");

    dictionary.validate_entity(48, tid, 10).expect("in bounds");
    assert!(matches!(
      dictionary.validate_entity(40, tid, 10),
      Err(LoamError::InvalidEntityLength { .. })
    ));
    assert!(matches!(
      dictionary.validate_entity(48, 999, 10),
      Err(LoamError::TypeHandlerConsistency(999))
    ));
  }
}
