//! Type definitions and members.
//!
//! A definition is immutable once registered. Evolution happens by appending
//! a new version to the type's lineage, never by mutating an existing
//! definition.

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::types::{now_ms, Tid};

/// Upper bound used for variable-length types.
pub const LENGTH_UNBOUNDED: u64 = i64::MAX as u64;

/// One persisted member of a type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeMember {
  pub name: String,
  pub declared_type: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub referenced_type_id: Option<Tid>,
  pub is_reference: bool,
  pub is_variable_length: bool,
  /// Byte offset within the payload. Meaningful for fixed-layout members.
  pub offset: u64,
  /// Byte length; 0 for variable-length members.
  pub length: u64,
}

impl TypeMember {
  pub fn fixed<S: Into<String>, T: Into<String>>(
    name: S,
    declared_type: T,
    offset: u64,
    length: u64,
  ) -> Self {
    Self {
      name: name.into(),
      declared_type: declared_type.into(),
      referenced_type_id: None,
      is_reference: false,
      is_variable_length: false,
      offset,
      length,
    }
  }

  /// A fixed 8-byte object-id reference.
  pub fn reference<S: Into<String>>(name: S, referenced_tid: Option<Tid>, offset: u64) -> Self {
    Self {
      name: name.into(),
      declared_type: "reference".to_string(),
      referenced_type_id: referenced_tid,
      is_reference: true,
      is_variable_length: false,
      offset,
      length: 8,
    }
  }

  pub fn variable<S: Into<String>, T: Into<String>>(name: S, declared_type: T, offset: u64) -> Self {
    Self {
      name: name.into(),
      declared_type: declared_type.into(),
      referenced_type_id: None,
      is_reference: false,
      is_variable_length: true,
      offset,
      length: 0,
    }
  }

  /// A variable-length list of object-id references.
  pub fn reference_list<S: Into<String>>(name: S, offset: u64) -> Self {
    Self {
      name: name.into(),
      declared_type: "reference[]".to_string(),
      referenced_type_id: None,
      is_reference: true,
      is_variable_length: true,
      offset,
      length: 0,
    }
  }

  /// Structural identity: everything except the referenced type id, which may
  /// be filled in lazily by the serializer layer.
  fn structurally_equal(&self, other: &TypeMember) -> bool {
    self.name == other.name
      && self.declared_type == other.declared_type
      && self.is_reference == other.is_reference
      && self.is_variable_length == other.is_variable_length
      && self.offset == other.offset
      && self.length == other.length
  }
}

/// Immutable descriptor of a persisted type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeDefinition {
  #[serde(rename = "type_id")]
  pub tid: Tid,
  #[serde(rename = "type_name")]
  pub name: String,
  pub assembly_qualified_name: String,
  pub version: u64,
  pub is_primitive: bool,
  pub has_persisted_references: bool,
  pub has_persisted_variable_length: bool,
  /// Minimum total record length, header included.
  pub min_length: u64,
  /// Maximum total record length, header included.
  pub max_length: u64,
  pub created_at: u64,
  pub modified_at: u64,
  pub members: Vec<TypeMember>,
}

impl TypeDefinition {
  /// Build a definition from its members. Flags and length bounds are
  /// derived; tid and version are assigned at registration.
  pub fn new<S: Into<String>>(name: S, is_primitive: bool, members: Vec<TypeMember>) -> Self {
    let name = name.into();
    let has_references = members.iter().any(|m| m.is_reference);
    let has_variable = members.iter().any(|m| m.is_variable_length);
    let fixed_payload: u64 = members
      .iter()
      .filter(|m| !m.is_variable_length)
      .map(|m| m.length)
      .sum();
    let min_length = RECORD_HEADER_SIZE + fixed_payload;
    let max_length = if has_variable {
      LENGTH_UNBOUNDED
    } else {
      min_length
    };
    let now = now_ms();
    Self {
      tid: 0,
      assembly_qualified_name: name.clone(),
      name,
      version: 0,
      is_primitive,
      has_persisted_references: has_references,
      has_persisted_variable_length: has_variable,
      min_length,
      max_length,
      created_at: now,
      modified_at: now,
      members,
    }
  }

  pub fn qualified_name<S: Into<String>>(mut self, value: S) -> Self {
    self.assembly_qualified_name = value.into();
    self
  }

  /// Offsets of all fixed-layout reference members, in member order.
  pub fn reference_offsets(&self) -> Vec<u64> {
    self
      .members
      .iter()
      .filter(|m| m.is_reference && !m.is_variable_length)
      .map(|m| m.offset)
      .collect()
  }

  /// True when the member layout and flags are identical. Used to make
  /// re-registration idempotent.
  pub fn structurally_equal(&self, other: &TypeDefinition) -> bool {
    self.name == other.name
      && self.is_primitive == other.is_primitive
      && self.members.len() == other.members.len()
      && self
        .members
        .iter()
        .zip(other.members.iter())
        .all(|(a, b)| a.structurally_equal(b))
  }
}

// ============================================================================
// Built-in types
// ============================================================================

fn built_in(tid: Tid, name: &str, payload_length: u64) -> TypeDefinition {
  let mut definition = TypeDefinition::new(
    name,
    true,
    vec![TypeMember::fixed("value", name, 0, payload_length)],
  );
  definition.tid = tid;
  definition.version = 1;
  definition
}

fn built_in_variable(tid: Tid, name: &str) -> TypeDefinition {
  let mut definition = TypeDefinition::new(name, true, vec![TypeMember::variable("value", name, 0)]);
  definition.tid = tid;
  definition.version = 1;
  definition
}

/// The fixed set of pre-registered primitive definitions.
pub fn built_in_definitions() -> Vec<TypeDefinition> {
  let mut object = TypeDefinition::new("object", true, Vec::new());
  object.tid = TID_OBJECT;
  object.version = 1;
  object.max_length = LENGTH_UNBOUNDED;

  let mut root_registry = TypeDefinition::new(
    "root registry",
    true,
    vec![TypeMember::reference_list("roots", 0)],
  );
  root_registry.tid = TID_ROOT_REGISTRY;
  root_registry.version = 1;

  vec![
    object,
    built_in(TID_BOOLEAN, "boolean", 1),
    built_in(TID_BYTE, "byte", 1),
    built_in(TID_INT16, "int16", 2),
    built_in(TID_INT32, "int32", 4),
    built_in(TID_INT64, "int64", 8),
    built_in(TID_FLOAT32, "float32", 4),
    built_in(TID_FLOAT64, "float64", 8),
    built_in(TID_DECIMAL, "decimal", 16),
    built_in(TID_CHAR, "char", 2),
    built_in_variable(TID_STRING, "string"),
    built_in(TID_DATE_TIME, "date-time", 8),
    built_in(TID_GUID, "guid", 16),
    built_in_variable(TID_BYTE_ARRAY, "byte[]"),
    built_in_variable(TID_INT32_ARRAY, "int32[]"),
    built_in_variable(TID_INT64_ARRAY, "int64[]"),
    built_in_variable(TID_FLOAT32_ARRAY, "float32[]"),
    built_in_variable(TID_FLOAT64_ARRAY, "float64[]"),
    root_registry,
  ]
}

/// Lineage: the ordered version history of one type name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeLineage {
  pub type_name: String,
  pub current_type_name: String,
  /// Type ids, oldest first. The last entry is canonical.
  pub version_ids: Vec<Tid>,
}

impl TypeLineage {
  pub fn new<S: Into<String>>(name: S, first_tid: Tid) -> Self {
    let name = name.into();
    Self {
      type_name: name.clone(),
      current_type_name: name,
      version_ids: vec![first_tid],
    }
  }

  pub fn latest(&self) -> Tid {
    *self.version_ids.last().expect("lineage is never empty")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fixed_type_bounds() {
    let definition = TypeDefinition::new(
      "pair",
      false,
      vec![
        TypeMember::fixed("a", "int64", 0, 8),
        TypeMember::fixed("b", "int64", 8, 8),
      ],
    );
    assert_eq!(definition.min_length, RECORD_HEADER_SIZE + 16);
    assert_eq!(definition.max_length, definition.min_length);
    assert!(!definition.has_persisted_variable_length);
    assert!(!definition.has_persisted_references);
  }

  #[test]
  fn test_variable_type_is_unbounded() {
    let definition = TypeDefinition::new(
      "named",
      false,
      vec![
        TypeMember::reference("next", None, 0),
        TypeMember::variable("name", "string", 8),
      ],
    );
    assert_eq!(definition.min_length, RECORD_HEADER_SIZE + 8);
    assert_eq!(definition.max_length, LENGTH_UNBOUNDED);
    assert!(definition.has_persisted_references);
    assert!(definition.has_persisted_variable_length);
    assert_eq!(definition.reference_offsets(), vec![0]);
  }

  #[test]
  fn test_structural_equality_ignores_version() {
    let a = TypeDefinition::new("t", false, vec![TypeMember::fixed("x", "int32", 0, 4)]);
    let mut b = TypeDefinition::new("t", false, vec![TypeMember::fixed("x", "int32", 0, 4)]);
    b.version = 9;
    b.tid = 1234;
    assert!(a.structurally_equal(&b));
  }

  #[test]
  fn test_built_ins_have_reserved_ids() {
    let builtins = built_in_definitions();
    assert!(builtins.iter().all(|d| d.tid < TID_FIRST_USER && d.tid > 0));
    assert!(builtins.iter().any(|d| d.tid == TID_ROOT_REGISTRY));
    let string = builtins.iter().find(|d| d.tid == TID_STRING).expect("string");
    assert_eq!(string.max_length, LENGTH_UNBOUNDED);
  }
}
