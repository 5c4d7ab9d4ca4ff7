//! Type handlers: reference iteration over opaque payloads.
//!
//! The engine never interprets user field data. A handler knows where the
//! outbound object-id references sit inside a payload and reports each
//! non-null one to a callback. Handlers for plain fixed layouts are
//! synthesized from the type definition; the serializer layer may register
//! custom handlers for richer layouts.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{LoamError, Result};
use crate::types::{Oid, Tid};

use super::definition::TypeDefinition;

/// Reference iteration over one entity payload (header excluded).
pub trait TypeHandler: Send + Sync {
  fn tid(&self) -> Tid;

  /// Invoke `visit` once per non-null reference OID in `payload`.
  /// OID 0 is the null reference and is skipped.
  fn iterate_references(&self, payload: &[u8], visit: &mut dyn FnMut(Oid)) -> Result<()>;
}

// ============================================================================
// Fixed-layout handler
// ============================================================================

/// Reads 8-byte references at the fixed offsets declared by the definition.
pub struct FixedLayoutHandler {
  tid: Tid,
  reference_offsets: Vec<u64>,
}

impl FixedLayoutHandler {
  pub fn from_definition(definition: &TypeDefinition) -> Self {
    Self {
      tid: definition.tid,
      reference_offsets: definition.reference_offsets(),
    }
  }
}

impl TypeHandler for FixedLayoutHandler {
  fn tid(&self) -> Tid {
    self.tid
  }

  fn iterate_references(&self, payload: &[u8], visit: &mut dyn FnMut(Oid)) -> Result<()> {
    for &offset in &self.reference_offsets {
      let start = offset as usize;
      let end = start + 8;
      if end > payload.len() {
        return Err(LoamError::Consistency(format!(
          "type {} payload of {} bytes is too short for a reference at offset {}",
          self.tid,
          payload.len(),
          offset
        )));
      }
      let oid = LittleEndian::read_u64(&payload[start..end]);
      if oid != 0 {
        visit(oid);
      }
    }
    Ok(())
  }
}

// ============================================================================
// Reference-list handler
// ============================================================================

/// Payload is a count-prefixed list of OIDs: count u64 LE, then count × u64.
/// Used by the root registry and reference-array types.
pub struct ReferenceListHandler {
  tid: Tid,
}

impl ReferenceListHandler {
  pub fn new(tid: Tid) -> Self {
    Self { tid }
  }
}

impl TypeHandler for ReferenceListHandler {
  fn tid(&self) -> Tid {
    self.tid
  }

  fn iterate_references(&self, payload: &[u8], visit: &mut dyn FnMut(Oid)) -> Result<()> {
    let oids = decode_reference_list(self.tid, payload)?;
    for oid in oids {
      if oid != 0 {
        visit(oid);
      }
    }
    Ok(())
  }
}

/// Encode a count-prefixed OID list payload.
pub fn encode_reference_list(oids: &[Oid]) -> Vec<u8> {
  let mut payload = vec![0u8; 8 + oids.len() * 8];
  LittleEndian::write_u64(&mut payload[0..8], oids.len() as u64);
  for (i, oid) in oids.iter().enumerate() {
    let start = 8 + i * 8;
    LittleEndian::write_u64(&mut payload[start..start + 8], *oid);
  }
  payload
}

/// Decode a count-prefixed OID list payload, validating its framing.
pub fn decode_reference_list(tid: Tid, payload: &[u8]) -> Result<Vec<Oid>> {
  if payload.len() < 8 {
    return Err(LoamError::Consistency(format!(
      "type {} reference list payload of {} bytes has no count",
      tid,
      payload.len()
    )));
  }
  let count = LittleEndian::read_u64(&payload[0..8]) as usize;
  let expected = 8 + count * 8;
  if payload.len() != expected {
    return Err(LoamError::Consistency(format!(
      "type {tid} reference list declares {count} entries but payload is {} bytes",
      payload.len()
    )));
  }
  let mut oids = Vec::with_capacity(count);
  for i in 0..count {
    let start = 8 + i * 8;
    oids.push(LittleEndian::read_u64(&payload[start..start + 8]));
  }
  Ok(oids)
}

/// Synthesize the default handler for a definition.
pub fn default_handler(definition: &TypeDefinition) -> Arc<dyn TypeHandler> {
  let has_reference_list = definition
    .members
    .iter()
    .any(|m| m.is_reference && m.is_variable_length);
  if has_reference_list {
    Arc::new(ReferenceListHandler::new(definition.tid))
  } else {
    Arc::new(FixedLayoutHandler::from_definition(definition))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::dict::definition::TypeMember;

  fn collect(handler: &dyn TypeHandler, payload: &[u8]) -> Vec<Oid> {
    let mut seen = Vec::new();
    handler
      .iterate_references(payload, &mut |oid| seen.push(oid))
      .expect("iterate");
    seen
  }

  #[test]
  fn test_fixed_layout_skips_null_references() {
    let mut definition = TypeDefinition::new(
      "pair",
      false,
      vec![
        TypeMember::reference("left", None, 0),
        TypeMember::reference("right", None, 8),
      ],
    );
    definition.tid = 1000;
    let handler = FixedLayoutHandler::from_definition(&definition);

    let mut payload = vec![0u8; 16];
    LittleEndian::write_u64(&mut payload[8..16], 42);
    assert_eq!(collect(&handler, &payload), vec![42]);
  }

  #[test]
  fn test_fixed_layout_rejects_short_payload() {
    let mut definition =
      TypeDefinition::new("one", false, vec![TypeMember::reference("only", None, 0)]);
    definition.tid = 1001;
    let handler = FixedLayoutHandler::from_definition(&definition);
    let mut visit = |_oid: Oid| {};
    assert!(handler.iterate_references(&[0u8; 4], &mut visit).is_err());
  }

  #[test]
  fn test_reference_list_round_trip() {
    let payload = encode_reference_list(&[7, 0, 9]);
    assert_eq!(decode_reference_list(35, &payload).expect("decode"), vec![7, 0, 9]);

    let handler = ReferenceListHandler::new(35);
    assert_eq!(collect(&handler, &payload), vec![7, 9]);
  }

  #[test]
  fn test_reference_list_rejects_bad_framing() {
    let mut payload = encode_reference_list(&[1, 2]);
    payload.pop();
    assert!(decode_reference_list(35, &payload).is_err());
  }
}
