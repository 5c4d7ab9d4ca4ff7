//! Entity records and the arena that owns them.
//!
//! Every cached entity lives in a slot of a per-channel arena and is threaded
//! onto three chains through index handles: the chain of records in its data
//! file, the chain of records of its type, and its hash bucket. Index-based
//! links give O(1) insert and removal without shared ownership.

use crate::types::{GcColor, Oid, StoragePosition, Tid, Timestamp};

/// Sentinel for "no slot".
pub const NIL: u32 = u32::MAX;

/// Doubly-linked chain membership.
#[derive(Debug, Clone, Copy)]
pub struct ChainLink {
  pub prev: u32,
  pub next: u32,
}

impl Default for ChainLink {
  fn default() -> Self {
    Self {
      prev: NIL,
      next: NIL,
    }
  }
}

/// Head and tail of one chain.
#[derive(Debug, Clone, Copy)]
pub struct ChainEnds {
  pub head: u32,
  pub tail: u32,
}

impl Default for ChainEnds {
  fn default() -> Self {
    Self {
      head: NIL,
      tail: NIL,
    }
  }
}

impl ChainEnds {
  pub fn is_empty(&self) -> bool {
    self.head == NIL
  }
}

/// Which of the three chains a link operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainKind {
  File,
  Type,
  Bucket,
}

/// One cached entity record.
#[derive(Debug)]
pub struct EntitySlot {
  pub oid: Oid,
  pub tid: Tid,
  /// Total record length on disk, header included.
  pub length: u64,
  pub position: StoragePosition,
  pub last_touched_ms: Timestamp,
  /// Cached payload bytes (header excluded); evictable.
  pub payload: Option<Vec<u8>>,
  pub color: GcColor,
  pub file_link: ChainLink,
  pub type_link: ChainLink,
  pub bucket_link: ChainLink,
  /// Slot occupancy; false when the slot sits on the free list.
  pub occupied: bool,
}

impl EntitySlot {
  fn new(oid: Oid, tid: Tid, now: Timestamp) -> Self {
    Self {
      oid,
      tid,
      length: 0,
      position: StoragePosition::default(),
      last_touched_ms: now,
      payload: None,
      // Newly stored entities count as reachable in the running cycle.
      color: GcColor::Black,
      file_link: ChainLink::default(),
      type_link: ChainLink::default(),
      bucket_link: ChainLink::default(),
      occupied: true,
    }
  }

  pub fn cached_payload_length(&self) -> u64 {
    self.payload.as_ref().map(|p| p.len() as u64).unwrap_or(0)
  }

  fn link_mut(&mut self, kind: ChainKind) -> &mut ChainLink {
    match kind {
      ChainKind::File => &mut self.file_link,
      ChainKind::Type => &mut self.type_link,
      ChainKind::Bucket => &mut self.bucket_link,
    }
  }

  fn link(&self, kind: ChainKind) -> ChainLink {
    match kind {
      ChainKind::File => self.file_link,
      ChainKind::Type => self.type_link,
      ChainKind::Bucket => self.bucket_link,
    }
  }
}

// ============================================================================
// Arena
// ============================================================================

/// Slot storage with a free list. OIDs are never reused but slots are.
#[derive(Default)]
pub struct EntityArena {
  slots: Vec<EntitySlot>,
  free: Vec<u32>,
}

impl EntityArena {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn alloc(&mut self, oid: Oid, tid: Tid, now: Timestamp) -> u32 {
    match self.free.pop() {
      Some(index) => {
        self.slots[index as usize] = EntitySlot::new(oid, tid, now);
        index
      }
      None => {
        let index = self.slots.len() as u32;
        self.slots.push(EntitySlot::new(oid, tid, now));
        index
      }
    }
  }

  /// Release a slot back to the free list. The caller must have unlinked it
  /// from every chain first.
  pub fn release(&mut self, index: u32) {
    let slot = &mut self.slots[index as usize];
    debug_assert!(slot.occupied);
    slot.occupied = false;
    slot.payload = None;
    self.free.push(index);
  }

  pub fn get(&self, index: u32) -> &EntitySlot {
    &self.slots[index as usize]
  }

  pub fn get_mut(&mut self, index: u32) -> &mut EntitySlot {
    &mut self.slots[index as usize]
  }

  /// Total slot count, occupied or not. Slot indices range over 0..capacity.
  pub fn capacity(&self) -> u32 {
    self.slots.len() as u32
  }

  pub fn is_occupied(&self, index: u32) -> bool {
    self
      .slots
      .get(index as usize)
      .map(|s| s.occupied)
      .unwrap_or(false)
  }

  // ==========================================================================
  // Chain surgery
  // ==========================================================================

  /// Append `index` at the tail of the chain.
  pub fn link_tail(&mut self, ends: &mut ChainEnds, kind: ChainKind, index: u32) {
    let old_tail = ends.tail;
    {
      let link = self.get_mut(index).link_mut(kind);
      link.prev = old_tail;
      link.next = NIL;
    }
    if old_tail == NIL {
      ends.head = index;
    } else {
      self.get_mut(old_tail).link_mut(kind).next = index;
    }
    ends.tail = index;
  }

  /// Remove `index` from the chain in O(1).
  pub fn unlink(&mut self, ends: &mut ChainEnds, kind: ChainKind, index: u32) {
    let link = self.get(index).link(kind);
    if link.prev == NIL {
      ends.head = link.next;
    } else {
      self.get_mut(link.prev).link_mut(kind).next = link.next;
    }
    if link.next == NIL {
      ends.tail = link.prev;
    } else {
      self.get_mut(link.next).link_mut(kind).prev = link.prev;
    }
    *self.get_mut(index).link_mut(kind) = ChainLink::default();
  }

  /// Walk a chain front to back, collecting slot indices.
  pub fn chain_indices(&self, ends: &ChainEnds, kind: ChainKind) -> Vec<u32> {
    let mut indices = Vec::new();
    let mut cursor = ends.head;
    while cursor != NIL {
      indices.push(cursor);
      cursor = self.get(cursor).link(kind).next;
    }
    indices
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_link_and_unlink_middle() {
    let mut arena = EntityArena::new();
    let mut chain = ChainEnds::default();
    let a = arena.alloc(1, 100, 0);
    let b = arena.alloc(2, 100, 0);
    let c = arena.alloc(3, 100, 0);
    arena.link_tail(&mut chain, ChainKind::Type, a);
    arena.link_tail(&mut chain, ChainKind::Type, b);
    arena.link_tail(&mut chain, ChainKind::Type, c);

    assert_eq!(arena.chain_indices(&chain, ChainKind::Type), vec![a, b, c]);

    arena.unlink(&mut chain, ChainKind::Type, b);
    assert_eq!(arena.chain_indices(&chain, ChainKind::Type), vec![a, c]);

    arena.unlink(&mut chain, ChainKind::Type, a);
    arena.unlink(&mut chain, ChainKind::Type, c);
    assert!(chain.is_empty());
  }

  #[test]
  fn test_chains_are_independent() {
    let mut arena = EntityArena::new();
    let mut type_chain = ChainEnds::default();
    let mut file_chain = ChainEnds::default();
    let a = arena.alloc(1, 100, 0);
    let b = arena.alloc(2, 100, 0);

    arena.link_tail(&mut type_chain, ChainKind::Type, a);
    arena.link_tail(&mut type_chain, ChainKind::Type, b);
    arena.link_tail(&mut file_chain, ChainKind::File, b);
    arena.link_tail(&mut file_chain, ChainKind::File, a);

    arena.unlink(&mut file_chain, ChainKind::File, b);
    assert_eq!(arena.chain_indices(&type_chain, ChainKind::Type), vec![a, b]);
    assert_eq!(arena.chain_indices(&file_chain, ChainKind::File), vec![a]);
  }

  #[test]
  fn test_slot_reuse() {
    let mut arena = EntityArena::new();
    let a = arena.alloc(1, 100, 0);
    arena.release(a);
    let b = arena.alloc(2, 100, 0);
    assert_eq!(a, b);
    assert_eq!(arena.get(b).oid, 2);
    assert_eq!(arena.capacity(), 1);
  }
}
