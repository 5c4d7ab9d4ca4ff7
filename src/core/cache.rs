//! Per-channel entity cache.
//!
//! Maps object ids to entity records through an open-chaining hash index
//! over the arena, keeps one chain per type, and accounts every cached
//! payload byte. The cache is owned by its channel worker; nothing here
//! takes a lock.

use std::time::Instant;

use hashbrown::HashMap;
use xxhash_rust::xxh64::xxh64;

use crate::channel::distribution::channel_for_oid;
use crate::constants::CACHE_CHECK_BATCH;
use crate::error::{LoamError, Result};
use crate::types::{IdAnalysis, Oid, Tid, Timestamp};

use super::entity::{ChainEnds, ChainKind, EntityArena, EntitySlot, NIL};

const INITIAL_BUCKETS: usize = 16;

// ============================================================================
// Eviction policy
// ============================================================================

/// Pluggable payload eviction policy.
pub trait CacheEvaluator: Send {
  fn should_evict(
    &self,
    now_ms: Timestamp,
    last_touched_ms: Timestamp,
    length: u64,
    cache_bytes: u64,
  ) -> bool;
}

/// Evict when the entry is older than the timeout, or when its size-weighted
/// age outgrows the threshold-weighted cache volume.
pub struct DefaultCacheEvaluator {
  pub timeout_ms: u64,
  pub threshold: u64,
}

impl CacheEvaluator for DefaultCacheEvaluator {
  fn should_evict(
    &self,
    now_ms: Timestamp,
    last_touched_ms: Timestamp,
    length: u64,
    cache_bytes: u64,
  ) -> bool {
    let age_ms = now_ms.saturating_sub(last_touched_ms);
    if age_ms > self.timeout_ms {
      return true;
    }
    (length as u128) * (age_ms as u128) > (self.threshold as u128) * (cache_bytes as u128)
  }
}

// ============================================================================
// Cache
// ============================================================================

pub struct EntityCache {
  channel_index: usize,
  channel_count: usize,
  arena: EntityArena,
  buckets: Vec<ChainEnds>,
  type_chains: HashMap<Tid, ChainEnds>,
  entity_count: u64,
  cached_bytes: u64,
  check_cursor: u32,
}

impl EntityCache {
  pub fn new(channel_index: usize, channel_count: usize) -> Self {
    Self {
      channel_index,
      channel_count,
      arena: EntityArena::new(),
      buckets: vec![ChainEnds::default(); INITIAL_BUCKETS],
      type_chains: HashMap::new(),
      entity_count: 0,
      cached_bytes: 0,
      check_cursor: 0,
    }
  }

  pub fn channel_index(&self) -> usize {
    self.channel_index
  }

  pub fn entity_count(&self) -> u64 {
    self.entity_count
  }

  /// Sum of all cached payload bytes. Kept in lockstep with the entries.
  pub fn cached_bytes(&self) -> u64 {
    self.cached_bytes
  }

  fn bucket_of(&self, oid: Oid) -> usize {
    (xxh64(&oid.to_le_bytes(), 0) as usize) & (self.buckets.len() - 1)
  }

  // ==========================================================================
  // Lookup and insertion
  // ==========================================================================

  pub fn lookup(&self, oid: Oid) -> Option<u32> {
    let bucket = self.bucket_of(oid);
    let mut cursor = self.buckets[bucket].head;
    while cursor != NIL {
      let slot = self.arena.get(cursor);
      if slot.oid == oid {
        return Some(cursor);
      }
      cursor = slot.bucket_link.next;
    }
    None
  }

  /// Idempotent insert. A new OID gets a fresh slot appended at the tail of
  /// its type chain; an existing OID is returned as-is, moving type chains
  /// if a newer type version superseded the old one.
  pub fn put(&mut self, oid: Oid, tid: Tid, now: Timestamp) -> Result<u32> {
    let owner = channel_for_oid(oid, self.channel_count);
    if owner != self.channel_index {
      return Err(LoamError::Consistency(format!(
        "entity {} belongs to channel {} but was offered to channel {}",
        oid, owner, self.channel_index
      )));
    }

    if let Some(index) = self.lookup(oid) {
      let old_tid = self.arena.get(index).tid;
      if old_tid != tid {
        let mut old_chain = self.type_chains.remove(&old_tid).unwrap_or_default();
        self.arena.unlink(&mut old_chain, ChainKind::Type, index);
        if !old_chain.is_empty() {
          self.type_chains.insert(old_tid, old_chain);
        }
        let mut new_chain = self.type_chains.remove(&tid).unwrap_or_default();
        self.arena.link_tail(&mut new_chain, ChainKind::Type, index);
        self.type_chains.insert(tid, new_chain);
        self.arena.get_mut(index).tid = tid;
      }
      return Ok(index);
    }

    let index = self.arena.alloc(oid, tid, now);
    let bucket = self.bucket_of(oid);
    let mut bucket_chain = self.buckets[bucket];
    self.arena.link_tail(&mut bucket_chain, ChainKind::Bucket, index);
    self.buckets[bucket] = bucket_chain;

    let mut type_chain = self.type_chains.remove(&tid).unwrap_or_default();
    self.arena.link_tail(&mut type_chain, ChainKind::Type, index);
    self.type_chains.insert(tid, type_chain);

    self.entity_count += 1;
    self.maybe_grow_buckets();
    Ok(index)
  }

  /// Remove an entry from the type chain, its hash bucket, and the arena.
  /// The data-file chain must already be detached.
  pub fn remove(&mut self, index: u32) {
    let (oid, tid, cached) = {
      let slot = self.arena.get(index);
      (slot.oid, slot.tid, slot.cached_payload_length())
    };

    let bucket = self.bucket_of(oid);
    let mut bucket_chain = self.buckets[bucket];
    self.arena.unlink(&mut bucket_chain, ChainKind::Bucket, index);
    self.buckets[bucket] = bucket_chain;

    let mut type_chain = self.type_chains.remove(&tid).unwrap_or_default();
    self.arena.unlink(&mut type_chain, ChainKind::Type, index);
    if !type_chain.is_empty() {
      self.type_chains.insert(tid, type_chain);
    }

    self.cached_bytes -= cached;
    self.entity_count -= 1;
    self.arena.release(index);
  }

  fn maybe_grow_buckets(&mut self) {
    if self.entity_count as usize <= self.buckets.len() * 2 {
      return;
    }
    let new_len = self.buckets.len() * 2;
    self.buckets = vec![ChainEnds::default(); new_len];
    for index in 0..self.arena.capacity() {
      if !self.arena.is_occupied(index) {
        continue;
      }
      self.arena.get_mut(index).bucket_link = Default::default();
      let bucket = self.bucket_of(self.arena.get(index).oid);
      let mut chain = self.buckets[bucket];
      self.arena.link_tail(&mut chain, ChainKind::Bucket, index);
      self.buckets[bucket] = chain;
    }
  }

  // ==========================================================================
  // Payload management
  // ==========================================================================

  /// Install payload bytes read from disk and account them.
  pub fn install_payload(&mut self, index: u32, payload: Vec<u8>, now: Timestamp) {
    let slot = self.arena.get_mut(index);
    debug_assert!(slot.payload.is_none());
    self.cached_bytes += payload.len() as u64;
    slot.payload = Some(payload);
    slot.last_touched_ms = now;
  }

  /// Drop the cached payload; the on-disk record is untouched.
  /// Returns the number of bytes freed.
  pub fn clear_payload(&mut self, index: u32) -> u64 {
    let slot = self.arena.get_mut(index);
    let freed = slot.cached_payload_length();
    slot.payload = None;
    self.cached_bytes -= freed;
    freed
  }

  pub fn touch(&mut self, index: u32, now: Timestamp) {
    self.arena.get_mut(index).last_touched_ms = now;
  }

  // ==========================================================================
  // Incremental cache check
  // ==========================================================================

  /// One bounded eviction pass. Returns true when the cursor wrapped, i.e.
  /// every entry has been evaluated since the last wrap.
  pub fn incremental_cache_check(
    &mut self,
    deadline: Instant,
    evaluator: &dyn CacheEvaluator,
    now: Timestamp,
  ) -> bool {
    let capacity = self.arena.capacity();
    if capacity == 0 {
      return true;
    }
    let mut processed = 0u32;
    while self.check_cursor < capacity {
      if processed % CACHE_CHECK_BATCH as u32 == 0 && processed > 0 && Instant::now() >= deadline {
        return false;
      }
      let index = self.check_cursor;
      self.check_cursor += 1;
      processed += 1;

      if !self.arena.is_occupied(index) {
        continue;
      }
      let (touched, length, has_payload) = {
        let slot = self.arena.get(index);
        (
          slot.last_touched_ms,
          slot.length,
          slot.payload.is_some(),
        )
      };
      if has_payload && evaluator.should_evict(now, touched, length, self.cached_bytes) {
        self.clear_payload(index);
      }
    }
    self.check_cursor = 0;
    true
  }

  // ==========================================================================
  // Inspection
  // ==========================================================================

  pub fn validate_entities(&self) -> IdAnalysis {
    let mut analysis = IdAnalysis::default();
    for index in 0..self.arena.capacity() {
      if !self.arena.is_occupied(index) {
        continue;
      }
      let slot = self.arena.get(index);
      analysis.observe(slot.oid, slot.tid);
      analysis.entity_count += 1;
    }
    analysis
  }

  /// Slot indices of all entities of one type, in insertion order.
  pub fn entities_of_type(&self, tid: Tid) -> Vec<u32> {
    match self.type_chains.get(&tid) {
      Some(chain) => self.arena.chain_indices(chain, ChainKind::Type),
      None => Vec::new(),
    }
  }

  pub fn slot(&self, index: u32) -> &EntitySlot {
    self.arena.get(index)
  }

  pub fn slot_mut(&mut self, index: u32) -> &mut EntitySlot {
    self.arena.get_mut(index)
  }

  pub(crate) fn arena(&self) -> &EntityArena {
    &self.arena
  }

  pub(crate) fn arena_mut(&mut self) -> &mut EntityArena {
    &mut self.arena
  }

  /// Assert the cache's bookkeeping invariants. Test support.
  #[cfg(test)]
  pub(crate) fn assert_consistent(&self) {
    let mut total = 0u64;
    let mut count = 0u64;
    for index in 0..self.arena.capacity() {
      if !self.arena.is_occupied(index) {
        continue;
      }
      let slot = self.arena.get(index);
      total += slot.cached_payload_length();
      count += 1;
      let chain = self.type_chains.get(&slot.tid).expect("type chain exists");
      let members = self.arena.chain_indices(chain, ChainKind::Type);
      assert_eq!(
        members.iter().filter(|&&i| i == index).count(),
        1,
        "entity {} must appear exactly once in its type chain",
        slot.oid
      );
    }
    assert_eq!(total, self.cached_bytes, "cache byte counter out of sync");
    assert_eq!(count, self.entity_count, "entity count out of sync");
  }
}
