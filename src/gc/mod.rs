//! Tri-color incremental mark-and-sweep, scoped to one channel.
//!
//! Marking drains the channel's mark queue, loading each entity's payload to
//! route its outbound references to their owning channels. Sweeping removes
//! everything still white once the monitor reports marking complete across
//! all channels. Both phases yield cooperatively at their cursors when the
//! time budget runs out.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error};

use crate::channel::distribution::channel_for_oid;
use crate::constants::{GC_MARK_BATCH, OID_ROOT_REGISTRY};
use crate::core::cache::EntityCache;
use crate::core::data_files::DataFileManager;
use crate::dict::TypeDictionary;
use crate::error::{LoamError, Result};
use crate::types::{GcColor, Oid};

pub mod monitor;

pub use monitor::{GcPhase, MarkMonitor};

/// Counters accumulated across cycles.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcChannelStats {
  pub cycles_completed: u64,
  pub entities_swept_total: u64,
  pub bytes_reclaimed_total: u64,
  pub last_cycle_swept: u64,
}

pub struct ChannelGc {
  channel_index: usize,
  channel_count: usize,
  monitor: Arc<MarkMonitor>,
  /// Generation this channel has prepared (reset colors) for.
  local_generation: u64,
  colors_reset: bool,
  reset_cursor: u32,
  sweep_cursor: u32,
  swept_this_cycle: u64,
  bytes_this_cycle: u64,
  stats: GcChannelStats,
}

impl ChannelGc {
  pub fn new(channel_index: usize, channel_count: usize, monitor: Arc<MarkMonitor>) -> Self {
    Self {
      channel_index,
      channel_count,
      monitor,
      local_generation: 0,
      colors_reset: false,
      reset_cursor: 0,
      sweep_cursor: 0,
      swept_this_cycle: 0,
      bytes_this_cycle: 0,
      stats: GcChannelStats::default(),
    }
  }

  pub fn stats(&self) -> GcChannelStats {
    self.stats
  }

  pub fn monitor(&self) -> &Arc<MarkMonitor> {
    &self.monitor
  }

  /// One bounded GC step. Returns true when the collective cycle has fully
  /// completed (the monitor is back to idle); false when more budget is
  /// needed. Progress survives between calls in the mark queue and the
  /// reset/sweep cursors.
  pub fn incremental_gc(
    &mut self,
    cache: &mut EntityCache,
    files: &mut DataFileManager,
    dictionary: &TypeDictionary,
    deadline: Instant,
  ) -> Result<bool> {
    loop {
      match self.monitor.phase() {
        GcPhase::Idle => return Ok(true),
        GcPhase::Marking => {
          if !self.mark_step(cache, files, dictionary, deadline)? {
            return Ok(false);
          }
          // Marking may have just completed everywhere; loop into sweep.
          if !self.monitor.marking_complete() {
            return Ok(false);
          }
        }
        GcPhase::Sweeping => {
          if !self.sweep_step(cache, files, deadline)? {
            return Ok(false);
          }
          return Ok(self.monitor.phase() == GcPhase::Idle);
        }
      }
    }
  }

  /// Bring this channel's colors up to date with the current cycle before a
  /// store is applied. Without this, a store landing between the cycle
  /// opening and this channel's first mark step would be whitened by the
  /// pending reset instead of entering the cycle black.
  pub fn prepare_for_store(&mut self, cache: &mut EntityCache) {
    if self.monitor.phase() != GcPhase::Marking {
      return;
    }
    self.sync_generation();
    if !self.colors_reset {
      let capacity = cache.arena().capacity();
      while self.reset_cursor < capacity {
        let index = self.reset_cursor;
        self.reset_cursor += 1;
        if cache.arena().is_occupied(index) {
          cache.slot_mut(index).color = GcColor::White;
        }
      }
      self.colors_reset = true;
    }
  }

  fn sync_generation(&mut self) {
    let generation = self.monitor.generation();
    if self.local_generation != generation {
      self.local_generation = generation;
      self.colors_reset = false;
      self.reset_cursor = 0;
      self.sweep_cursor = 0;
      self.swept_this_cycle = 0;
      self.bytes_this_cycle = 0;
    }
  }

  /// Mark-only step for the orphan scan: never proceeds into the sweep.
  /// Returns true once marking is complete across all channels.
  pub fn incremental_mark(
    &mut self,
    cache: &mut EntityCache,
    files: &mut DataFileManager,
    dictionary: &TypeDictionary,
    deadline: Instant,
  ) -> Result<bool> {
    if self.monitor.phase() != GcPhase::Marking {
      return Ok(self.monitor.marking_complete());
    }
    self.mark_step(cache, files, dictionary, deadline)?;
    Ok(self.monitor.marking_complete())
  }

  // ==========================================================================
  // Mark phase
  // ==========================================================================

  /// Returns true when this channel has drained its queue (and reported
  /// idle); false when the deadline interrupted it.
  fn mark_step(
    &mut self,
    cache: &mut EntityCache,
    files: &mut DataFileManager,
    dictionary: &TypeDictionary,
    deadline: Instant,
  ) -> Result<bool> {
    self.sync_generation();

    // Reset every entry to white before consuming the queue. Entities stored
    // while the cycle runs enter black through the store path.
    if !self.colors_reset {
      let capacity = cache.arena().capacity();
      while self.reset_cursor < capacity {
        if self.reset_cursor % GC_MARK_BATCH as u32 == 0 && Instant::now() >= deadline {
          return Ok(false);
        }
        let index = self.reset_cursor;
        self.reset_cursor += 1;
        if cache.arena().is_occupied(index) {
          cache.slot_mut(index).color = GcColor::White;
        }
      }
      self.colors_reset = true;
    }

    loop {
      if Instant::now() >= deadline {
        return Ok(false);
      }
      let batch = self.monitor.drain(self.channel_index, GC_MARK_BATCH);
      if batch.is_empty() {
        self.monitor.report_idle(self.channel_index);
        return Ok(true);
      }
      for oid in batch {
        self.mark_one(cache, files, dictionary, oid)?;
      }
    }
  }

  fn mark_one(
    &mut self,
    cache: &mut EntityCache,
    files: &mut DataFileManager,
    dictionary: &TypeDictionary,
    oid: Oid,
  ) -> Result<()> {
    let owner = channel_for_oid(oid, self.channel_count);
    if owner != self.channel_index {
      // Mis-routed id: hand it to its owner.
      self.monitor.enqueue(owner, oid);
      return Ok(());
    }

    let index = match cache.lookup(oid) {
      Some(index) => index,
      // A storage that never persisted a root has no registry entity; the
      // root set is simply empty. Any other unknown id is corruption.
      None if oid == OID_ROOT_REGISTRY => return Ok(()),
      None => {
        return Err(LoamError::Consistency(format!(
          "marking found a reference to unknown object id {oid} on channel {}",
          self.channel_index
        )))
      }
    };

    if cache.slot(index).color == GcColor::Black {
      return Ok(());
    }
    cache.slot_mut(index).color = GcColor::Gray;

    let tid = cache.slot(index).tid;
    let definition = dictionary
      .definition(tid)
      .ok_or(LoamError::TypeHandlerConsistency(tid))?;

    if definition.has_persisted_references {
      let handler = dictionary
        .handler(tid)
        .ok_or(LoamError::TypeHandlerConsistency(tid))?;
      // Marking reads payloads transiently; it never grows the cache.
      let borrowed;
      let payload: &[u8] = match cache.slot(index).payload.as_ref() {
        Some(payload) => payload,
        None => {
          borrowed = files.read_payload(cache, index)?;
          &borrowed
        }
      };
      let monitor = &self.monitor;
      let channel_count = self.channel_count;
      handler.iterate_references(payload, &mut |reference| {
        monitor.enqueue(channel_for_oid(reference, channel_count), reference);
      })?;
    }

    cache.slot_mut(index).color = GcColor::Black;
    Ok(())
  }

  // ==========================================================================
  // Sweep phase
  // ==========================================================================

  /// Returns true when this channel's sweep finished (or was not owed);
  /// false when the deadline interrupted it.
  fn sweep_step(
    &mut self,
    cache: &mut EntityCache,
    files: &mut DataFileManager,
    deadline: Instant,
  ) -> Result<bool> {
    if !self.monitor.pending_sweep(self.channel_index) {
      return Ok(true);
    }
    if !self.monitor.marking_complete() {
      // Unreachable by construction; a sweep without completed marking would
      // collect live data.
      error!(channel = self.channel_index, "sweep attempted before marking completed");
      self.monitor.abort_cycle();
      return Err(LoamError::Consistency(
        "sweep attempted before marking completed".to_string(),
      ));
    }

    let capacity = cache.arena().capacity();
    while self.sweep_cursor < capacity {
      if self.sweep_cursor % GC_MARK_BATCH as u32 == 0 && Instant::now() >= deadline {
        return Ok(false);
      }
      let index = self.sweep_cursor;
      self.sweep_cursor += 1;

      if !cache.arena().is_occupied(index) {
        continue;
      }
      if cache.slot(index).color != GcColor::White {
        continue;
      }
      let length = cache.slot(index).length;
      files.release_entity(cache, index);
      cache.remove(index);
      self.swept_this_cycle += 1;
      self.bytes_this_cycle += length;
    }

    self.verify_root(cache)?;

    self.stats.cycles_completed += 1;
    self.stats.entities_swept_total += self.swept_this_cycle;
    self.stats.bytes_reclaimed_total += self.bytes_this_cycle;
    self.stats.last_cycle_swept = self.swept_this_cycle;
    debug!(
      channel = self.channel_index,
      swept = self.swept_this_cycle,
      bytes = self.bytes_this_cycle,
      "sweep complete"
    );
    self.monitor.report_swept(self.channel_index);
    Ok(true)
  }

  /// After sweep, the root registry entity, if it exists at all, must have
  /// survived black on its owning channel. A storage that never stored a
  /// root legitimately has no registry.
  fn verify_root(&self, cache: &EntityCache) -> Result<()> {
    if channel_for_oid(OID_ROOT_REGISTRY, self.channel_count) != self.channel_index {
      return Ok(());
    }
    if let Some(index) = cache.lookup(OID_ROOT_REGISTRY) {
      if cache.slot(index).color != GcColor::Black {
        return Err(LoamError::Consistency(
          "root registry entity survived sweep without being marked".to_string(),
        ));
      }
    }
    Ok(())
  }

  /// OIDs of entries still white on this channel. Meaningful once marking is
  /// complete and before the sweep runs.
  pub fn collect_white(&self, cache: &EntityCache) -> Vec<Oid> {
    let mut white = Vec::new();
    for index in 0..cache.arena().capacity() {
      if cache.arena().is_occupied(index) && cache.slot(index).color == GcColor::White {
        white.push(cache.slot(index).oid);
      }
    }
    white.sort_unstable();
    white
  }
}
