//! Cross-channel mark monitor.
//!
//! The only synchronisation primitive channels share during garbage
//! collection. It owns one mark queue per channel and decides when marking
//! is complete everywhere: a generation counter plus per-channel
//! acknowledgements. A channel acknowledges when its queue is drained;
//! routing new work to a channel withdraws its acknowledgement; the sweep
//! opens only when every channel has acknowledged and no channel has a store
//! in flight.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::types::Oid;

/// Phase of the collective GC cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
  Idle,
  Marking,
  Sweeping,
}

struct MonitorState {
  generation: u64,
  phase: GcPhase,
  mark_acknowledged: Vec<bool>,
  sweep_complete: Vec<bool>,
  pending_stores: Vec<u64>,
  /// While set, no channel is owed a sweep; the orphan scan reads colors
  /// between mark completion and sweep.
  sweep_suppressed: bool,
}

pub struct MarkMonitor {
  channel_count: usize,
  state: Mutex<MonitorState>,
  // Lock order: `state` before any queue. Queues are locked one at a time.
  queues: Vec<Mutex<VecDeque<Oid>>>,
}

impl MarkMonitor {
  pub fn new(channel_count: usize) -> Self {
    Self {
      channel_count,
      state: Mutex::new(MonitorState {
        generation: 0,
        phase: GcPhase::Idle,
        mark_acknowledged: vec![false; channel_count],
        sweep_complete: vec![false; channel_count],
        pending_stores: vec![0; channel_count],
        sweep_suppressed: false,
      }),
      queues: (0..channel_count).map(|_| Mutex::new(VecDeque::new())).collect(),
    }
  }

  pub fn channel_count(&self) -> usize {
    self.channel_count
  }

  pub fn phase(&self) -> GcPhase {
    self.state.lock().phase
  }

  pub fn generation(&self) -> u64 {
    self.state.lock().generation
  }

  // ==========================================================================
  // Cycle control
  // ==========================================================================

  /// Open a new mark cycle. Returns the generation the cycle runs under, or
  /// None if a cycle is already in progress.
  pub fn begin_cycle(&self) -> Option<u64> {
    let mut state = self.state.lock();
    if state.phase != GcPhase::Idle {
      return None;
    }
    state.generation += 1;
    state.phase = GcPhase::Marking;
    state.mark_acknowledged.iter_mut().for_each(|a| *a = false);
    state.sweep_complete.iter_mut().for_each(|s| *s = false);
    for queue in &self.queues {
      queue.lock().clear();
    }
    tracing::debug!(generation = state.generation, "mark cycle opened");
    Some(state.generation)
  }

  /// Abandon the current cycle without sweeping. The generation still
  /// advances at the next `begin_cycle`, which is what resets stale colors.
  pub fn abort_cycle(&self) {
    let mut state = self.state.lock();
    if state.phase != GcPhase::Idle {
      tracing::warn!(generation = state.generation, "mark cycle aborted");
      state.phase = GcPhase::Idle;
      for queue in &self.queues {
        queue.lock().clear();
      }
    }
  }

  // ==========================================================================
  // Mark queue routing
  // ==========================================================================

  /// Route an OID to its owning channel's mark queue, withdrawing that
  /// channel's completion acknowledgement.
  pub fn enqueue(&self, channel: usize, oid: Oid) {
    let mut state = self.state.lock();
    if state.phase != GcPhase::Marking {
      return;
    }
    state.mark_acknowledged[channel] = false;
    self.queues[channel].lock().push_back(oid);
  }

  /// Pull up to `max` OIDs from a channel's queue.
  pub fn drain(&self, channel: usize, max: usize) -> Vec<Oid> {
    let mut queue = self.queues[channel].lock();
    let take = max.min(queue.len());
    queue.drain(..take).collect()
  }

  pub fn queue_len(&self, channel: usize) -> usize {
    self.queues[channel].lock().len()
  }

  /// A channel reports that it has drained its queue. The acknowledgement
  /// only sticks while the queue is still empty under the monitor lock.
  /// When the last channel acknowledges and no stores are pending, the
  /// cycle moves to `Sweeping`.
  pub fn report_idle(&self, channel: usize) {
    let mut state = self.state.lock();
    if state.phase != GcPhase::Marking {
      return;
    }
    if self.queues[channel].lock().is_empty() {
      state.mark_acknowledged[channel] = true;
    }
    let all_acknowledged = state.mark_acknowledged.iter().all(|&a| a);
    let stores_pending: u64 = state.pending_stores.iter().sum();
    if all_acknowledged && stores_pending == 0 {
      state.phase = GcPhase::Sweeping;
      tracing::debug!(generation = state.generation, "marking complete, sweep open");
    }
  }

  /// True once marking has completed everywhere for the current cycle.
  pub fn marking_complete(&self) -> bool {
    self.state.lock().phase == GcPhase::Sweeping
  }

  // ==========================================================================
  // Pending-store barrier
  // ==========================================================================

  /// A store was accepted on `channel`; sweep must wait for it.
  pub fn pending_store_begin(&self, channel: usize) {
    self.state.lock().pending_stores[channel] += 1;
  }

  pub fn pending_store_end(&self, channel: usize) {
    let mut state = self.state.lock();
    state.pending_stores[channel] = state.pending_stores[channel].saturating_sub(1);
  }

  // ==========================================================================
  // Sweep coordination
  // ==========================================================================

  /// Whether `channel` still owes a sweep for the current cycle.
  pub fn pending_sweep(&self, channel: usize) -> bool {
    let state = self.state.lock();
    state.phase == GcPhase::Sweeping && !state.sweep_suppressed && !state.sweep_complete[channel]
  }

  /// Hold every channel's sweep while the orphan scan reads colors.
  pub fn suppress_sweep(&self, on: bool) {
    self.state.lock().sweep_suppressed = on;
  }

  /// A channel finished sweeping. The cycle closes when the last one does.
  pub fn report_swept(&self, channel: usize) {
    let mut state = self.state.lock();
    if state.phase != GcPhase::Sweeping {
      return;
    }
    state.sweep_complete[channel] = true;
    if state.sweep_complete.iter().all(|&s| s) {
      state.phase = GcPhase::Idle;
      tracing::debug!(generation = state.generation, "gc cycle complete");
    }
  }
}
