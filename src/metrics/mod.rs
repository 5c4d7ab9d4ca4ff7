//! Statistics and counters.
//!
//! The engine emits counters only; exporting them is the embedding
//! application's business. Process and system memory are reported as
//! distinct values: process footprint comes from the OS accounting of this
//! process, system availability from the machine-wide view.

use sysinfo::System;

use crate::types::ChannelState;

/// Per-channel counters, captured by the channel worker.
#[derive(Debug, Clone)]
pub struct ChannelStatistics {
  pub channel_index: usize,
  pub state: ChannelState,
  pub entity_count: u64,
  pub cached_bytes: u64,
  pub data_file_count: u64,
  pub total_bytes: u64,
  pub live_bytes: u64,
  pub head_file_number: u64,
  pub transaction_log_bytes: u64,
  pub gc_cycles_completed: u64,
  pub gc_entities_swept: u64,
  pub gc_bytes_reclaimed: u64,
}

impl ChannelStatistics {
  pub fn use_ratio(&self) -> f64 {
    if self.total_bytes == 0 {
      1.0
    } else {
      self.live_bytes as f64 / self.total_bytes as f64
    }
  }
}

/// Housekeeping scheduler counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct HousekeepingStatistics {
  pub cycles_run: u64,
  pub cycles_completed_in_budget: u64,
  pub current_time_budget_ns: u64,
}

/// Process vs system memory, kept separate on purpose.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStatistics {
  /// Resident set size of this process.
  pub process_physical_bytes: u64,
  /// Virtual address space of this process.
  pub process_virtual_bytes: u64,
  /// Memory the machine still has available for allocation.
  pub system_available_bytes: u64,
}

/// Capture current memory counters.
pub fn collect_memory_statistics() -> MemoryStatistics {
  let mut stats = MemoryStatistics::default();
  if let Some(usage) = memory_stats::memory_stats() {
    stats.process_physical_bytes = usage.physical_mem as u64;
    stats.process_virtual_bytes = usage.virtual_mem as u64;
  }
  let mut system = System::new();
  system.refresh_memory();
  stats.system_available_bytes = system.available_memory();
  stats
}

/// Aggregated view over the whole storage.
#[derive(Debug, Clone)]
pub struct StorageStatistics {
  pub channels: Vec<ChannelStatistics>,
  pub entity_count: u64,
  pub cached_bytes: u64,
  pub data_file_count: u64,
  pub total_bytes: u64,
  pub live_bytes: u64,
  pub gc_generation: u64,
  pub housekeeping: HousekeepingStatistics,
  pub memory: MemoryStatistics,
}

impl StorageStatistics {
  pub fn aggregate(
    channels: Vec<ChannelStatistics>,
    gc_generation: u64,
    housekeeping: HousekeepingStatistics,
  ) -> Self {
    let entity_count = channels.iter().map(|c| c.entity_count).sum();
    let cached_bytes = channels.iter().map(|c| c.cached_bytes).sum();
    let data_file_count = channels.iter().map(|c| c.data_file_count).sum();
    let total_bytes = channels.iter().map(|c| c.total_bytes).sum();
    let live_bytes = channels.iter().map(|c| c.live_bytes).sum();
    Self {
      channels,
      entity_count,
      cached_bytes,
      data_file_count,
      total_bytes,
      live_bytes,
      gc_generation,
      housekeeping,
      memory: collect_memory_statistics(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_memory_counters_are_distinct_fields() {
    let memory = collect_memory_statistics();
    // Process footprint must never be conflated with system availability.
    assert!(memory.process_physical_bytes > 0);
    assert!(memory.system_available_bytes > 0);
  }

  #[test]
  fn test_aggregate_sums_channels() {
    let channel = |index: usize, entities: u64| ChannelStatistics {
      channel_index: index,
      state: ChannelState::Running,
      entity_count: entities,
      cached_bytes: entities * 10,
      data_file_count: 1,
      total_bytes: 100,
      live_bytes: 80,
      head_file_number: 1,
      transaction_log_bytes: 33,
      gc_cycles_completed: 0,
      gc_entities_swept: 0,
      gc_bytes_reclaimed: 0,
    };
    let stats = StorageStatistics::aggregate(
      vec![channel(0, 3), channel(1, 5)],
      7,
      HousekeepingStatistics::default(),
    );
    assert_eq!(stats.entity_count, 8);
    assert_eq!(stats.cached_bytes, 80);
    assert_eq!(stats.total_bytes, 200);
    assert_eq!(stats.gc_generation, 7);
  }
}
