//! Entity distribution across channels.
//!
//! Channel ownership is a pure function of the object id: `oid & (N - 1)`
//! for N channels. Distribution strategies therefore steer which ids the
//! allocator issues, not where existing entities live; an entity never moves
//! to another channel once its id exists.

use std::sync::atomic::{AtomicUsize, Ordering};

use xxhash_rust::xxh64::xxh64;

use crate::config::DistributionStrategy;
use crate::types::{Oid, Tid};

/// The deterministic owner of an object id. `channel_count` is a power of
/// two, so this is a mask.
#[inline]
pub fn channel_for_oid(oid: Oid, channel_count: usize) -> usize {
  (oid & (channel_count as u64 - 1)) as usize
}

/// Picks target channels for newly issued object ids.
pub struct EntityDistributor {
  strategy: DistributionStrategy,
  channel_count: usize,
  round_robin: AtomicUsize,
  weights: Vec<f64>,
}

impl EntityDistributor {
  pub fn new(strategy: DistributionStrategy, channel_count: usize, weights: Vec<f64>) -> Self {
    let weights = if weights.len() == channel_count {
      weights
    } else {
      vec![1.0; channel_count]
    };
    Self {
      strategy,
      channel_count,
      round_robin: AtomicUsize::new(0),
      weights,
    }
  }

  pub fn strategy(&self) -> DistributionStrategy {
    self.strategy
  }

  /// Target channel for the next new entity of type `tid`, given current
  /// per-channel entity counts. `None` means "no preference": the allocator
  /// hands out the next monotonic id and ownership falls where the mask
  /// puts it.
  pub fn target_channel(&self, tid: Tid, loads: &[u64]) -> Option<usize> {
    match self.strategy {
      DistributionStrategy::HashByObjectId => None,
      DistributionStrategy::RoundRobin => {
        Some(self.round_robin.fetch_add(1, Ordering::Relaxed) % self.channel_count)
      }
      DistributionStrategy::LeastLoaded => Some(
        loads
          .iter()
          .enumerate()
          .min_by_key(|(_, &load)| load)
          .map(|(index, _)| index)
          .unwrap_or(0),
      ),
      DistributionStrategy::HashByType => {
        Some((xxh64(&tid.to_le_bytes(), 0) as usize) & (self.channel_count - 1))
      }
      DistributionStrategy::WeightedCapacity => {
        // Largest weighted deficit: the channel furthest below its share.
        let total: u64 = loads.iter().sum();
        let weight_sum: f64 = self.weights.iter().sum();
        let mut best = 0;
        let mut best_deficit = f64::MIN;
        for index in 0..self.channel_count {
          let share = self.weights[index] / weight_sum * (total as f64 + 1.0);
          let deficit = share - loads[index] as f64;
          if deficit > best_deficit {
            best_deficit = deficit;
            best = index;
          }
        }
        Some(best)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_ownership_is_a_mask() {
    assert_eq!(channel_for_oid(0, 4), 0);
    assert_eq!(channel_for_oid(5, 4), 1);
    assert_eq!(channel_for_oid(7, 4), 3);
    assert_eq!(channel_for_oid(7, 1), 0);
  }

  #[test]
  fn test_round_robin_cycles() {
    let distributor = EntityDistributor::new(DistributionStrategy::RoundRobin, 4, Vec::new());
    let targets: Vec<_> = (0..8)
      .map(|_| distributor.target_channel(1000, &[0; 4]).expect("target"))
      .collect();
    assert_eq!(targets, vec![0, 1, 2, 3, 0, 1, 2, 3]);
  }

  #[test]
  fn test_least_loaded_picks_minimum() {
    let distributor = EntityDistributor::new(DistributionStrategy::LeastLoaded, 4, Vec::new());
    assert_eq!(distributor.target_channel(1000, &[5, 2, 9, 4]), Some(1));
  }

  #[test]
  fn test_hash_by_type_is_stable() {
    let distributor = EntityDistributor::new(DistributionStrategy::HashByType, 4, Vec::new());
    let first = distributor.target_channel(1000, &[0; 4]);
    let second = distributor.target_channel(1000, &[9; 4]);
    assert_eq!(first, second);
  }

  #[test]
  fn test_hash_by_object_id_has_no_preference() {
    let distributor = EntityDistributor::new(DistributionStrategy::HashByObjectId, 4, Vec::new());
    assert_eq!(distributor.target_channel(1000, &[0; 4]), None);
  }

  #[test]
  fn test_weighted_capacity_respects_weights() {
    let distributor = EntityDistributor::new(
      DistributionStrategy::WeightedCapacity,
      2,
      vec![3.0, 1.0],
    );
    let mut loads = [0u64; 2];
    for _ in 0..400 {
      let target = distributor.target_channel(1000, &loads).expect("target");
      loads[target] += 1;
    }
    // Channel 0 carries roughly three quarters of the load.
    assert!(loads[0] > 270 && loads[0] < 330, "loads: {loads:?}");
  }
}
