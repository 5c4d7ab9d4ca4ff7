//! Object id allocation and the root registry.
//!
//! A single process-wide atomic counter issues strictly monotonic 64-bit
//! ids. Ids are never reused; a skipped id is gone for good, which is how
//! channel-targeted allocation stays monotonic.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::channel::distribution::channel_for_oid;
use crate::constants::{OID_FIRST_USER, OID_ROOT_REGISTRY};
use crate::types::Oid;

pub struct OidAllocator {
  next: AtomicU64,
}

impl Default for OidAllocator {
  fn default() -> Self {
    Self::new()
  }
}

impl OidAllocator {
  pub fn new() -> Self {
    Self {
      next: AtomicU64::new(OID_FIRST_USER),
    }
  }

  /// Next monotonic id, no channel preference.
  pub fn allocate(&self) -> Oid {
    self.next.fetch_add(1, Ordering::SeqCst)
  }

  /// Next monotonic id owned by `target`. Skips over ids of other channels;
  /// at most `channel_count - 1` ids are burned per call.
  pub fn allocate_for_channel(&self, target: usize, channel_count: usize) -> Oid {
    loop {
      let current = self.next.load(Ordering::SeqCst);
      let mut candidate = current;
      while channel_for_oid(candidate, channel_count) != target {
        candidate += 1;
      }
      if self
        .next
        .compare_exchange(current, candidate + 1, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
      {
        return candidate;
      }
    }
  }

  /// Ensure every future id exceeds `highest_seen`. Used at startup with the
  /// highest id found on disk.
  pub fn bump_to(&self, highest_seen: Oid) {
    let floor = highest_seen.saturating_add(1).max(OID_FIRST_USER);
    loop {
      let current = self.next.load(Ordering::SeqCst);
      if current >= floor {
        return;
      }
      if self
        .next
        .compare_exchange(current, floor, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
      {
        return;
      }
    }
  }

  pub fn peek(&self) -> Oid {
    self.next.load(Ordering::SeqCst)
  }
}

// ============================================================================
// Root registry
// ============================================================================

/// The set of root object ids reachability is measured from. Persisted as
/// the payload of the reserved registry entity.
pub struct RootRegistry {
  roots: Mutex<Vec<Oid>>,
}

impl Default for RootRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl RootRegistry {
  pub fn new() -> Self {
    Self {
      roots: Mutex::new(Vec::new()),
    }
  }

  /// Replace the user root (the registry keeps at most one today).
  pub fn set_user_root(&self, oid: Oid) {
    let mut roots = self.roots.lock();
    roots.clear();
    roots.push(oid);
  }

  pub fn user_root(&self) -> Option<Oid> {
    self.roots.lock().first().copied()
  }

  pub fn roots(&self) -> Vec<Oid> {
    self.roots.lock().clone()
  }

  pub fn restore(&self, roots: Vec<Oid>) {
    *self.roots.lock() = roots;
  }

  /// The GC's starting frontier: the registry entity itself. Everything else
  /// is reachable through its references.
  pub fn mark_frontier(&self) -> Vec<Oid> {
    vec![OID_ROOT_REGISTRY]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_ids_are_strictly_monotonic() {
    let allocator = OidAllocator::new();
    let a = allocator.allocate();
    let b = allocator.allocate();
    assert!(b > a);
    assert!(a >= OID_FIRST_USER);
  }

  #[test]
  fn test_channel_targeted_allocation() {
    let allocator = OidAllocator::new();
    let mut previous = 0;
    for target in [3usize, 0, 1, 3, 2] {
      let oid = allocator.allocate_for_channel(target, 4);
      assert_eq!(channel_for_oid(oid, 4), target);
      assert!(oid > previous);
      previous = oid;
    }
  }

  #[test]
  fn test_bump_to_only_raises() {
    let allocator = OidAllocator::new();
    allocator.bump_to(100);
    assert_eq!(allocator.peek(), 101);
    allocator.bump_to(50);
    assert_eq!(allocator.peek(), 101);
  }

  #[test]
  fn test_registry_single_user_root() {
    let registry = RootRegistry::new();
    assert_eq!(registry.user_root(), None);
    registry.set_user_root(42);
    registry.set_user_root(44);
    assert_eq!(registry.roots(), vec![44]);
    assert_eq!(registry.mark_frontier(), vec![OID_ROOT_REGISTRY]);
  }
}
