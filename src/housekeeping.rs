//! Housekeeping scheduler.
//!
//! One dedicated thread per storage wakes on a fixed interval and hands the
//! channel manager a nanosecond budget for GC, file cleanup, and cache
//! eviction. Adaptive mode grows the budget while cycles keep finishing
//! inside it and snaps back to the baseline the moment one does not.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::channel::ChannelManager;
use crate::config::StorageConfig;
use crate::metrics::HousekeepingStatistics;

/// State shared between the scheduler thread and its owner.
pub struct SchedulerShared {
  stop_signal: AtomicBool,
  cycles_run: AtomicU64,
  cycles_completed_in_budget: AtomicU64,
  current_budget_ns: AtomicU64,
  wakeup_lock: Mutex<()>,
  wakeup: Condvar,
}

impl SchedulerShared {
  fn new(baseline_budget_ns: u64) -> Self {
    Self {
      stop_signal: AtomicBool::new(false),
      cycles_run: AtomicU64::new(0),
      cycles_completed_in_budget: AtomicU64::new(0),
      current_budget_ns: AtomicU64::new(baseline_budget_ns),
      wakeup_lock: Mutex::new(()),
      wakeup: Condvar::new(),
    }
  }

  pub fn should_stop(&self) -> bool {
    self.stop_signal.load(Ordering::SeqCst)
  }

  fn stop(&self) {
    self.stop_signal.store(true, Ordering::SeqCst);
    let _guard = self.wakeup_lock.lock();
    self.wakeup.notify_all();
  }

  pub fn statistics(&self) -> HousekeepingStatistics {
    HousekeepingStatistics {
      cycles_run: self.cycles_run.load(Ordering::Relaxed),
      cycles_completed_in_budget: self.cycles_completed_in_budget.load(Ordering::Relaxed),
      current_time_budget_ns: self.current_budget_ns.load(Ordering::Relaxed),
    }
  }
}

pub struct HousekeepingScheduler {
  shared: Arc<SchedulerShared>,
  join: Option<JoinHandle<()>>,
}

impl HousekeepingScheduler {
  pub fn start(config: Arc<StorageConfig>, manager: Arc<ChannelManager>) -> HousekeepingScheduler {
    let shared = Arc::new(SchedulerShared::new(config.housekeeping_time_budget_ns));
    let thread_shared = shared.clone();
    let join = std::thread::Builder::new()
      .name("loamdb-housekeeping".to_string())
      .spawn(move || run(config, manager, thread_shared))
      .expect("housekeeping thread spawns");
    HousekeepingScheduler {
      shared,
      join: Some(join),
    }
  }

  pub fn shared(&self) -> &Arc<SchedulerShared> {
    &self.shared
  }

  pub fn statistics(&self) -> HousekeepingStatistics {
    self.shared.statistics()
  }

  /// Signal the thread and wait for it to exit.
  pub fn stop(&mut self) {
    self.shared.stop();
    if let Some(join) = self.join.take() {
      let _ = join.join();
    }
  }
}

impl Drop for HousekeepingScheduler {
  fn drop(&mut self) {
    self.stop();
  }
}

fn run(config: Arc<StorageConfig>, manager: Arc<ChannelManager>, shared: Arc<SchedulerShared>) {
  let baseline = config.housekeeping_time_budget_ns;
  let mut budget = baseline;
  let mut consecutive_in_budget: u32 = 0;

  loop {
    {
      let mut guard = shared.wakeup_lock.lock();
      shared.wakeup.wait_for(
        &mut guard,
        Duration::from_millis(config.housekeeping_interval_ms),
      );
    }
    if shared.should_stop() {
      return;
    }

    let started = Instant::now();
    match manager.issue_housekeeping(budget) {
      Ok(done) => {
        shared.cycles_run.fetch_add(1, Ordering::Relaxed);
        let within_budget = done && started.elapsed().as_nanos() <= budget as u128;
        if within_budget {
          shared
            .cycles_completed_in_budget
            .fetch_add(1, Ordering::Relaxed);
          consecutive_in_budget += 1;
          if consecutive_in_budget > config.budget_increase_threshold {
            budget = (budget + config.budget_increase_ns).min(config.maximum_time_budget_ns);
          }
        } else {
          consecutive_in_budget = 0;
          budget = baseline;
        }
      }
      Err(err) => {
        warn!(%err, "housekeeping cycle failed");
        consecutive_in_budget = 0;
        budget = baseline;
      }
    }
    shared.current_budget_ns.store(budget, Ordering::Relaxed);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::blob::LocalFileConnector;
  use crate::constants::DEFAULT_MAXIMUM_TIME_BUDGET_NS;
  use crate::dict::TypeDictionary;
  use std::time::Duration;
  use tempfile::tempdir;

  fn scheduler_fixture(interval_ms: u64) -> (tempfile::TempDir, HousekeepingScheduler) {
    let dir = tempdir().expect("tempdir");
    let config = Arc::new(
      StorageConfig::new(dir.path())
        .channel_count(1)
        .housekeeping_interval_ms(interval_ms),
    );
    let connector = Arc::new(LocalFileConnector::new(dir.path()));
    let dictionary = Arc::new(TypeDictionary::new());
    let (manager, _analysis) =
      crate::channel::ChannelManager::start(config.clone(), connector, dictionary)
        .expect("manager starts");
    let scheduler = HousekeepingScheduler::start(config, Arc::new(manager));
    (dir, scheduler)
  }

  #[test]
  fn test_scheduler_runs_cycles_on_interval() {
    let (_dir, mut scheduler) = scheduler_fixture(5);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
      if scheduler.statistics().cycles_run >= 3 {
        break;
      }
      assert!(
        std::time::Instant::now() < deadline,
        "scheduler never ran: {:?}",
        scheduler.statistics()
      );
      std::thread::sleep(Duration::from_millis(5));
    }
    scheduler.stop();
  }

  #[test]
  fn test_stop_is_idempotent_and_quick() {
    let (_dir, mut scheduler) = scheduler_fixture(10_000);
    scheduler.stop();
    scheduler.stop();
    assert!(scheduler.statistics().current_time_budget_ns <= DEFAULT_MAXIMUM_TIME_BUDGET_NS);
  }
}
