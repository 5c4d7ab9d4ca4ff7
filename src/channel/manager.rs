//! Channel manager: owns the fixed channel array.
//!
//! Scatters stores and loads to the owning channels, coordinates the shared
//! mark monitor, and fans the housekeeping budget out in equal slices. Full
//! (unbounded) operations hold the store gate so no user store can overlap
//! a sweep.

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver};
use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::warn;

use crate::blob::{BlobConnector, BlobPath};
use crate::config::StorageConfig;
use crate::constants::{BUDGET_UNBOUNDED_NS, OID_ROOT_REGISTRY};
use crate::dict::TypeDictionary;
use crate::error::{LoamError, Result};
use crate::gc::{GcPhase, MarkMonitor};
use crate::metrics::ChannelStatistics;
use crate::types::{EntityChunk, IdAnalysis, Oid, StoredEntity, Tid, Timestamp};

use super::distribution::{channel_for_oid, EntityDistributor};
use super::{ChannelCommand, StorageChannel};

pub struct ChannelManager {
  config: Arc<StorageConfig>,
  monitor: Arc<MarkMonitor>,
  distributor: EntityDistributor,
  channels: Vec<StorageChannel>,
  /// Stores take it shared; full housekeeping operations take it exclusive.
  store_gate: RwLock<()>,
}

impl ChannelManager {
  /// Recover and start every channel. Returns the manager and the merged id
  /// analysis across channels.
  pub fn start(
    config: Arc<StorageConfig>,
    connector: Arc<dyn BlobConnector>,
    dictionary: Arc<TypeDictionary>,
  ) -> Result<(ChannelManager, IdAnalysis)> {
    let monitor = Arc::new(MarkMonitor::new(config.channel_count));
    let mut channels = Vec::with_capacity(config.channel_count);
    let mut analysis = IdAnalysis::default();
    for index in 0..config.channel_count {
      let started = StorageChannel::start(
        index,
        config.clone(),
        connector.clone(),
        dictionary.clone(),
        monitor.clone(),
      );
      match started {
        Ok((channel, channel_analysis)) => {
          analysis.merge(channel_analysis);
          channels.push(channel);
        }
        Err(err) => {
          for channel in &channels {
            let _ = channel.stop();
          }
          return Err(err);
        }
      }
    }
    let distributor = EntityDistributor::new(
      config.distribution_strategy,
      config.channel_count,
      config.channel_weights.clone(),
    );
    Ok((
      ChannelManager {
        config,
        monitor,
        distributor,
        channels,
        store_gate: RwLock::new(()),
      },
      analysis,
    ))
  }

  pub fn channel_count(&self) -> usize {
    self.channels.len()
  }

  pub fn monitor(&self) -> &Arc<MarkMonitor> {
    &self.monitor
  }

  /// Current entity count per channel, as published by the workers.
  pub fn entity_loads(&self) -> Vec<u64> {
    self
      .channels
      .iter()
      .map(|channel| channel.shared().entity_count())
      .collect()
  }

  /// Strategy-chosen target channel for the next new entity of `tid`.
  /// `None` means plain monotonic id issuance.
  pub fn choose_channel(&self, tid: Tid) -> Option<usize> {
    self.distributor.target_channel(tid, &self.entity_loads())
  }

  // ==========================================================================
  // Stores and loads
  // ==========================================================================

  /// Scatter a batch of chunks to their owning channels and wait for every
  /// append to be acknowledged. Returns the number of entities stored.
  pub fn store(&self, timestamp: Timestamp, chunks: Vec<EntityChunk>) -> Result<u64> {
    if chunks.is_empty() {
      return Ok(0);
    }
    let _gate = self.store_gate.read();

    let mut grouped: HashMap<usize, Vec<EntityChunk>> = HashMap::new();
    for chunk in chunks {
      let owner = channel_for_oid(chunk.oid, self.channels.len());
      grouped.entry(owner).or_default().push(chunk);
    }

    let mut pending = Vec::new();
    for (owner, group) in grouped {
      let (reply, wait) = bounded(1);
      self.monitor.pending_store_begin(owner);
      if let Err(err) = self.channels[owner].send(ChannelCommand::Store {
        timestamp,
        chunks: group,
        reply,
      }) {
        self.monitor.pending_store_end(owner);
        return Err(err);
      }
      pending.push(wait);
    }

    let mut stored = 0u64;
    let mut first_error = None;
    for wait in pending {
      match Self::receive(wait) {
        Ok(positions) => stored += positions.len() as u64,
        Err(err) => first_error = first_error.or(Some(err)),
      }
    }
    match first_error {
      Some(err) => Err(err),
      None => Ok(stored),
    }
  }

  pub fn load_by_oids(&self, oids: &[Oid]) -> Result<Vec<StoredEntity>> {
    let mut grouped: HashMap<usize, Vec<Oid>> = HashMap::new();
    for &oid in oids {
      let owner = channel_for_oid(oid, self.channels.len());
      grouped.entry(owner).or_default().push(oid);
    }
    let mut pending = Vec::new();
    for (owner, group) in grouped {
      let (reply, wait) = bounded(1);
      self.channels[owner].send(ChannelCommand::LoadByOids { oids: group, reply })?;
      pending.push(wait);
    }
    let mut entities = Vec::new();
    for wait in pending {
      entities.extend(Self::receive(wait)?);
    }
    entities.sort_by_key(|entity| entity.oid);
    Ok(entities)
  }

  pub fn load_by_tids(&self, tids: &[Tid]) -> Result<Vec<StoredEntity>> {
    let mut pending = Vec::new();
    for channel in &self.channels {
      let (reply, wait) = bounded(1);
      channel.send(ChannelCommand::LoadByTids {
        tids: tids.to_vec(),
        reply,
      })?;
      pending.push(wait);
    }
    let mut entities = Vec::new();
    for wait in pending {
      entities.extend(Self::receive(wait)?);
    }
    entities.sort_by_key(|entity| entity.oid);
    Ok(entities)
  }

  /// The persisted root registry entity, if any.
  pub fn load_roots(&self) -> Result<Vec<StoredEntity>> {
    let owner = channel_for_oid(OID_ROOT_REGISTRY, self.channels.len());
    let (reply, wait) = bounded(1);
    self.channels[owner].send(ChannelCommand::LoadRoots { reply })?;
    Self::receive(wait)
  }

  // ==========================================================================
  // Garbage collection
  // ==========================================================================

  /// Open a mark cycle and seed the root frontier, if none is running.
  fn ensure_mark_cycle(&self) {
    if self.monitor.begin_cycle().is_some() {
      let owner = channel_for_oid(OID_ROOT_REGISTRY, self.channels.len());
      self.monitor.enqueue(owner, OID_ROOT_REGISTRY);
    }
  }

  /// One budgeted GC round across all channels. Returns true when the
  /// collective cycle finished within this round.
  pub fn issue_gc(&self, budget_ns: u64) -> Result<bool> {
    self.ensure_mark_cycle();
    let slice = per_channel_budget(budget_ns, self.channels.len());
    let mut pending = Vec::new();
    for channel in &self.channels {
      let (reply, wait) = bounded(1);
      channel.send(ChannelCommand::IncrementalGc {
        budget_ns: slice,
        reply,
      })?;
      pending.push(wait);
    }
    let mut first_error = None;
    for wait in pending {
      if let Err(err) = Self::receive(wait) {
        first_error = first_error.or(Some(err));
      }
    }
    if let Some(err) = first_error {
      return Err(err);
    }
    Ok(self.monitor.phase() == GcPhase::Idle)
  }

  /// Run a complete GC cycle, blocking stores for its duration.
  pub fn issue_full_gc(&self) -> Result<()> {
    let _gate = self.store_gate.write();
    while !self.issue_gc(BUDGET_UNBOUNDED_NS)? {}
    Ok(())
  }

  /// Mark to completion, report every unreachable OID, and abandon the
  /// cycle without sweeping.
  pub fn find_orphaned_entities(&self) -> Result<Vec<Oid>> {
    let _gate = self.store_gate.write();
    // Finish any cycle already in flight first.
    while self.monitor.phase() != GcPhase::Idle {
      self.issue_gc(BUDGET_UNBOUNDED_NS)?;
    }

    // Keep concurrent housekeeping rounds from sweeping the colors this
    // scan is about to read.
    self.monitor.suppress_sweep(true);
    let result = self.scan_orphans();
    self.monitor.abort_cycle();
    self.monitor.suppress_sweep(false);
    result
  }

  fn scan_orphans(&self) -> Result<Vec<Oid>> {
    self.ensure_mark_cycle();
    loop {
      let mut pending = Vec::new();
      for channel in &self.channels {
        let (reply, wait) = bounded(1);
        channel.send(ChannelCommand::IncrementalMark {
          budget_ns: BUDGET_UNBOUNDED_NS,
          reply,
        })?;
        pending.push(wait);
      }
      let mut complete = true;
      for wait in pending {
        complete &= Self::receive(wait)?;
      }
      if complete {
        break;
      }
    }

    let mut orphans = Vec::new();
    for channel in &self.channels {
      let (reply, wait) = bounded(1);
      channel.send(ChannelCommand::CollectWhite { reply })?;
      orphans.extend(Self::receive(wait)?);
    }
    orphans.sort_unstable();
    Ok(orphans)
  }

  // ==========================================================================
  // File and cache checks
  // ==========================================================================

  pub fn issue_file_check(&self, budget_ns: u64) -> Result<bool> {
    let slice = per_channel_budget(budget_ns, self.channels.len());
    self.fan_out_check(|reply| ChannelCommand::IncrementalFileCleanup {
      budget_ns: slice,
      reply,
    })
  }

  pub fn issue_full_file_check(&self) -> Result<()> {
    let _gate = self.store_gate.write();
    while !self.fan_out_check(|reply| ChannelCommand::IncrementalFileCleanup {
      budget_ns: BUDGET_UNBOUNDED_NS,
      reply,
    })? {}
    Ok(())
  }

  pub fn issue_cache_check(&self, budget_ns: u64) -> Result<bool> {
    let slice = per_channel_budget(budget_ns, self.channels.len());
    self.fan_out_check(|reply| ChannelCommand::IncrementalCacheCheck {
      budget_ns: slice,
      reply,
    })
  }

  pub fn issue_full_cache_check(&self) -> Result<()> {
    let _gate = self.store_gate.write();
    while !self.fan_out_check(|reply| ChannelCommand::IncrementalCacheCheck {
      budget_ns: BUDGET_UNBOUNDED_NS,
      reply,
    })? {}
    Ok(())
  }

  fn fan_out_check(
    &self,
    build: impl Fn(crossbeam_channel::Sender<Result<bool>>) -> ChannelCommand,
  ) -> Result<bool> {
    let mut pending = Vec::new();
    for channel in &self.channels {
      let (reply, wait) = bounded(1);
      channel.send(build(reply))?;
      pending.push(wait);
    }
    let mut done = true;
    for wait in pending {
      done &= Self::receive(wait)?;
    }
    Ok(done)
  }

  // ==========================================================================
  // Housekeeping
  // ==========================================================================

  /// One housekeeping round: the budget splits equally across channels, and
  /// each channel spends a third of its slice on GC, file cleanup, and
  /// cache eviction respectively. A channel in the error state is skipped.
  pub fn issue_housekeeping(&self, total_budget_ns: u64) -> Result<bool> {
    self.ensure_mark_cycle();
    let slice = per_channel_budget(total_budget_ns, self.channels.len());
    let op_budget = (slice / 3).max(1);

    let mut pending: Vec<Receiver<Result<bool>>> = Vec::new();
    for channel in &self.channels {
      let (reply, wait) = bounded(1);
      channel.send(ChannelCommand::IncrementalGc {
        budget_ns: op_budget,
        reply,
      })?;
      pending.push(wait);

      let (reply, wait) = bounded(1);
      channel.send(ChannelCommand::IncrementalFileCleanup {
        budget_ns: op_budget,
        reply,
      })?;
      pending.push(wait);

      let (reply, wait) = bounded(1);
      channel.send(ChannelCommand::IncrementalCacheCheck {
        budget_ns: op_budget,
        reply,
      })?;
      pending.push(wait);
    }

    let mut all_done = true;
    for wait in pending {
      match Self::receive(wait) {
        Ok(done) => all_done &= done,
        Err(LoamError::ChannelFailed(index)) => {
          warn!(channel = index, "housekeeping skipped failed channel");
          all_done = false;
        }
        Err(err) => return Err(err),
      }
    }
    Ok(all_done)
  }

  // ==========================================================================
  // Statistics, export, shutdown
  // ==========================================================================

  pub fn statistics(&self) -> Result<Vec<ChannelStatistics>> {
    let mut pending = Vec::new();
    for channel in &self.channels {
      let (reply, wait) = bounded(1);
      channel.send(ChannelCommand::Statistics { reply })?;
      pending.push(wait);
    }
    let mut stats = Vec::new();
    for wait in pending {
      stats.push(Self::receive(wait)?);
    }
    stats.sort_by_key(|s| s.channel_index);
    Ok(stats)
  }

  /// Copy every channel's file set under `target`, one subdirectory per
  /// channel. Stores are blocked while the copy runs.
  pub fn export_all(&self, target: &BlobPath) -> Result<Vec<String>> {
    let _gate = self.store_gate.write();
    let mut pending = Vec::new();
    for channel in &self.channels {
      let (reply, wait) = bounded(1);
      let directory = target.child(self.config.channel_directory_name(channel.index()));
      channel.send(ChannelCommand::ExportData {
        target: directory,
        reply,
      })?;
      pending.push(wait);
    }
    let mut copied = Vec::new();
    for wait in pending {
      copied.extend(Self::receive(wait)?);
    }
    Ok(copied)
  }

  /// Import channel file sets exported by [`export_all`](Self::export_all).
  /// Channels must be empty.
  pub fn import_all(&self, source: &BlobPath) -> Result<u64> {
    let _gate = self.store_gate.write();
    let mut pending = Vec::new();
    for channel in &self.channels {
      let (reply, wait) = bounded(1);
      let directory = source.child(self.config.channel_directory_name(channel.index()));
      channel.send(ChannelCommand::ImportData {
        source: directory,
        reply,
      })?;
      pending.push(wait);
    }
    let mut imported = 0u64;
    for wait in pending {
      imported += Self::receive(wait)?;
    }
    Ok(imported)
  }

  /// Drain and stop every channel worker.
  pub fn shutdown(&self) -> Result<()> {
    let mut first_error = None;
    for channel in &self.channels {
      if let Err(err) = channel.stop() {
        first_error = first_error.or(Some(err));
      }
    }
    match first_error {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }

  fn receive<T>(wait: Receiver<Result<T>>) -> Result<T> {
    wait.recv().map_err(|_| LoamError::ShuttingDown)?
  }
}

fn per_channel_budget(total_ns: u64, channel_count: usize) -> u64 {
  if total_ns == BUDGET_UNBOUNDED_NS {
    BUDGET_UNBOUNDED_NS
  } else {
    (total_ns / channel_count as u64).max(1)
  }
}
