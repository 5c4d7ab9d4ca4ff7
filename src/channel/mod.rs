//! Storage channels: one worker thread per partition.
//!
//! A channel owns its entity cache, data files, transaction log, and GC
//! state outright. All access funnels through a FIFO command queue processed
//! one command at a time, so the worker never takes a lock on its own state.
//! Consistency failures put the channel into the terminal error state;
//! commands are then rejected until operator restart.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{error, info};

use crate::blob::{BlobConnector, BlobPath};
use crate::config::StorageConfig;
use crate::core::cache::{DefaultCacheEvaluator, EntityCache};
use crate::core::data_files::DataFileManager;
use crate::core::recovery;
use crate::dict::TypeDictionary;
use crate::error::{LoamError, Result};
use crate::gc::{ChannelGc, MarkMonitor};
use crate::metrics::ChannelStatistics;
use crate::types::{
  now_ms, ChannelState, EntityChunk, GcColor, IdAnalysis, Oid, StoragePosition, StoredEntity,
  Tid, Timestamp,
};

pub mod distribution;
pub mod manager;

pub use manager::ChannelManager;

const COMMAND_QUEUE_CAPACITY: usize = 128;

/// Convert a nanosecond budget into an absolute deadline, saturating on the
/// unbounded sentinel.
pub(crate) fn deadline_from_budget(budget_ns: u64) -> Instant {
  Instant::now()
    .checked_add(Duration::from_nanos(budget_ns))
    .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600 * 24 * 365))
}

// ============================================================================
// Commands
// ============================================================================

pub enum ChannelCommand {
  Store {
    timestamp: Timestamp,
    chunks: Vec<EntityChunk>,
    reply: Sender<Result<Vec<StoragePosition>>>,
  },
  LoadByOids {
    oids: Vec<Oid>,
    reply: Sender<Result<Vec<StoredEntity>>>,
  },
  LoadByTids {
    tids: Vec<Tid>,
    reply: Sender<Result<Vec<StoredEntity>>>,
  },
  LoadRoots {
    reply: Sender<Result<Vec<StoredEntity>>>,
  },
  IncrementalGc {
    budget_ns: u64,
    reply: Sender<Result<bool>>,
  },
  /// Mark-only step, used by the orphan scan.
  IncrementalMark {
    budget_ns: u64,
    reply: Sender<Result<bool>>,
  },
  IncrementalFileCleanup {
    budget_ns: u64,
    reply: Sender<Result<bool>>,
  },
  IncrementalCacheCheck {
    budget_ns: u64,
    reply: Sender<Result<bool>>,
  },
  CollectWhite {
    reply: Sender<Result<Vec<Oid>>>,
  },
  ExportData {
    target: BlobPath,
    reply: Sender<Result<Vec<String>>>,
  },
  ImportData {
    source: BlobPath,
    reply: Sender<Result<u64>>,
  },
  Statistics {
    reply: Sender<Result<ChannelStatistics>>,
  },
  Shutdown {
    reply: Sender<Result<()>>,
  },
}

// ============================================================================
// Shared channel state
// ============================================================================

/// State published by the worker for lock-free observation.
pub struct ChannelShared {
  state: AtomicU8,
  entity_count: AtomicU64,
  cached_bytes: AtomicU64,
}

impl ChannelShared {
  fn new() -> Self {
    Self {
      state: AtomicU8::new(ChannelState::Stopped.as_u8()),
      entity_count: AtomicU64::new(0),
      cached_bytes: AtomicU64::new(0),
    }
  }

  pub fn state(&self) -> ChannelState {
    ChannelState::from_u8(self.state.load(Ordering::SeqCst))
  }

  fn set_state(&self, state: ChannelState) {
    self.state.store(state.as_u8(), Ordering::SeqCst);
  }

  pub fn entity_count(&self) -> u64 {
    self.entity_count.load(Ordering::Relaxed)
  }

  pub fn cached_bytes(&self) -> u64 {
    self.cached_bytes.load(Ordering::Relaxed)
  }
}

// ============================================================================
// Channel handle
// ============================================================================

/// Handle to a running channel worker, held by the channel manager.
pub struct StorageChannel {
  index: usize,
  sender: Sender<ChannelCommand>,
  shared: Arc<ChannelShared>,
  join: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl StorageChannel {
  /// Recover the channel from disk on the calling thread, then spawn its
  /// worker. Returns the handle and the ids observed during recovery.
  pub fn start(
    index: usize,
    config: Arc<StorageConfig>,
    connector: Arc<dyn BlobConnector>,
    dictionary: Arc<TypeDictionary>,
    monitor: Arc<MarkMonitor>,
  ) -> Result<(StorageChannel, IdAnalysis)> {
    let shared = Arc::new(ChannelShared::new());
    shared.set_state(ChannelState::Starting);

    let mut files = DataFileManager::open(index, config.clone(), connector)?;
    let mut cache = EntityCache::new(index, config.channel_count);
    let analysis = match recovery::initialize(&mut files, &mut cache, &dictionary, now_ms(), 0) {
      Ok(analysis) => analysis,
      Err(err) => {
        shared.set_state(ChannelState::Error);
        return Err(err);
      }
    };
    files.ensure_head(now_ms())?;

    let (sender, receiver) = bounded(COMMAND_QUEUE_CAPACITY);
    let worker = ChannelWorker {
      index,
      channel_count: config.channel_count,
      cache,
      files,
      gc: ChannelGc::new(index, config.channel_count, monitor.clone()),
      dictionary,
      evaluator: DefaultCacheEvaluator {
        timeout_ms: config.entity_cache_timeout_ms,
        threshold: config.entity_cache_threshold,
      },
      monitor,
      shared: shared.clone(),
      receiver,
      config,
    };
    let join = std::thread::Builder::new()
      .name(format!("loamdb-channel-{index}"))
      .spawn(move || worker.run())
      .map_err(|e| LoamError::Initialization(format!("failed to spawn channel worker: {e}")))?;

    Ok((
      StorageChannel {
        index,
        sender,
        shared,
        join: parking_lot::Mutex::new(Some(join)),
      },
      analysis,
    ))
  }

  pub fn index(&self) -> usize {
    self.index
  }

  pub fn shared(&self) -> &Arc<ChannelShared> {
    &self.shared
  }

  pub fn state(&self) -> ChannelState {
    self.shared.state()
  }

  /// Enqueue a command. Fails once the worker is gone.
  pub fn send(&self, command: ChannelCommand) -> Result<()> {
    self
      .sender
      .send(command)
      .map_err(|_| LoamError::ShuttingDown)
  }

  /// Stop the worker and join its thread.
  pub fn stop(&self) -> Result<()> {
    let (reply, wait) = bounded(1);
    if self.sender.send(ChannelCommand::Shutdown { reply }).is_ok() {
      let _ = wait.recv();
    }
    if let Some(join) = self.join.lock().take() {
      join
        .join()
        .map_err(|_| LoamError::Consistency(format!("channel {} worker panicked", self.index)))?;
    }
    Ok(())
  }
}

// ============================================================================
// Worker
// ============================================================================

struct ChannelWorker {
  index: usize,
  channel_count: usize,
  cache: EntityCache,
  files: DataFileManager,
  gc: ChannelGc,
  dictionary: Arc<TypeDictionary>,
  evaluator: DefaultCacheEvaluator,
  monitor: Arc<MarkMonitor>,
  shared: Arc<ChannelShared>,
  receiver: Receiver<ChannelCommand>,
  config: Arc<StorageConfig>,
}

impl ChannelWorker {
  fn run(mut self) {
    self.shared.set_state(ChannelState::Running);
    self.publish();
    info!(channel = self.index, "channel worker running");

    while let Ok(command) = self.receiver.recv() {
      if let ChannelCommand::Shutdown { reply } = command {
        self.shared.set_state(ChannelState::Stopping);
        let _ = reply.send(Ok(()));
        break;
      }
      if self.shared.state() == ChannelState::Error {
        self.reject(command, LoamError::ChannelFailed(self.index));
        continue;
      }
      self.dispatch(command);
      self.publish();
    }

    // Reject whatever is still queued instead of silently dropping it.
    while let Ok(command) = self.receiver.try_recv() {
      self.reject(command, LoamError::ShuttingDown);
    }
    if self.shared.state() != ChannelState::Error {
      self.shared.set_state(ChannelState::Stopped);
    }
    info!(channel = self.index, "channel worker stopped");
  }

  fn publish(&self) {
    self
      .shared
      .entity_count
      .store(self.cache.entity_count(), Ordering::Relaxed);
    self
      .shared
      .cached_bytes
      .store(self.cache.cached_bytes(), Ordering::Relaxed);
  }

  /// Consistency-class failures are terminal for the channel.
  fn is_fatal(error: &LoamError) -> bool {
    matches!(
      error,
      LoamError::Consistency(_)
        | LoamError::Integrity(_)
        | LoamError::InvalidEntityLength { .. }
        | LoamError::TypeHandlerConsistency(_)
    )
  }

  fn note_failure(&mut self, error: &LoamError) {
    if Self::is_fatal(error) {
      error!(channel = self.index, %error, "channel entering error state");
      self.shared.set_state(ChannelState::Error);
      self.monitor.abort_cycle();
    }
  }

  fn dispatch(&mut self, command: ChannelCommand) {
    match command {
      ChannelCommand::Store {
        timestamp,
        chunks,
        reply,
      } => {
        let result = self.handle_store(timestamp, chunks);
        self.monitor.pending_store_end(self.index);
        if let Err(ref err) = result {
          self.note_failure(err);
        }
        // Publish counts before acknowledging so a follow-up allocation
        // sees this store reflected in the channel loads.
        self.publish();
        let _ = reply.send(result);
      }
      ChannelCommand::LoadByOids { oids, reply } => {
        let result = self.handle_load_by_oids(&oids);
        if let Err(ref err) = result {
          self.note_failure(err);
        }
        let _ = reply.send(result);
      }
      ChannelCommand::LoadByTids { tids, reply } => {
        let result = self.handle_load_by_tids(&tids);
        if let Err(ref err) = result {
          self.note_failure(err);
        }
        let _ = reply.send(result);
      }
      ChannelCommand::LoadRoots { reply } => {
        let result = self.handle_load_by_oids(&[crate::constants::OID_ROOT_REGISTRY]);
        let _ = reply.send(result);
      }
      ChannelCommand::IncrementalGc { budget_ns, reply } => {
        let deadline = deadline_from_budget(budget_ns);
        let result = self
          .gc
          .incremental_gc(&mut self.cache, &mut self.files, &self.dictionary, deadline);
        if let Err(ref err) = result {
          self.note_failure(err);
        }
        let _ = reply.send(result);
      }
      ChannelCommand::IncrementalMark { budget_ns, reply } => {
        let deadline = deadline_from_budget(budget_ns);
        let result = self
          .gc
          .incremental_mark(&mut self.cache, &mut self.files, &self.dictionary, deadline);
        if let Err(ref err) = result {
          self.note_failure(err);
        }
        let _ = reply.send(result);
      }
      ChannelCommand::IncrementalFileCleanup { budget_ns, reply } => {
        let deadline = deadline_from_budget(budget_ns);
        let result = self
          .files
          .incremental_file_cleanup(&mut self.cache, deadline, now_ms());
        if let Err(ref err) = result {
          self.note_failure(err);
        }
        let _ = reply.send(result);
      }
      ChannelCommand::IncrementalCacheCheck { budget_ns, reply } => {
        let deadline = deadline_from_budget(budget_ns);
        let done = self
          .cache
          .incremental_cache_check(deadline, &self.evaluator, now_ms());
        let _ = reply.send(Ok(done));
      }
      ChannelCommand::CollectWhite { reply } => {
        let _ = reply.send(Ok(self.gc.collect_white(&self.cache)));
      }
      ChannelCommand::ExportData { target, reply } => {
        let result = self.handle_export(&target);
        let _ = reply.send(result);
      }
      ChannelCommand::ImportData { source, reply } => {
        let result = self.handle_import(&source);
        if let Err(ref err) = result {
          self.note_failure(err);
        }
        let _ = reply.send(result);
      }
      ChannelCommand::Statistics { reply } => {
        let _ = reply.send(Ok(self.statistics()));
      }
      ChannelCommand::Shutdown { .. } => unreachable!("handled by the run loop"),
    }
  }

  /// Send an error back without executing the command.
  fn reject(&self, command: ChannelCommand, error: LoamError) {
    match command {
      ChannelCommand::Store { reply, .. } => {
        // The manager signalled a pending store before enqueueing; balance
        // it so the barrier cannot wedge the mark monitor.
        self.monitor.pending_store_end(self.index);
        let _ = reply.send(Err(error));
      }
      ChannelCommand::LoadByOids { reply, .. }
      | ChannelCommand::LoadByTids { reply, .. }
      | ChannelCommand::LoadRoots { reply } => {
        let _ = reply.send(Err(error));
      }
      ChannelCommand::IncrementalGc { reply, .. }
      | ChannelCommand::IncrementalMark { reply, .. }
      | ChannelCommand::IncrementalFileCleanup { reply, .. }
      | ChannelCommand::IncrementalCacheCheck { reply, .. } => {
        let _ = reply.send(Err(error));
      }
      ChannelCommand::CollectWhite { reply } => {
        let _ = reply.send(Err(error));
      }
      ChannelCommand::ExportData { reply, .. } => {
        let _ = reply.send(Err(error));
      }
      ChannelCommand::ImportData { reply, .. } => {
        let _ = reply.send(Err(error));
      }
      ChannelCommand::Statistics { reply } => {
        let _ = reply.send(Err(error));
      }
      ChannelCommand::Shutdown { reply } => {
        let _ = reply.send(Err(error));
      }
    }
  }

  // ==========================================================================
  // Store
  // ==========================================================================

  fn handle_store(
    &mut self,
    timestamp: Timestamp,
    chunks: Vec<EntityChunk>,
  ) -> Result<Vec<StoragePosition>> {
    // Validate before touching disk; a bad chunk must not leave bytes behind.
    for chunk in &chunks {
      self
        .dictionary
        .validate_entity(chunk.record_length(), chunk.tid, chunk.oid)?;
    }
    self.gc.prepare_for_store(&mut self.cache);

    let positions = self.files.store_chunks(timestamp, &chunks)?;
    for (chunk, position) in chunks.into_iter().zip(positions.iter()) {
      let length = chunk.record_length();
      let index = self.cache.put(chunk.oid, chunk.tid, timestamp)?;
      self.files.assign_position(&mut self.cache, index, *position, length);
      if self.cache.slot(index).payload.is_some() {
        self.cache.clear_payload(index);
      }
      self.cache.install_payload(index, chunk.payload, timestamp);
      // Stored entities enter any running mark cycle as reachable.
      self.cache.slot_mut(index).color = GcColor::Black;
    }
    Ok(positions)
  }

  // ==========================================================================
  // Load
  // ==========================================================================

  fn handle_load_by_oids(&mut self, oids: &[Oid]) -> Result<Vec<StoredEntity>> {
    let mut out = Vec::new();
    for &oid in oids {
      if distribution::channel_for_oid(oid, self.channel_count) != self.index {
        continue;
      }
      let Some(index) = self.cache.lookup(oid) else {
        continue;
      };
      self.ensure_payload(index)?;
      let slot = self.cache.slot(index);
      out.push(StoredEntity {
        oid: slot.oid,
        tid: slot.tid,
        payload: slot.payload.clone().expect("payload just loaded"),
      });
    }
    Ok(out)
  }

  fn handle_load_by_tids(&mut self, tids: &[Tid]) -> Result<Vec<StoredEntity>> {
    let mut out = Vec::new();
    for &tid in tids {
      for index in self.cache.entities_of_type(tid) {
        self.ensure_payload(index)?;
        let slot = self.cache.slot(index);
        out.push(StoredEntity {
          oid: slot.oid,
          tid: slot.tid,
          payload: slot.payload.clone().expect("payload just loaded"),
        });
      }
    }
    Ok(out)
  }

  fn ensure_payload(&mut self, index: u32) -> Result<()> {
    if self.cache.slot(index).payload.is_some() {
      self.cache.touch(index, now_ms());
      return Ok(());
    }
    let payload = self.files.read_payload(&self.cache, index)?;
    self.cache.install_payload(index, payload, now_ms());
    Ok(())
  }

  // ==========================================================================
  // Export / import
  // ==========================================================================

  fn handle_export(&mut self, target: &BlobPath) -> Result<Vec<String>> {
    let connector = self.files.connector();
    connector.create_directory(target)?;
    let mut copied = Vec::new();

    for number in self.files.file_numbers() {
      let source = self.files.data_file_path(number);
      copy_blob(connector, &source, &target.child(source.name().to_string()))?;
      copied.push(source.name().to_string());
    }
    let log_path = self.files.log().path().clone();
    copy_blob(connector, &log_path, &target.child(log_path.name().to_string()))?;
    copied.push(log_path.name().to_string());
    Ok(copied)
  }

  fn handle_import(&mut self, source: &BlobPath) -> Result<u64> {
    if self.cache.entity_count() > 0 {
      return Err(LoamError::Consistency(format!(
        "channel {} import requires an empty channel",
        self.index
      )));
    }
    let connector = self.files.connector();
    let directory = self.files.directory().clone();
    for name in connector.list_children(source)? {
      copy_blob(connector, &source.child(name.clone()), &directory.child(name))?;
    }

    // Rebuild the channel from the imported files.
    let connector = self.connector_arc();
    self.files = DataFileManager::open(self.index, self.config.clone(), connector)?;
    self.cache = EntityCache::new(self.index, self.channel_count);
    let analysis = recovery::initialize(
      &mut self.files,
      &mut self.cache,
      &self.dictionary,
      now_ms(),
      0,
    )?;
    self.files.ensure_head(now_ms())?;
    Ok(analysis.entity_count)
  }

  fn connector_arc(&self) -> Arc<dyn BlobConnector> {
    self.files.connector_arc()
  }

  // ==========================================================================
  // Statistics
  // ==========================================================================

  fn statistics(&self) -> ChannelStatistics {
    let gc = self.gc.stats();
    ChannelStatistics {
      channel_index: self.index,
      state: self.shared.state(),
      entity_count: self.cache.entity_count(),
      cached_bytes: self.cache.cached_bytes(),
      data_file_count: self.files.file_count() as u64,
      total_bytes: self.files.total_bytes(),
      live_bytes: self.files.live_bytes(),
      head_file_number: self.files.head_number(),
      transaction_log_bytes: self.files.log().length(),
      gc_cycles_completed: gc.cycles_completed,
      gc_entities_swept: gc.entities_swept_total,
      gc_bytes_reclaimed: gc.bytes_reclaimed_total,
    }
  }
}

/// Whole-file copy through the connector.
fn copy_blob(connector: &dyn BlobConnector, from: &BlobPath, to: &BlobPath) -> Result<()> {
  let bytes = connector.read_all(from)?;
  if connector.file_exists(to)? {
    connector.truncate(to, 0)?;
  } else {
    connector.create_file(to)?;
  }
  connector.append(to, &bytes)?;
  Ok(())
}
