//! Top-level storage lifecycle.
//!
//! Binds configuration, type dictionary, channel manager, housekeeping
//! scheduler, and root persistence into one handle. The storage directory is
//! locked exclusively for the lifetime of the manager, so a second process
//! cannot open the same store.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fs2::FileExt;
use parking_lot::Mutex;
use tracing::info;

use crate::backup;
use crate::blob::{BlobConnector, BlobPath, LocalFileConnector};
use crate::channel::ChannelManager;
use crate::config::StorageConfig;
use crate::constants::{
  LOCK_FILE, OID_ROOT_REGISTRY, TID_ROOT_REGISTRY, TYPES_DIRECTORY, TYPE_DICTIONARY_FILE,
};
use crate::dict::{decode_reference_list, encode_reference_list, TypeDictionary};
use crate::error::{LoamError, Result};
use crate::housekeeping::HousekeepingScheduler;
use crate::metrics::{HousekeepingStatistics, StorageStatistics};
use crate::oid::{OidAllocator, RootRegistry};
use crate::storer::Storer;
use crate::types::{EntityChunk, Oid, StoredEntity, Tid};

/// A flattened object graph: the designated root record plus every record
/// reachable from it, already serialized by the caller's serializer layer.
#[derive(Debug, Clone)]
pub struct ObjectGraph {
  /// Root record. An id of 0 asks the engine to allocate one.
  pub root: EntityChunk,
  pub referenced: Vec<EntityChunk>,
}

impl ObjectGraph {
  pub fn new(root: EntityChunk) -> Self {
    Self {
      root,
      referenced: Vec::new(),
    }
  }

  pub fn with_referenced(mut self, referenced: Vec<EntityChunk>) -> Self {
    self.referenced = referenced;
    self
  }
}

pub struct StorageManager {
  config: Arc<StorageConfig>,
  connector: Arc<dyn BlobConnector>,
  dictionary: Arc<TypeDictionary>,
  allocator: Arc<OidAllocator>,
  roots: Arc<RootRegistry>,
  manager: Arc<ChannelManager>,
  scheduler: Mutex<Option<HousekeepingScheduler>>,
  root_graph: Mutex<Option<ObjectGraph>>,
  running: AtomicBool,
  lock_file: Mutex<Option<std::fs::File>>,
}

impl StorageManager {
  /// Start a storage rooted at the configured directory with the local
  /// filesystem connector.
  pub fn start(config: StorageConfig) -> Result<StorageManager> {
    config.validate()?;
    std::fs::create_dir_all(&config.storage_directory).map_err(|e| {
      LoamError::Initialization(format!(
        "cannot create storage directory {}: {e}",
        config.storage_directory.display()
      ))
    })?;
    let lock = acquire_directory_lock(&config.storage_directory)?;
    let connector = Arc::new(LocalFileConnector::new(&config.storage_directory));
    Self::start_inner(config, connector, Some(lock))
  }

  /// Start against a caller-supplied connector (e.g. a remote object store).
  /// No directory lock is taken; exclusivity is the connector's concern.
  pub fn start_with_connector(
    config: StorageConfig,
    connector: Arc<dyn BlobConnector>,
  ) -> Result<StorageManager> {
    config.validate()?;
    Self::start_inner(config, connector, None)
  }

  fn start_inner(
    config: StorageConfig,
    connector: Arc<dyn BlobConnector>,
    lock: Option<std::fs::File>,
  ) -> Result<StorageManager> {
    let config = Arc::new(config);
    let dictionary_path = BlobPath::container(TYPES_DIRECTORY).child(TYPE_DICTIONARY_FILE);
    let dictionary = TypeDictionary::load(connector.as_ref(), &dictionary_path)?;
    dictionary.bind_persistence(connector.clone(), dictionary_path.clone());

    let (manager, analysis) =
      ChannelManager::start(config.clone(), connector.clone(), dictionary.clone())?;
    let manager = Arc::new(manager);

    let allocator = Arc::new(OidAllocator::new());
    allocator.bump_to(analysis.highest_oid);

    let roots = Arc::new(RootRegistry::new());
    if analysis.entity_count > 0 {
      if let Some(registry) = manager.load_roots()?.into_iter().next() {
        let persisted = decode_reference_list(registry.tid, &registry.payload)?;
        roots.restore(persisted);
      }
    }

    let scheduler = HousekeepingScheduler::start(config.clone(), manager.clone());

    info!(
      directory = %config.storage_directory.display(),
      channels = config.channel_count,
      entities = analysis.entity_count,
      "storage started"
    );
    Ok(StorageManager {
      config,
      connector,
      dictionary,
      allocator,
      roots,
      manager,
      scheduler: Mutex::new(Some(scheduler)),
      root_graph: Mutex::new(None),
      running: AtomicBool::new(true),
      lock_file: Mutex::new(lock),
    })
  }

  /// Stop housekeeping, drain every channel, and persist the dictionary.
  /// Returns true for a clean shutdown; false if it was already stopped or
  /// any step failed.
  pub fn shutdown(&self) -> bool {
    if !self.running.swap(false, Ordering::SeqCst) {
      return false;
    }
    if let Some(mut scheduler) = self.scheduler.lock().take() {
      scheduler.stop();
    }
    let dictionary_path = BlobPath::container(TYPES_DIRECTORY).child(TYPE_DICTIONARY_FILE);
    let dictionary_saved = self
      .dictionary
      .save(self.connector.as_ref(), &dictionary_path)
      .is_ok();
    let channels_stopped = self.manager.shutdown().is_ok();
    *self.lock_file.lock() = None;
    info!("storage stopped");
    dictionary_saved && channels_stopped
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::SeqCst)
  }

  fn ensure_running(&self) -> Result<()> {
    if self.is_running() {
      Ok(())
    } else {
      Err(LoamError::NotRunning)
    }
  }

  pub fn configuration(&self) -> &StorageConfig {
    &self.config
  }

  pub fn type_dictionary(&self) -> &Arc<TypeDictionary> {
    &self.dictionary
  }

  // ==========================================================================
  // Root handling
  // ==========================================================================

  /// Bind the object graph the next `store_root` persists. The root pointer
  /// is guarded here; channels never see partially assigned graphs.
  pub fn set_root(&self, graph: ObjectGraph) {
    *self.root_graph.lock() = Some(graph);
  }

  /// Persist the bound root graph together with the root registry entity.
  /// Returns the root's object id.
  pub fn store_root(&self) -> Result<Oid> {
    self.ensure_running()?;
    let mut guard = self.root_graph.lock();
    let graph = guard
      .as_mut()
      .ok_or_else(|| LoamError::NotFound("no root object graph is set".to_string()))?;

    let mut storer = self.create_storer();
    if graph.root.oid == 0 {
      graph.root.oid = storer.reserve(graph.root.tid);
    }
    let root_oid = graph.root.oid;

    storer.put_with_oid(
      OID_ROOT_REGISTRY,
      TID_ROOT_REGISTRY,
      encode_reference_list(&[root_oid]),
    );
    storer.put_with_oid(root_oid, graph.root.tid, graph.root.payload.clone());
    for chunk in &graph.referenced {
      storer.put_with_oid(chunk.oid, chunk.tid, chunk.payload.clone());
    }
    storer.commit()?;
    self.roots.set_user_root(root_oid);
    Ok(root_oid)
  }

  /// The persisted user root, loaded from its channel.
  pub fn root(&self) -> Result<Option<StoredEntity>> {
    self.ensure_running()?;
    let Some(oid) = self.roots.user_root() else {
      return Ok(None);
    };
    Ok(self.manager.load_by_oids(&[oid])?.into_iter().next())
  }

  pub fn root_oid(&self) -> Option<Oid> {
    self.roots.user_root()
  }

  // ==========================================================================
  // Stores and loads
  // ==========================================================================

  pub fn create_storer(&self) -> Storer {
    Storer::new(self.manager.clone(), self.allocator.clone())
  }

  pub fn load(&self, oids: &[Oid]) -> Result<Vec<StoredEntity>> {
    self.ensure_running()?;
    self.manager.load_by_oids(oids)
  }

  pub fn load_by_types(&self, tids: &[Tid]) -> Result<Vec<StoredEntity>> {
    self.ensure_running()?;
    self.manager.load_by_tids(tids)
  }

  // ==========================================================================
  // Housekeeping entry points
  // ==========================================================================

  /// Complete GC cycle; blocks stores while it runs.
  pub fn issue_full_gc(&self) -> Result<()> {
    self.ensure_running()?;
    self.manager.issue_full_gc()
  }

  /// One budgeted GC round. Returns true when the cycle completed within it.
  pub fn issue_gc(&self, budget_ns: u64) -> Result<bool> {
    self.ensure_running()?;
    self.manager.issue_gc(budget_ns)
  }

  pub fn issue_full_file_check(&self) -> Result<()> {
    self.ensure_running()?;
    self.manager.issue_full_file_check()
  }

  pub fn issue_file_check(&self, budget_ns: u64) -> Result<bool> {
    self.ensure_running()?;
    self.manager.issue_file_check(budget_ns)
  }

  pub fn issue_full_cache_check(&self) -> Result<()> {
    self.ensure_running()?;
    self.manager.issue_full_cache_check()
  }

  pub fn issue_cache_check(&self, budget_ns: u64) -> Result<bool> {
    self.ensure_running()?;
    self.manager.issue_cache_check(budget_ns)
  }

  /// OIDs unreachable from the root set, computed by a mark-only pass.
  pub fn find_orphaned_entities(&self) -> Result<Vec<Oid>> {
    self.ensure_running()?;
    self.manager.find_orphaned_entities()
  }

  // ==========================================================================
  // Backup and statistics
  // ==========================================================================

  /// Archive the whole storage into `target_dir`.
  pub fn create_backup(&self, target_dir: &Path) -> Result<PathBuf> {
    self.ensure_running()?;
    backup::create_backup(
      &self.manager,
      &self.dictionary,
      self.connector.as_ref(),
      target_dir,
    )
  }

  /// Archive into the configured backup directory, falling back to
  /// `<storage>/backup`.
  pub fn create_default_backup(&self) -> Result<PathBuf> {
    let target = self
      .config
      .backup_directory
      .clone()
      .unwrap_or_else(|| self.config.storage_directory.join(crate::constants::BACKUP_DIRECTORY));
    self.create_backup(&target)
  }

  pub fn statistics(&self) -> Result<StorageStatistics> {
    self.ensure_running()?;
    let channels = self.manager.statistics()?;
    let housekeeping = self
      .scheduler
      .lock()
      .as_ref()
      .map(|s| s.statistics())
      .unwrap_or_else(HousekeepingStatistics::default);
    Ok(StorageStatistics::aggregate(
      channels,
      self.manager.monitor().generation(),
      housekeeping,
    ))
  }
}

impl Drop for StorageManager {
  fn drop(&mut self) {
    if self.is_running() {
      self.shutdown();
    }
  }
}

fn acquire_directory_lock(directory: &Path) -> Result<std::fs::File> {
  let path = directory.join(LOCK_FILE);
  let file = OpenOptions::new()
    .read(true)
    .write(true)
    .create(true)
    .open(&path)
    .map_err(|e| LoamError::Initialization(format!("cannot open {}: {e}", path.display())))?;
  file.try_lock_exclusive().map_err(|_| {
    LoamError::Initialization(format!(
      "storage directory {} is locked by another process",
      directory.display()
    ))
  })?;
  Ok(file)
}
