//! Per-channel data file management.
//!
//! Each channel owns a chain of append-only data files with exactly one
//! "head" open for appending. Stores append to the head and roll it over at
//! the size limit; cleanup evacuates still-live records out of underused
//! files and deletes them wholesale.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::blob::{BlobConnector, BlobPath};
use crate::config::StorageConfig;
use crate::error::{LoamError, Result};
use crate::types::{
  encode_record_header, EntityChunk, FileNumber, StoragePosition, Timestamp,
};

use super::cache::EntityCache;
use super::entity::{ChainEnds, ChainKind, NIL};
use super::txlog::{LogEntry, TransactionLog};

/// One append-only data file and its live-byte accounting.
#[derive(Debug, Default)]
pub struct DataFile {
  pub number: FileNumber,
  /// Physical length in bytes.
  pub total_bytes: u64,
  /// Bytes occupied by records that are still current.
  pub live_bytes: u64,
  /// Entities whose current record lives in this file.
  pub chain: ChainEnds,
}

impl DataFile {
  fn new(number: FileNumber) -> Self {
    Self {
      number,
      ..Default::default()
    }
  }

  pub fn use_ratio(&self) -> f64 {
    if self.total_bytes == 0 {
      1.0
    } else {
      self.live_bytes as f64 / self.total_bytes as f64
    }
  }
}

pub struct DataFileManager {
  channel_index: usize,
  config: Arc<StorageConfig>,
  connector: Arc<dyn BlobConnector>,
  directory: BlobPath,
  files: BTreeMap<FileNumber, DataFile>,
  head: FileNumber,
  log: TransactionLog,
  /// File number the next cleanup pass resumes from; 0 restarts the scan.
  cleanup_cursor: FileNumber,
  /// Cleared after a failed append until operator intervention.
  head_writable: bool,
}

impl DataFileManager {
  /// Open the channel directory and transaction log. Does not scan files;
  /// recovery populates the manager afterwards.
  pub fn open(
    channel_index: usize,
    config: Arc<StorageConfig>,
    connector: Arc<dyn BlobConnector>,
  ) -> Result<DataFileManager> {
    let directory = BlobPath::container(config.channel_directory_name(channel_index));
    connector.create_directory(&directory)?;
    let log_path = directory.child(config.transaction_file_name(channel_index));
    let log = TransactionLog::open(
      connector.as_ref(),
      log_path,
      config.transaction_file_maximum_size,
    )?;
    Ok(DataFileManager {
      channel_index,
      config,
      connector,
      directory,
      files: BTreeMap::new(),
      head: 0,
      log,
      cleanup_cursor: 0,
      head_writable: true,
    })
  }

  pub fn channel_index(&self) -> usize {
    self.channel_index
  }

  pub fn directory(&self) -> &BlobPath {
    &self.directory
  }

  pub fn data_file_path(&self, number: FileNumber) -> BlobPath {
    self
      .directory
      .child(self.config.data_file_name(self.channel_index, number))
  }

  pub fn head_number(&self) -> FileNumber {
    self.head
  }

  pub fn file(&self, number: FileNumber) -> Option<&DataFile> {
    self.files.get(&number)
  }

  pub fn file_numbers(&self) -> Vec<FileNumber> {
    self.files.keys().copied().collect()
  }

  pub fn file_count(&self) -> usize {
    self.files.len()
  }

  pub fn total_bytes(&self) -> u64 {
    self.files.values().map(|f| f.total_bytes).sum()
  }

  pub fn live_bytes(&self) -> u64 {
    self.files.values().map(|f| f.live_bytes).sum()
  }

  pub fn log(&self) -> &TransactionLog {
    &self.log
  }

  /// Record a recovery truncation in the transaction log.
  pub(crate) fn append_truncate_repair(
    &mut self,
    timestamp: Timestamp,
    number: FileNumber,
    new_length: u64,
  ) -> Result<()> {
    let connector = self.connector.clone();
    self
      .log
      .append(connector.as_ref(), LogEntry::truncate(timestamp, number, new_length))
  }

  pub fn parse_data_file_name(&self, name: &str) -> Option<FileNumber> {
    self.config.parse_data_file_name(self.channel_index, name)
  }

  pub(crate) fn connector(&self) -> &dyn BlobConnector {
    self.connector.as_ref()
  }

  pub(crate) fn connector_arc(&self) -> Arc<dyn BlobConnector> {
    self.connector.clone()
  }

  /// Recovery hook: register a file that already exists on disk.
  pub(crate) fn adopt_file(&mut self, number: FileNumber, total_bytes: u64) {
    let mut file = DataFile::new(number);
    file.total_bytes = total_bytes;
    self.files.insert(number, file);
    self.head = self.head.max(number);
  }

  /// Ensure a head file exists; creates file 1 on a fresh channel.
  pub fn ensure_head(&mut self, timestamp: Timestamp) -> Result<()> {
    if self.files.is_empty() {
      self.create_file(1, timestamp)?;
      self.head = 1;
    }
    Ok(())
  }

  fn create_file(&mut self, number: FileNumber, timestamp: Timestamp) -> Result<()> {
    let path = self.data_file_path(number);
    self.connector.create_file(&path)?;
    self.log
      .append(self.connector.as_ref(), LogEntry::create(timestamp, number))?;
    self.files.insert(number, DataFile::new(number));
    Ok(())
  }

  fn roll_over(&mut self, timestamp: Timestamp) -> Result<()> {
    let next = self.head + 1;
    self.create_file(next, timestamp)?;
    debug!(
      channel = self.channel_index,
      file = next,
      "rolled over to new head data file"
    );
    self.head = next;
    Ok(())
  }

  // ==========================================================================
  // Store path
  // ==========================================================================

  /// Append the chunks to the head file as one write, rolling over first if
  /// they would push the head past its maximum size. Returns the starting
  /// position of every chunk, in input order, and records a store entry.
  pub fn store_chunks(
    &mut self,
    timestamp: Timestamp,
    chunks: &[EntityChunk],
  ) -> Result<Vec<StoragePosition>> {
    if chunks.is_empty() {
      return Ok(Vec::new());
    }
    if !self.head_writable {
      return Err(LoamError::Integrity(format!(
        "channel {} head file is unwritable after a failed append",
        self.channel_index
      )));
    }
    self.ensure_head(timestamp)?;

    let total: u64 = chunks.iter().map(|c| c.record_length()).sum();
    let head_total = self.files[&self.head].total_bytes;
    if head_total > 0 && head_total + total > self.config.data_file_maximum_size {
      self.roll_over(timestamp)?;
    }

    let mut buffer = Vec::with_capacity(total as usize);
    let base = self.files[&self.head].total_bytes;
    let mut positions = Vec::with_capacity(chunks.len());
    let mut running = base;
    for chunk in chunks {
      positions.push(StoragePosition {
        file_number: self.head,
        offset: running,
      });
      buffer.extend_from_slice(&encode_record_header(
        chunk.record_length(),
        chunk.tid,
        chunk.oid,
      ));
      buffer.extend_from_slice(&chunk.payload);
      running += chunk.record_length();
    }

    let path = self.data_file_path(self.head);
    match self.connector.append(&path, &buffer) {
      Ok(offset) => {
        if offset != base {
          return Err(LoamError::Integrity(format!(
            "append to {} landed at {} but {} was expected",
            path, offset, base
          )));
        }
      }
      Err(err) => {
        // Roll the partial write back; if even that fails the head stays
        // unwritable until operator intervention.
        if self.connector.truncate(&path, base).is_err() {
          self.head_writable = false;
        }
        warn!(
          channel = self.channel_index,
          file = self.head,
          "append failed, store rolled back"
        );
        return Err(err);
      }
    }

    self.log.append(
      self.connector.as_ref(),
      LogEntry::store(timestamp, self.head, base, total),
    )?;
    self.files.get_mut(&self.head).expect("head exists").total_bytes += total;
    Ok(positions)
  }

  /// Raw range read out of one data file.
  pub fn read_bytes(&self, file_number: FileNumber, offset: u64, length: u64) -> Result<Vec<u8>> {
    let file = self.files.get(&file_number).ok_or_else(|| {
      LoamError::NotFound(format!(
        "channel {} has no data file {}",
        self.channel_index, file_number
      ))
    })?;
    if offset + length > file.total_bytes {
      return Err(LoamError::Consistency(format!(
        "read of {}..{} exceeds data file {} length {}",
        offset,
        offset + length,
        file_number,
        file.total_bytes
      )));
    }
    self
      .connector
      .read_range(&self.data_file_path(file_number), offset, length)
  }

  /// Payload bytes (header excluded) for a cached entity.
  pub fn read_payload(&self, cache: &EntityCache, index: u32) -> Result<Vec<u8>> {
    let slot = cache.slot(index);
    let header = crate::constants::RECORD_HEADER_SIZE;
    self.read_bytes(
      slot.position.file_number,
      slot.position.offset + header,
      slot.length - header,
    )
  }

  // ==========================================================================
  // Live-byte accounting
  // ==========================================================================

  /// Bind an entity to its new on-disk record, moving it between file chains
  /// and keeping both files' live-byte counters current.
  pub fn assign_position(
    &mut self,
    cache: &mut EntityCache,
    index: u32,
    position: StoragePosition,
    length: u64,
  ) {
    let (old_position, old_length) = {
      let slot = cache.slot(index);
      (slot.position, slot.length)
    };
    if old_length > 0 {
      if let Some(old_file) = self.files.get_mut(&old_position.file_number) {
        old_file.live_bytes -= old_length;
        let mut chain = std::mem::take(&mut old_file.chain);
        cache.arena_mut().unlink(&mut chain, ChainKind::File, index);
        self
          .files
          .get_mut(&old_position.file_number)
          .expect("old file exists")
          .chain = chain;
      }
    }

    let file = self
      .files
      .get_mut(&position.file_number)
      .expect("target file exists");
    file.live_bytes += length;
    let mut chain = std::mem::take(&mut file.chain);
    cache.arena_mut().link_tail(&mut chain, ChainKind::File, index);
    self
      .files
      .get_mut(&position.file_number)
      .expect("target file exists")
      .chain = chain;

    let slot = cache.slot_mut(index);
    slot.position = position;
    slot.length = length;
  }

  /// Detach a swept entity from its file and release its live bytes.
  pub fn release_entity(&mut self, cache: &mut EntityCache, index: u32) {
    let (position, length) = {
      let slot = cache.slot(index);
      (slot.position, slot.length)
    };
    if length == 0 {
      return;
    }
    if let Some(file) = self.files.get_mut(&position.file_number) {
      file.live_bytes -= length;
      let mut chain = std::mem::take(&mut file.chain);
      cache.arena_mut().unlink(&mut chain, ChainKind::File, index);
      self
        .files
        .get_mut(&position.file_number)
        .expect("file exists")
        .chain = chain;
    }
  }

  // ==========================================================================
  // Incremental cleanup
  // ==========================================================================

  fn is_cleanup_candidate(&self, file: &DataFile) -> bool {
    if file.use_ratio() < self.config.minimum_use_ratio
      || file.total_bytes < self.config.data_file_minimum_size
    {
      return true;
    }
    // Oversized files are split up, except when a single oversized record is
    // all they hold; copying that record forward would never converge.
    file.total_bytes > self.config.data_file_maximum_size
      && (file.chain.head != file.chain.tail || file.live_bytes < file.total_bytes)
  }

  /// One bounded cleanup pass over non-head files. The cursor persists so
  /// repeated calls make progress; returns true once a full scan completed.
  pub fn incremental_file_cleanup(
    &mut self,
    cache: &mut EntityCache,
    deadline: Instant,
    timestamp: Timestamp,
  ) -> Result<bool> {
    loop {
      let candidate = self
        .files
        .range(self.cleanup_cursor.max(1)..)
        .map(|(&number, _)| number)
        .find(|&number| number != self.head || self.config.clean_up_head_file);

      let number = match candidate {
        Some(number) => number,
        None => {
          self.cleanup_cursor = 0;
          if self.log.exceeds_maximum() {
            self.compact_log(cache, timestamp)?;
          }
          return Ok(true);
        }
      };
      self.cleanup_cursor = number;

      let needs_cleanup = {
        let file = &self.files[&number];
        if number == self.head {
          // The head is always small while filling; only a poor use ratio
          // (or a pathological size) justifies rolling it for cleanup.
          file.use_ratio() < self.config.minimum_use_ratio
            || (file.total_bytes > self.config.data_file_maximum_size
              && file.chain.head != file.chain.tail)
        } else {
          self.is_cleanup_candidate(file)
        }
      };
      if !needs_cleanup {
        self.cleanup_cursor = number + 1;
        continue;
      }

      // Cleaning the head itself: first roll a fresh head so the candidate
      // becomes a normal, closed file.
      if number == self.head {
        self.roll_over(timestamp)?;
      }

      if !self.evacuate_file(cache, number, deadline, timestamp)? {
        return Ok(false);
      }
      self.cleanup_cursor = number + 1;

      if Instant::now() >= deadline {
        return Ok(false);
      }
    }
  }

  /// Copy every live record out of `number` into the head, then delete the
  /// file. Returns false when the deadline hit before the file was emptied.
  fn evacuate_file(
    &mut self,
    cache: &mut EntityCache,
    number: FileNumber,
    deadline: Instant,
    timestamp: Timestamp,
  ) -> Result<bool> {
    loop {
      let index = self.files[&number].chain.head;
      if index == NIL {
        break;
      }
      if Instant::now() >= deadline {
        return Ok(false);
      }

      let (position, length) = {
        let slot = cache.slot(index);
        (slot.position, slot.length)
      };
      let record = self.read_bytes(number, position.offset, length)?;

      // Transfers go through the head like any append, rolling it as needed.
      self.ensure_head(timestamp)?;
      let head_total = self.files[&self.head].total_bytes;
      if head_total > 0 && head_total + length > self.config.data_file_maximum_size {
        self.roll_over(timestamp)?;
      }
      let head_path = self.data_file_path(self.head);
      let offset = self.connector.append(&head_path, &record)?;
      self.log.append(
        self.connector.as_ref(),
        LogEntry::transfer(timestamp, self.head, offset, length),
      )?;
      self.files.get_mut(&self.head).expect("head exists").total_bytes += length;

      let new_position = StoragePosition {
        file_number: self.head,
        offset,
      };
      self.assign_position(cache, index, new_position, length);
    }

    let file = &self.files[&number];
    debug_assert_eq!(file.live_bytes, 0);
    debug!(
      channel = self.channel_index,
      file = number,
      reclaimed = file.total_bytes,
      "evacuated data file"
    );
    self.log
      .append(self.connector.as_ref(), LogEntry::delete(timestamp, number))?;
    self.connector.delete(&self.data_file_path(number))?;
    self.files.remove(&number);
    Ok(true)
  }

  /// Rewrite the transaction log as a condensed description of current state:
  /// one create per file, one store per live record.
  fn compact_log(&mut self, cache: &EntityCache, timestamp: Timestamp) -> Result<()> {
    let mut entries = Vec::new();
    for (&number, file) in &self.files {
      entries.push(LogEntry::create(timestamp, number));
      for index in cache.arena().chain_indices(&file.chain, ChainKind::File) {
        let slot = cache.slot(index);
        entries.push(LogEntry::store(
          timestamp,
          number,
          slot.position.offset,
          slot.length,
        ));
      }
    }
    debug!(
      channel = self.channel_index,
      entries = entries.len(),
      "compacted transaction log"
    );
    self.log.rewrite(self.connector.as_ref(), &entries)
  }
}
