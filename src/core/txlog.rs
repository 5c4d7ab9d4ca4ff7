//! Per-channel transaction log.
//!
//! An ordered, append-only sequence of fixed-size entries recording every
//! file create, store, transfer, delete, and truncate. The entry for a store
//! is written after the data bytes but before the store is acknowledged, so
//! on crash a data tail without a log entry is discarded during recovery.

use byteorder::{ByteOrder, LittleEndian};

use crate::blob::{BlobConnector, BlobPath};
use crate::constants::LOG_ENTRY_SIZE;
use crate::error::{LoamError, Result};
use crate::types::{FileNumber, Timestamp};

/// Log entry kind tags; the on-disk byte values are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEntryKind {
  Create = 1,
  Store = 2,
  Transfer = 3,
  Delete = 4,
  Truncate = 5,
}

impl LogEntryKind {
  fn from_u8(value: u8) -> Option<LogEntryKind> {
    match value {
      1 => Some(LogEntryKind::Create),
      2 => Some(LogEntryKind::Store),
      3 => Some(LogEntryKind::Transfer),
      4 => Some(LogEntryKind::Delete),
      5 => Some(LogEntryKind::Truncate),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
  pub kind: LogEntryKind,
  pub timestamp_ms: Timestamp,
  pub file_number: FileNumber,
  pub offset: u64,
  pub length: u64,
}

impl LogEntry {
  pub fn create(timestamp_ms: Timestamp, file_number: FileNumber) -> Self {
    Self {
      kind: LogEntryKind::Create,
      timestamp_ms,
      file_number,
      offset: 0,
      length: 0,
    }
  }

  pub fn store(
    timestamp_ms: Timestamp,
    file_number: FileNumber,
    offset: u64,
    length: u64,
  ) -> Self {
    Self {
      kind: LogEntryKind::Store,
      timestamp_ms,
      file_number,
      offset,
      length,
    }
  }

  pub fn transfer(
    timestamp_ms: Timestamp,
    file_number: FileNumber,
    offset: u64,
    length: u64,
  ) -> Self {
    Self {
      kind: LogEntryKind::Transfer,
      timestamp_ms,
      file_number,
      offset,
      length,
    }
  }

  pub fn delete(timestamp_ms: Timestamp, file_number: FileNumber) -> Self {
    Self {
      kind: LogEntryKind::Delete,
      timestamp_ms,
      file_number,
      offset: 0,
      length: 0,
    }
  }

  /// `length` carries the new file length after truncation.
  pub fn truncate(timestamp_ms: Timestamp, file_number: FileNumber, new_length: u64) -> Self {
    Self {
      kind: LogEntryKind::Truncate,
      timestamp_ms,
      file_number,
      offset: 0,
      length: new_length,
    }
  }

  pub fn encode(&self) -> [u8; LOG_ENTRY_SIZE as usize] {
    let mut bytes = [0u8; LOG_ENTRY_SIZE as usize];
    bytes[0] = self.kind as u8;
    LittleEndian::write_i64(&mut bytes[1..9], self.timestamp_ms as i64);
    LittleEndian::write_i64(&mut bytes[9..17], self.file_number as i64);
    LittleEndian::write_i64(&mut bytes[17..25], self.offset as i64);
    LittleEndian::write_i64(&mut bytes[25..33], self.length as i64);
    bytes
  }

  pub fn decode(bytes: &[u8]) -> Option<LogEntry> {
    if bytes.len() < LOG_ENTRY_SIZE as usize {
      return None;
    }
    let kind = LogEntryKind::from_u8(bytes[0])?;
    Some(LogEntry {
      kind,
      timestamp_ms: LittleEndian::read_i64(&bytes[1..9]) as u64,
      file_number: LittleEndian::read_i64(&bytes[9..17]) as u64,
      offset: LittleEndian::read_i64(&bytes[17..25]) as u64,
      length: LittleEndian::read_i64(&bytes[25..33]) as u64,
    })
  }
}

// ============================================================================
// Log file
// ============================================================================

pub struct TransactionLog {
  path: BlobPath,
  length: u64,
  maximum_size: u64,
}

impl TransactionLog {
  /// Open (or create) the log, dropping any torn trailing entry left by a
  /// crash mid-append.
  pub fn open(
    connector: &dyn BlobConnector,
    path: BlobPath,
    maximum_size: u64,
  ) -> Result<TransactionLog> {
    if !connector.file_exists(&path)? {
      connector.create_file(&path)?;
    }
    let mut length = connector.file_size(&path)?;
    let torn = length % LOG_ENTRY_SIZE;
    if torn != 0 {
      length -= torn;
      connector.truncate(&path, length)?;
      tracing::warn!(log = %path, dropped = torn, "truncated torn transaction log tail");
    }
    Ok(TransactionLog {
      path,
      length,
      maximum_size,
    })
  }

  pub fn path(&self) -> &BlobPath {
    &self.path
  }

  pub fn length(&self) -> u64 {
    self.length
  }

  pub fn exceeds_maximum(&self) -> bool {
    self.length > self.maximum_size
  }

  pub fn append(&mut self, connector: &dyn BlobConnector, entry: LogEntry) -> Result<()> {
    connector.append(&self.path, &entry.encode())?;
    self.length += LOG_ENTRY_SIZE;
    Ok(())
  }

  /// All entries, in append order.
  pub fn read_entries(&self, connector: &dyn BlobConnector) -> Result<Vec<LogEntry>> {
    if self.length == 0 {
      return Ok(Vec::new());
    }
    let bytes = connector.read_range(&self.path, 0, self.length)?;
    let mut entries = Vec::with_capacity((self.length / LOG_ENTRY_SIZE) as usize);
    for chunk in bytes.chunks_exact(LOG_ENTRY_SIZE as usize) {
      let entry = LogEntry::decode(chunk).ok_or_else(|| {
        LoamError::Integrity(format!("unparseable transaction log entry in {}", self.path))
      })?;
      entries.push(entry);
    }
    Ok(entries)
  }

  /// Replace the log wholesale with a condensed entry sequence, via a
  /// temporary file and an atomic move.
  pub fn rewrite(
    &mut self,
    connector: &dyn BlobConnector,
    entries: &[LogEntry],
  ) -> Result<()> {
    let temp = self
      .path
      .parent()
      .map(|p| p.child(format!("{}.tmp", self.path.name())))
      .unwrap_or_else(|| BlobPath::container(format!("{}.tmp", self.path.name())));

    if connector.file_exists(&temp)? {
      connector.delete(&temp)?;
    }
    connector.create_file(&temp)?;
    let mut bytes = Vec::with_capacity(entries.len() * LOG_ENTRY_SIZE as usize);
    for entry in entries {
      bytes.extend_from_slice(&entry.encode());
    }
    connector.append(&temp, &bytes)?;
    connector.move_file(&temp, &self.path)?;
    self.length = bytes.len() as u64;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::blob::LocalFileConnector;
  use tempfile::tempdir;

  fn log_path() -> BlobPath {
    BlobPath::parse("channel_0/transactions_0.log")
  }

  fn open_log(connector: &LocalFileConnector) -> TransactionLog {
    connector
      .create_directory(&BlobPath::container("channel_0"))
      .expect("mkdir");
    TransactionLog::open(connector, log_path(), 1024 * 1024).expect("open log")
  }

  #[test]
  fn test_entry_encode_decode() {
    let entry = LogEntry::store(1234, 7, 4096, 128);
    let decoded = LogEntry::decode(&entry.encode()).expect("decode");
    assert_eq!(decoded, entry);
  }

  #[test]
  fn test_append_and_read_back() {
    let dir = tempdir().expect("tempdir");
    let connector = LocalFileConnector::new(dir.path());
    let mut log = open_log(&connector);

    log
      .append(&connector, LogEntry::create(1, 1))
      .expect("append create");
    log
      .append(&connector, LogEntry::store(2, 1, 0, 64))
      .expect("append store");

    let entries = log.read_entries(&connector).expect("read");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].kind, LogEntryKind::Create);
    assert_eq!(entries[1].kind, LogEntryKind::Store);
    assert_eq!(entries[1].length, 64);
  }

  #[test]
  fn test_torn_tail_is_discarded_on_open() {
    let dir = tempdir().expect("tempdir");
    let connector = LocalFileConnector::new(dir.path());
    {
      let mut log = open_log(&connector);
      log
        .append(&connector, LogEntry::store(2, 1, 0, 64))
        .expect("append");
    }
    // Simulate a crash mid-append: half an entry at the tail.
    connector
      .append(&log_path(), &[2u8; 10])
      .expect("torn bytes");

    let log = TransactionLog::open(&connector, log_path(), 1024 * 1024).expect("reopen");
    assert_eq!(log.length(), LOG_ENTRY_SIZE);
    assert_eq!(log.read_entries(&connector).expect("read").len(), 1);
  }

  #[test]
  fn test_rewrite_condenses() {
    let dir = tempdir().expect("tempdir");
    let connector = LocalFileConnector::new(dir.path());
    let mut log = open_log(&connector);
    for i in 0..10 {
      log
        .append(&connector, LogEntry::store(i, 1, i * 64, 64))
        .expect("append");
    }

    log
      .rewrite(
        &connector,
        &[LogEntry::create(11, 1), LogEntry::store(11, 1, 0, 640)],
      )
      .expect("rewrite");
    assert_eq!(log.length(), 2 * LOG_ENTRY_SIZE);
    let entries = log.read_entries(&connector).expect("read");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].length, 640);
  }

  #[test]
  fn test_exceeds_maximum() {
    let dir = tempdir().expect("tempdir");
    let connector = LocalFileConnector::new(dir.path());
    connector
      .create_directory(&BlobPath::container("channel_0"))
      .expect("mkdir");
    let mut log = TransactionLog::open(&connector, log_path(), 2 * LOG_ENTRY_SIZE).expect("open");
    for i in 0..3 {
      log
        .append(&connector, LogEntry::store(i, 1, 0, 1))
        .expect("append");
    }
    assert!(log.exceeds_maximum());
  }
}
