//! Channel startup: transaction log replay and data file verification.
//!
//! The log is the commit authority. Data bytes beyond the last logged offset
//! were never acknowledged and are truncated away; data shorter than the log
//! promises is unrecoverable corruption. Every surviving record is header-
//! verified, validated against the type dictionary, and registered in the
//! cache without its payload.

use std::collections::BTreeSet;

use hashbrown::{HashMap, HashSet};
use tracing::{info, warn};

use crate::dict::TypeDictionary;
use crate::error::{LoamError, Result};
use crate::types::{decode_record_header, FileNumber, IdAnalysis, Timestamp};

use super::cache::EntityCache;
use super::data_files::DataFileManager;
use super::txlog::LogEntryKind;

/// Rebuild one channel from disk. `task_ts` stamps any repair entries the
/// recovery itself writes; `consistent_store_ts` is the last known
/// consistent point (the full log is always replayed — the conservative
/// superset — so a zero value is always safe).
pub fn initialize(
  manager: &mut DataFileManager,
  cache: &mut EntityCache,
  dictionary: &TypeDictionary,
  task_ts: Timestamp,
  consistent_store_ts: Timestamp,
) -> Result<IdAnalysis> {
  let channel = manager.channel_index();
  let entries = manager.log().read_entries(manager.connector())?;

  // Replay the log into per-file committed lengths.
  let mut created: BTreeSet<FileNumber> = BTreeSet::new();
  let mut deleted: HashSet<FileNumber> = HashSet::new();
  let mut committed_end: HashMap<FileNumber, u64> = HashMap::new();
  for entry in &entries {
    match entry.kind {
      LogEntryKind::Create => {
        created.insert(entry.file_number);
        deleted.remove(&entry.file_number);
        committed_end.entry(entry.file_number).or_insert(0);
      }
      LogEntryKind::Store | LogEntryKind::Transfer => {
        let end = committed_end.entry(entry.file_number).or_insert(0);
        *end = (*end).max(entry.offset + entry.length);
      }
      LogEntryKind::Delete => {
        deleted.insert(entry.file_number);
      }
      LogEntryKind::Truncate => {
        let end = committed_end.entry(entry.file_number).or_insert(0);
        *end = (*end).min(entry.length);
      }
    }
  }
  for number in &deleted {
    created.remove(number);
    committed_end.remove(number);
  }

  // Inventory the directory.
  let mut on_disk: HashMap<FileNumber, u64> = HashMap::new();
  for name in manager.connector().list_children(manager.directory())? {
    if let Some(number) = manager.parse_data_file_name(&name) {
      let size = manager
        .connector()
        .file_size(&manager.data_file_path(number))?;
      on_disk.insert(number, size);
    }
  }

  // Files the log says are gone but a crash left behind.
  for (&number, _) in on_disk.iter() {
    if deleted.contains(&number) {
      warn!(channel, file = number, "removing data file deleted by log");
      manager.connector().delete(&manager.data_file_path(number))?;
    }
  }
  on_disk.retain(|number, _| !deleted.contains(number));

  // Files present but never logged: a crash between file creation and its
  // create entry leaves an empty stray; anything non-empty is corruption.
  for (&number, &size) in on_disk.iter() {
    if !created.contains(&number) {
      if size == 0 {
        warn!(channel, file = number, "removing unlogged empty data file");
        manager.connector().delete(&manager.data_file_path(number))?;
      } else {
        return Err(LoamError::Consistency(format!(
          "channel {channel} data file {number} ({size} bytes) is not in the transaction log"
        )));
      }
    }
  }
  on_disk.retain(|number, _| created.contains(number));

  // Verify lengths, truncating torn tails.
  for &number in &created {
    let expected = committed_end.get(&number).copied().unwrap_or(0);
    let actual = match on_disk.get(&number) {
      Some(&size) => size,
      None => {
        return Err(LoamError::Consistency(format!(
          "channel {channel} data file {number} is missing ({expected} bytes committed)"
        )))
      }
    };
    if actual > expected {
      warn!(
        channel,
        file = number,
        committed = expected,
        actual,
        "truncating uncommitted data file tail"
      );
      manager
        .connector()
        .truncate(&manager.data_file_path(number), expected)?;
      manager.append_truncate_repair(task_ts, number, expected)?;
    } else if actual < expected {
      return Err(LoamError::Consistency(format!(
        "channel {channel} data file {number} is {actual} bytes but the log committed {expected}"
      )));
    }
    manager.adopt_file(number, expected);
  }

  // Scan surviving records, newest position wins.
  let mut analysis = IdAnalysis::default();
  for &number in &created {
    let total = committed_end.get(&number).copied().unwrap_or(0);
    if total == 0 {
      continue;
    }
    let bytes = manager.read_bytes(number, 0, total)?;
    let mut offset = 0u64;
    while offset < total {
      let header = decode_record_header(&bytes[offset as usize..]).ok_or_else(|| {
        LoamError::Consistency(format!(
          "channel {channel} data file {number} has an unreadable record header at offset {offset}"
        ))
      })?;
      if offset + header.length > total {
        return Err(LoamError::Consistency(format!(
          "channel {channel} data file {number} record at offset {offset} overruns the committed length"
        )));
      }
      dictionary.validate_entity(header.length, header.tid, header.oid)?;

      let index = cache.put(header.oid, header.tid, task_ts)?;
      manager.assign_position(
        cache,
        index,
        crate::types::StoragePosition {
          file_number: number,
          offset,
        },
        header.length,
      );
      analysis.observe(header.oid, header.tid);
      offset += header.length;
    }
  }

  analysis.entity_count = cache.entity_count();
  info!(
    channel,
    entities = analysis.entity_count,
    files = manager.file_count(),
    consistent_store_ts,
    "channel recovered"
  );
  Ok(analysis)
}
