//! Backup archives.
//!
//! A backup is a single `.bak` file: a magic header followed by one entry
//! per stored file, each carrying its logical path, length, and a crc32 of
//! its bytes. The channel file sets are staged through the workers' export
//! command first, so every copied channel is internally consistent.

use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use chrono::Local;
use tracing::info;

use crate::blob::{BlobConnector, BlobPath, LocalFileConnector};
use crate::constants::{BACKUP_DIRECTORY, MAGIC_BACKUP, TYPES_DIRECTORY, TYPE_DICTIONARY_FILE};
use crate::channel::ChannelManager;
use crate::dict::TypeDictionary;
use crate::error::{LoamError, Result};

const STAGING_DIRECTORY: &str = ".staging";

/// Stage a consistent copy of the storage and archive it as
/// `backup_<yyyyMMdd_HHmmss>.bak` inside `target_dir`. Returns the archive
/// path.
pub fn create_backup(
  manager: &ChannelManager,
  dictionary: &TypeDictionary,
  connector: &dyn BlobConnector,
  target_dir: &Path,
) -> Result<PathBuf> {
  let staging = BlobPath::container(BACKUP_DIRECTORY).child(STAGING_DIRECTORY);
  if connector.directory_exists(&staging)? {
    connector.delete(&staging)?;
  }
  connector.create_directory(&staging)?;

  manager.export_all(&staging)?;
  let dictionary_path = staging.child(TYPES_DIRECTORY).child(TYPE_DICTIONARY_FILE);
  dictionary.save(connector, &dictionary_path)?;

  let archive_name = format!("backup_{}.bak", Local::now().format("%Y%m%d_%H%M%S"));
  let out = LocalFileConnector::new(target_dir);
  out.create_directory(&BlobPath::parse(""))?;
  let archive = BlobPath::container(archive_name.clone());
  if out.file_exists(&archive)? {
    out.delete(&archive)?;
  }
  out.create_file(&archive)?;
  out.append(&archive, &MAGIC_BACKUP)?;

  let mut entries = Vec::new();
  walk(connector, &staging, String::new(), &mut entries)?;
  for (name, path) in &entries {
    let bytes = connector.read_all(path)?;
    out.append(&archive, &encode_entry_header(name, &bytes))?;
    out.append(&archive, &bytes)?;
  }

  connector.delete(&staging)?;
  info!(
    archive = %target_dir.join(&archive_name).display(),
    files = entries.len(),
    "backup created"
  );
  Ok(target_dir.join(archive_name))
}

/// Unpack an archive into `target_dir`, verifying every entry's checksum.
/// The target becomes a storage directory a fresh manager can start on.
pub fn restore_backup(archive: &Path, target_dir: &Path) -> Result<()> {
  let parent = archive
    .parent()
    .ok_or_else(|| LoamError::NotFound(archive.display().to_string()))?;
  let name = archive
    .file_name()
    .ok_or_else(|| LoamError::NotFound(archive.display().to_string()))?
    .to_string_lossy()
    .into_owned();
  let source = LocalFileConnector::new(parent);
  let bytes = source.read_all(&BlobPath::container(name))?;

  if bytes.len() < MAGIC_BACKUP.len() || bytes[..MAGIC_BACKUP.len()] != MAGIC_BACKUP {
    return Err(LoamError::Integrity(format!(
      "{} is not a backup archive",
      archive.display()
    )));
  }

  let out = LocalFileConnector::new(target_dir);
  out.create_directory(&BlobPath::parse(""))?;

  let mut offset = MAGIC_BACKUP.len();
  while offset < bytes.len() {
    let (name, data, next) = decode_entry(&bytes, offset, archive)?;
    let path = BlobPath::parse(&name);
    if let Some(parent) = path.parent() {
      out.create_directory(&parent)?;
    }
    if out.file_exists(&path)? {
      out.truncate(&path, 0)?;
    } else {
      out.create_file(&path)?;
    }
    out.append(&path, data)?;
    offset = next;
  }
  Ok(())
}

// ============================================================================
// Archive format
// ============================================================================

/// name_len u32 | name | data_len u64 | crc32 u32
fn encode_entry_header(name: &str, data: &[u8]) -> Vec<u8> {
  let mut header = vec![0u8; 4 + name.len() + 8 + 4];
  LittleEndian::write_u32(&mut header[0..4], name.len() as u32);
  header[4..4 + name.len()].copy_from_slice(name.as_bytes());
  let tail = 4 + name.len();
  LittleEndian::write_u64(&mut header[tail..tail + 8], data.len() as u64);
  LittleEndian::write_u32(&mut header[tail + 8..tail + 12], crc32fast::hash(data));
  header
}

fn decode_entry<'a>(
  bytes: &'a [u8],
  offset: usize,
  archive: &Path,
) -> Result<(String, &'a [u8], usize)> {
  let truncated = || {
    LoamError::Integrity(format!(
      "backup archive {} is truncated at offset {offset}",
      archive.display()
    ))
  };
  if offset + 4 > bytes.len() {
    return Err(truncated());
  }
  let name_len = LittleEndian::read_u32(&bytes[offset..offset + 4]) as usize;
  let name_end = offset + 4 + name_len;
  if name_end + 12 > bytes.len() {
    return Err(truncated());
  }
  let name = std::str::from_utf8(&bytes[offset + 4..name_end])
    .map_err(|_| truncated())?
    .to_string();
  let data_len = LittleEndian::read_u64(&bytes[name_end..name_end + 8]) as usize;
  let expected_crc = LittleEndian::read_u32(&bytes[name_end + 8..name_end + 12]);
  let data_start = name_end + 12;
  let data_end = data_start + data_len;
  if data_end > bytes.len() {
    return Err(truncated());
  }
  let data = &bytes[data_start..data_end];
  if crc32fast::hash(data) != expected_crc {
    return Err(LoamError::Integrity(format!(
      "backup entry '{name}' failed its checksum"
    )));
  }
  Ok((name, data, data_end))
}

/// Collect `(relative_name, path)` for every file under `directory`.
fn walk(
  connector: &dyn BlobConnector,
  directory: &BlobPath,
  prefix: String,
  entries: &mut Vec<(String, BlobPath)>,
) -> Result<()> {
  for child in connector.list_children(directory)? {
    let path = directory.child(child.clone());
    let name = if prefix.is_empty() {
      child.clone()
    } else {
      format!("{prefix}/{child}")
    };
    if connector.directory_exists(&path)? {
      walk(connector, &path, name, entries)?;
    } else {
      entries.push((name, path));
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn test_entry_round_trip() {
    let data = b"payload bytes";
    let mut archive = MAGIC_BACKUP.to_vec();
    archive.extend_from_slice(&encode_entry_header("channel_0/data_0_1.dat", data));
    archive.extend_from_slice(data);

    let (name, decoded, next) =
      decode_entry(&archive, MAGIC_BACKUP.len(), Path::new("test.bak")).expect("decode");
    assert_eq!(name, "channel_0/data_0_1.dat");
    assert_eq!(decoded, data);
    assert_eq!(next, archive.len());
  }

  #[test]
  fn test_corrupted_entry_fails_checksum() {
    let data = b"payload bytes";
    let mut archive = MAGIC_BACKUP.to_vec();
    archive.extend_from_slice(&encode_entry_header("f", data));
    archive.extend_from_slice(data);
    let last = archive.len() - 1;
    archive[last] ^= 0xFF;

    assert!(matches!(
      decode_entry(&archive, MAGIC_BACKUP.len(), Path::new("test.bak")),
      Err(LoamError::Integrity(_))
    ));
  }

  #[test]
  fn test_restore_rejects_wrong_magic() {
    let dir = tempdir().expect("tempdir");
    let archive_path = dir.path().join("bad.bak");
    std::fs::write(&archive_path, b"definitely not an archive").expect("write");
    assert!(matches!(
      restore_backup(&archive_path, &dir.path().join("out")),
      Err(LoamError::Integrity(_))
    ));
  }
}
