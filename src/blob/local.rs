//! Local filesystem connector.
//!
//! Maps logical blob paths under a root directory and keeps per-file handles
//! open across calls. Appends are durable: bytes are flushed and synced
//! before the call returns.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::error::{LoamError, Result};

use super::{BlobConnector, BlobPath};

pub struct LocalFileConnector {
  root: PathBuf,
  /// Open read-write handles, keyed by resolved path.
  handles: Mutex<HashMap<PathBuf, Arc<Mutex<File>>>>,
}

impl LocalFileConnector {
  pub fn new<P: AsRef<Path>>(root: P) -> Self {
    Self {
      root: root.as_ref().to_path_buf(),
      handles: Mutex::new(HashMap::new()),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn resolve(&self, path: &BlobPath) -> PathBuf {
    let mut resolved = self.root.clone();
    for element in path.elements() {
      resolved.push(element);
    }
    resolved
  }

  fn handle(&self, path: &BlobPath, create: bool) -> Result<Arc<Mutex<File>>> {
    let resolved = self.resolve(path);
    let mut handles = self.handles.lock();
    if let Some(handle) = handles.get(&resolved) {
      return Ok(handle.clone());
    }
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(create)
      .open(&resolved)
      .map_err(|e| map_open_error(e, &resolved))?;
    let handle = Arc::new(Mutex::new(file));
    handles.insert(resolved, handle.clone());
    Ok(handle)
  }

  fn drop_handle(&self, resolved: &Path) {
    self.handles.lock().remove(resolved);
  }
}

fn map_open_error(err: std::io::Error, path: &Path) -> LoamError {
  match err.kind() {
    std::io::ErrorKind::NotFound => LoamError::NotFound(path.display().to_string()),
    std::io::ErrorKind::PermissionDenied => LoamError::AccessDenied(path.display().to_string()),
    _ => LoamError::IoRead {
      path: path.display().to_string(),
      source: err,
    },
  }
}

fn read_error(err: std::io::Error, path: &Path) -> LoamError {
  LoamError::IoRead {
    path: path.display().to_string(),
    source: err,
  }
}

fn write_error(err: std::io::Error, path: &Path) -> LoamError {
  LoamError::IoWrite {
    path: path.display().to_string(),
    source: err,
  }
}

impl BlobConnector for LocalFileConnector {
  fn file_exists(&self, path: &BlobPath) -> Result<bool> {
    Ok(self.resolve(path).is_file())
  }

  fn directory_exists(&self, path: &BlobPath) -> Result<bool> {
    Ok(self.resolve(path).is_dir())
  }

  fn file_size(&self, path: &BlobPath) -> Result<u64> {
    let resolved = self.resolve(path);
    let meta = fs::metadata(&resolved).map_err(|e| map_open_error(e, &resolved))?;
    Ok(meta.len())
  }

  fn read_range(&self, path: &BlobPath, offset: u64, length: u64) -> Result<Vec<u8>> {
    let resolved = self.resolve(path);
    let handle = self.handle(path, false)?;
    let mut file = handle.lock();
    file
      .seek(SeekFrom::Start(offset))
      .map_err(|e| read_error(e, &resolved))?;
    let mut buffer = vec![0u8; length as usize];
    file
      .read_exact(&mut buffer)
      .map_err(|e| read_error(e, &resolved))?;
    Ok(buffer)
  }

  fn append(&self, path: &BlobPath, bytes: &[u8]) -> Result<u64> {
    let resolved = self.resolve(path);
    let handle = self.handle(path, true)?;
    let mut file = handle.lock();
    let offset = file
      .seek(SeekFrom::End(0))
      .map_err(|e| write_error(e, &resolved))?;
    file
      .write_all(bytes)
      .map_err(|e| write_error(e, &resolved))?;
    file.sync_data().map_err(|e| write_error(e, &resolved))?;
    Ok(offset)
  }

  fn truncate(&self, path: &BlobPath, new_length: u64) -> Result<()> {
    let resolved = self.resolve(path);
    let handle = self.handle(path, false)?;
    let file = handle.lock();
    file
      .set_len(new_length)
      .map_err(|e| write_error(e, &resolved))?;
    file.sync_data().map_err(|e| write_error(e, &resolved))?;
    Ok(())
  }

  fn delete(&self, path: &BlobPath) -> Result<()> {
    let resolved = self.resolve(path);
    self.drop_handle(&resolved);
    let result = if resolved.is_dir() {
      self.handles.lock().retain(|p, _| !p.starts_with(&resolved));
      fs::remove_dir_all(&resolved)
    } else {
      fs::remove_file(&resolved)
    };
    match result {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        Err(LoamError::NotFound(resolved.display().to_string()))
      }
      Err(e) => Err(write_error(e, &resolved)),
    }
  }

  fn move_file(&self, from: &BlobPath, to: &BlobPath) -> Result<()> {
    let src = self.resolve(from);
    let dst = self.resolve(to);
    self.drop_handle(&src);
    self.drop_handle(&dst);
    fs::rename(&src, &dst).map_err(|e| write_error(e, &src))
  }

  fn list_children(&self, path: &BlobPath) -> Result<Vec<String>> {
    let resolved = self.resolve(path);
    let entries = fs::read_dir(&resolved).map_err(|e| map_open_error(e, &resolved))?;
    let mut names = Vec::new();
    for entry in entries {
      let entry = entry.map_err(|e| read_error(e, &resolved))?;
      names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
  }

  fn create_directory(&self, path: &BlobPath) -> Result<()> {
    let resolved = self.resolve(path);
    fs::create_dir_all(&resolved).map_err(|e| write_error(e, &resolved))
  }

  fn create_file(&self, path: &BlobPath) -> Result<()> {
    self.handle(path, true).map(|_| ())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  fn connector() -> (tempfile::TempDir, LocalFileConnector) {
    let dir = tempdir().expect("tempdir");
    let connector = LocalFileConnector::new(dir.path());
    (dir, connector)
  }

  #[test]
  fn test_append_and_read_range() {
    let (_dir, fs) = connector();
    let path = BlobPath::container("data.bin");

    assert_eq!(fs.append(&path, b"hello").expect("append"), 0);
    assert_eq!(fs.append(&path, b" world").expect("append"), 5);
    assert_eq!(fs.file_size(&path).expect("size"), 11);
    assert_eq!(fs.read_range(&path, 6, 5).expect("read"), b"world");
    assert_eq!(fs.read_all(&path).expect("read all"), b"hello world");
  }

  #[test]
  fn test_truncate() {
    let (_dir, fs) = connector();
    let path = BlobPath::container("data.bin");
    fs.append(&path, b"0123456789").expect("append");
    fs.truncate(&path, 4).expect("truncate");
    assert_eq!(fs.read_all(&path).expect("read"), b"0123");
  }

  #[test]
  fn test_missing_file_is_not_found() {
    let (_dir, fs) = connector();
    let path = BlobPath::container("missing.bin");
    assert!(matches!(fs.file_size(&path), Err(LoamError::NotFound(_))));
  }

  #[test]
  fn test_list_children_sorted() {
    let (_dir, fs) = connector();
    let dir = BlobPath::container("sub");
    fs.create_directory(&dir).expect("mkdir");
    fs.create_file(&dir.child("b.dat")).expect("create");
    fs.create_file(&dir.child("a.dat")).expect("create");
    assert_eq!(fs.list_children(&dir).expect("list"), vec!["a.dat", "b.dat"]);
  }

  #[test]
  fn test_move_file() {
    let (_dir, fs) = connector();
    let from = BlobPath::container("from.bin");
    let to = BlobPath::container("to.bin");
    fs.append(&from, b"payload").expect("append");
    fs.move_file(&from, &to).expect("move");
    assert!(!fs.file_exists(&from).expect("exists"));
    assert_eq!(fs.read_all(&to).expect("read"), b"payload");
  }

  #[test]
  fn test_delete_missing_reports_not_found() {
    let (_dir, fs) = connector();
    let path = BlobPath::container("nope.bin");
    assert!(matches!(fs.delete(&path), Err(LoamError::NotFound(_))));
  }
}
