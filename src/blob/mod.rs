//! Blob connector abstraction.
//!
//! The engine never touches the filesystem directly: every byte it persists
//! goes through a [`BlobConnector`]. Paths are logical, `/`-separated, and
//! rooted at a container (bucket or root directory). Implementations must be
//! blocking and thread-safe for independent paths.

use std::fmt;

use crate::error::Result;

pub mod local;

pub use local::LocalFileConnector;

// ============================================================================
// Paths
// ============================================================================

/// Logical `/`-separated path; the first element is the container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobPath {
  elements: Vec<String>,
}

impl BlobPath {
  pub fn container<S: Into<String>>(name: S) -> Self {
    Self {
      elements: vec![name.into()],
    }
  }

  /// Parse from a `/`-separated string. Empty segments are dropped.
  pub fn parse(path: &str) -> Self {
    Self {
      elements: path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect(),
    }
  }

  pub fn child<S: Into<String>>(&self, name: S) -> Self {
    let mut elements = self.elements.clone();
    elements.push(name.into());
    Self { elements }
  }

  pub fn elements(&self) -> &[String] {
    &self.elements
  }

  /// Last path element, or the container name for a bare container.
  pub fn name(&self) -> &str {
    self.elements.last().map(String::as_str).unwrap_or("")
  }

  pub fn parent(&self) -> Option<BlobPath> {
    if self.elements.len() <= 1 {
      return None;
    }
    Some(Self {
      elements: self.elements[..self.elements.len() - 1].to_vec(),
    })
  }
}

impl fmt::Display for BlobPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.elements.join("/"))
  }
}

// ============================================================================
// Connector
// ============================================================================

/// Low-level blob I/O primitives. All operations are blocking.
pub trait BlobConnector: Send + Sync {
  fn file_exists(&self, path: &BlobPath) -> Result<bool>;

  fn directory_exists(&self, path: &BlobPath) -> Result<bool>;

  fn file_size(&self, path: &BlobPath) -> Result<u64>;

  /// Read exactly `length` bytes starting at `offset`.
  fn read_range(&self, path: &BlobPath, offset: u64, length: u64) -> Result<Vec<u8>>;

  /// Durably append `bytes`; returns the offset the write started at.
  fn append(&self, path: &BlobPath, bytes: &[u8]) -> Result<u64>;

  /// Shrink the file to `new_length` bytes.
  fn truncate(&self, path: &BlobPath, new_length: u64) -> Result<()>;

  fn delete(&self, path: &BlobPath) -> Result<()>;

  fn move_file(&self, from: &BlobPath, to: &BlobPath) -> Result<()>;

  /// Names of direct children of a directory.
  fn list_children(&self, path: &BlobPath) -> Result<Vec<String>>;

  /// Create the directory and any missing ancestors.
  fn create_directory(&self, path: &BlobPath) -> Result<()>;

  /// Create an empty file; idempotent if it already exists.
  fn create_file(&self, path: &BlobPath) -> Result<()>;

  /// Whole-file read.
  fn read_all(&self, path: &BlobPath) -> Result<Vec<u8>> {
    let size = self.file_size(path)?;
    self.read_range(path, 0, size)
  }
}
