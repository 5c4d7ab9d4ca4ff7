//! Error types for LoamDB.

use thiserror::Error;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum LoamError {
  /// Configuration invalid, directory unreadable, or dictionary corrupt at startup.
  #[error("storage initialization failed: {0}")]
  Initialization(String),

  /// Programmer error caught at construction time.
  #[error("invalid configuration: {0}")]
  InvalidConfiguration(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("access denied: {0}")]
  AccessDenied(String),

  /// Stored bytes disagree with what the log or a header promised.
  #[error("integrity violation: {0}")]
  Integrity(String),

  #[error("read failed on {path}: {source}")]
  IoRead {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("write failed on {path}: {source}")]
  IoWrite {
    path: String,
    #[source]
    source: std::io::Error,
  },

  /// On-disk record length outside the type definition's bounds.
  #[error("entity {oid} of type {tid} has length {length}, expected {min}..={max}")]
  InvalidEntityLength {
    oid: u64,
    tid: u64,
    length: u64,
    min: u64,
    max: u64,
  },

  /// A type id was observed on disk with no registered definition.
  #[error("no type definition registered for type id {0}")]
  TypeHandlerConsistency(u64),

  /// Unknown OID references, orphan cycles, or header mismatches.
  #[error("storage consistency violation: {0}")]
  Consistency(String),

  #[error("storage is not running")]
  NotRunning,

  #[error("storage is shutting down")]
  ShuttingDown,

  /// The channel hit an unrecoverable failure and refuses further work.
  #[error("channel {0} is in the error state")]
  ChannelFailed(usize),

  #[error("serialization failed: {0}")]
  Serialization(String),
}

impl From<serde_json::Error> for LoamError {
  fn from(err: serde_json::Error) -> Self {
    LoamError::Serialization(err.to_string())
  }
}

pub type Result<T> = std::result::Result<T, LoamError>;
