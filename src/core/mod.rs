//! Per-channel storage internals: entity arena, cache, data files,
//! transaction log, and startup recovery.

pub mod cache;
pub mod data_files;
pub mod entity;
pub mod recovery;
pub mod txlog;

pub use cache::{CacheEvaluator, DefaultCacheEvaluator, EntityCache};
pub use data_files::{DataFile, DataFileManager};
pub use entity::{ChainEnds, ChainKind, EntityArena, EntitySlot, NIL};
pub use txlog::{LogEntry, LogEntryKind, TransactionLog};
