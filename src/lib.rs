//! LoamDB - embedded object-graph persistence engine
//!
//! An application hands the engine a serialized object graph rooted at a
//! designated root; the engine durably persists every record reachable from
//! that root into append-only data files, reloads them on restart, and
//! reclaims the space of records that later become unreachable.
//!
//! # Architecture
//!
//! The storage is a fixed, power-of-two array of **channels**. Each channel
//! owns one worker thread, one directory of append-only data files, one
//! transaction log, one entity cache, and its share of the tri-color
//! mark-and-sweep collector. Channels share nothing but the mark monitor;
//! cross-channel work happens only at housekeeping time.
//!
//! - **Data files**: append-only, rolled over at a size limit, evacuated
//!   and deleted wholesale once their live-byte ratio drops
//! - **Transaction log**: the commit authority replayed on restart
//! - **Entity cache**: per-channel id index with evictable payloads
//! - **GC**: incremental, time-budgeted, coordinated by a generation counter
//! - **Housekeeping**: one background thread time-slicing GC, file cleanup,
//!   and cache eviction under an adaptive budget

#![deny(clippy::all)]

// Core modules
pub mod constants;
pub mod error;
pub mod types;

// Configuration and low-level I/O
pub mod blob;
pub mod config;

// Type dictionary
pub mod dict;

// Per-channel storage internals
pub mod core;

// Garbage collection
pub mod gc;

// Channels and their manager
pub mod channel;

// Process-wide services
pub mod backup;
pub mod housekeeping;
pub mod metrics;
pub mod oid;
pub mod storer;

// Top-level lifecycle
pub mod storage;

// Re-export commonly used items
pub use error::{LoamError, Result};

pub use blob::{BlobConnector, BlobPath, LocalFileConnector};
pub use config::{DistributionStrategy, StorageConfig};
pub use dict::{TypeDefinition, TypeDictionary, TypeHandler, TypeMember};
pub use metrics::{ChannelStatistics, StorageStatistics};
pub use storage::{ObjectGraph, StorageManager};
pub use storer::Storer;
pub use types::{EntityChunk, Oid, StoredEntity, Tid};

/// Engine version.
pub fn version() -> String {
  env!("CARGO_PKG_VERSION").to_string()
}
