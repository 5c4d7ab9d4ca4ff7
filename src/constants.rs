//! Reserved identifiers, on-disk layout names, and default tuning values.

use crate::types::{Oid, Tid};

// ============================================================================
// Reserved object ids
// ============================================================================

/// OID 0 is the null reference and is never issued.
pub const OID_NULL: Oid = 0;

/// The root registry entity lives at a fixed, reserved OID.
pub const OID_ROOT_REGISTRY: Oid = 1;

/// First OID the allocator may hand out on a fresh store.
pub const OID_FIRST_USER: Oid = 2;

// ============================================================================
// Built-in type ids (1..N); user types start at 1000
// ============================================================================

pub const TID_OBJECT: Tid = 1;
pub const TID_BOOLEAN: Tid = 2;
pub const TID_BYTE: Tid = 3;
pub const TID_INT16: Tid = 4;
pub const TID_INT32: Tid = 5;
pub const TID_INT64: Tid = 6;
pub const TID_FLOAT32: Tid = 7;
pub const TID_FLOAT64: Tid = 8;
pub const TID_DECIMAL: Tid = 9;
pub const TID_CHAR: Tid = 10;
pub const TID_STRING: Tid = 11;
pub const TID_DATE_TIME: Tid = 12;
pub const TID_GUID: Tid = 13;

pub const TID_BYTE_ARRAY: Tid = 20;
pub const TID_INT32_ARRAY: Tid = 21;
pub const TID_INT64_ARRAY: Tid = 22;
pub const TID_FLOAT32_ARRAY: Tid = 23;
pub const TID_FLOAT64_ARRAY: Tid = 24;

/// Reference-list entity holding the persisted root OIDs.
pub const TID_ROOT_REGISTRY: Tid = 35;

/// First type id assigned to a user-registered type.
pub const TID_FIRST_USER: Tid = 1000;

// ============================================================================
// On-disk record framing
// ============================================================================

/// Entity record header: length | type_id | object_id | reserved, i64 LE each.
pub const RECORD_HEADER_SIZE: u64 = 32;

/// Transaction log entry: kind u8 | timestamp i64 | file i64 | offset i64 | length i64.
pub const LOG_ENTRY_SIZE: u64 = 33;

// ============================================================================
// Storage layout names
// ============================================================================

pub const DEFAULT_STORAGE_DIRECTORY: &str = "./storage";
pub const DEFAULT_CHANNEL_DIRECTORY_PREFIX: &str = "channel_";
pub const DATA_FILE_PREFIX: &str = "data_";
pub const DATA_FILE_SUFFIX: &str = ".dat";
pub const TRANSACTION_FILE_PREFIX: &str = "transactions_";
pub const TRANSACTION_FILE_SUFFIX: &str = ".log";
pub const TYPES_DIRECTORY: &str = "types";
pub const TYPE_DICTIONARY_FILE: &str = "type_dictionary.json";
pub const BACKUP_DIRECTORY: &str = "backup";
pub const LOCK_FILE: &str = "lock.lck";

/// Magic bytes for backup archives: "LoamDB backup 1\0" (16 bytes)
pub const MAGIC_BACKUP: [u8; 16] = [
  0x4c, 0x6f, 0x61, 0x6d, 0x44, 0x42, 0x20, 0x62, // "LoamDB b"
  0x61, 0x63, 0x6b, 0x75, 0x70, 0x20, 0x31, 0x00, // "ackup 1\0"
];

// ============================================================================
// Default tuning values
// ============================================================================

/// 1 MiB: data files smaller than this are cleanup candidates.
pub const DEFAULT_DATA_FILE_MINIMUM_SIZE: u64 = 1024 * 1024;

/// 8 MiB: head rollover threshold; larger files are cleanup candidates.
pub const DEFAULT_DATA_FILE_MAXIMUM_SIZE: u64 = 8 * 1024 * 1024;

/// 64 MiB: transaction log compaction threshold.
pub const DEFAULT_TRANSACTION_FILE_MAXIMUM_SIZE: u64 = 64 * 1024 * 1024;

/// Files with live/total below this ratio are evacuated.
pub const DEFAULT_MINIMUM_USE_RATIO: f64 = 0.75;

pub const DEFAULT_HOUSEKEEPING_INTERVAL_MS: u64 = 1000;

/// 10ms baseline budget, split among GC / file check / cache check.
pub const DEFAULT_HOUSEKEEPING_TIME_BUDGET_NS: u64 = 10_000_000;

/// Consecutive on-budget cycles before the adaptive scheduler grows the budget.
pub const DEFAULT_BUDGET_INCREASE_THRESHOLD: u32 = 10;

/// 5ms growth step for the adaptive budget.
pub const DEFAULT_BUDGET_INCREASE_NS: u64 = 5_000_000;

/// 100ms ceiling for the adaptive budget.
pub const DEFAULT_MAXIMUM_TIME_BUDGET_NS: u64 = 100_000_000;

/// 24h: cached payloads older than this are evicted.
pub const DEFAULT_CACHE_TIMEOUT_MS: u64 = 86_400_000;

/// Weight for the size-vs-age eviction term.
pub const DEFAULT_CACHE_THRESHOLD: u64 = 1000;

/// Entities marked per deadline check inside the incremental GC loop.
pub const GC_MARK_BATCH: usize = 64;

/// Cache entries evaluated per deadline check during cache checks.
pub const CACHE_CHECK_BATCH: usize = 128;

/// Unbounded time budget for the blocking `issue_full_*` operations.
pub const BUDGET_UNBOUNDED_NS: u64 = u64::MAX;
