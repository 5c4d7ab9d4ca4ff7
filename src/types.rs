//! Core identifier and record types shared across the engine.

use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, LittleEndian};

use crate::constants::RECORD_HEADER_SIZE;

/// Object id. 64-bit, globally unique, strictly monotonic, never reused.
/// Zero is the null reference.
pub type Oid = u64;

/// Type id. 64-bit; ids 1..N are built-ins, user types start at 1000.
pub type Tid = u64;

/// Monotonic data file number within one channel, starting at 1.
pub type FileNumber = u64;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> Timestamp {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0)
}

// ============================================================================
// Storage positions and records
// ============================================================================

/// Where an entity record starts on disk, within its owning channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoragePosition {
  pub file_number: FileNumber,
  pub offset: u64,
}

/// One entity handed to the engine for storage. The payload excludes the
/// 32-byte record header; the engine frames it on write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityChunk {
  pub oid: Oid,
  pub tid: Tid,
  pub payload: Vec<u8>,
}

impl EntityChunk {
  pub fn new(oid: Oid, tid: Tid, payload: Vec<u8>) -> Self {
    Self { oid, tid, payload }
  }

  /// Total on-disk record length including the header.
  pub fn record_length(&self) -> u64 {
    RECORD_HEADER_SIZE + self.payload.len() as u64
  }
}

/// An entity read back out of storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntity {
  pub oid: Oid,
  pub tid: Tid,
  pub payload: Vec<u8>,
}

/// Encode a record header: length | type_id | object_id | reserved, i64 LE.
pub fn encode_record_header(length: u64, tid: Tid, oid: Oid) -> [u8; 32] {
  let mut header = [0u8; 32];
  LittleEndian::write_i64(&mut header[0..8], length as i64);
  LittleEndian::write_i64(&mut header[8..16], tid as i64);
  LittleEndian::write_i64(&mut header[16..24], oid as i64);
  // bytes 24..32 reserved, zero
  header
}

/// Decoded record header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
  pub length: u64,
  pub tid: Tid,
  pub oid: Oid,
}

/// Decode a record header. Rejects negative fields and lengths shorter than
/// the header itself.
pub fn decode_record_header(bytes: &[u8]) -> Option<RecordHeader> {
  if bytes.len() < RECORD_HEADER_SIZE as usize {
    return None;
  }
  let length = LittleEndian::read_i64(&bytes[0..8]);
  let tid = LittleEndian::read_i64(&bytes[8..16]);
  let oid = LittleEndian::read_i64(&bytes[16..24]);
  if length < RECORD_HEADER_SIZE as i64 || tid <= 0 || oid <= 0 {
    return None;
  }
  Some(RecordHeader {
    length: length as u64,
    tid: tid as u64,
    oid: oid as u64,
  })
}

// ============================================================================
// Startup inventory
// ============================================================================

/// Highest ids and entity count observed during a scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdAnalysis {
  pub highest_oid: Oid,
  pub highest_tid: Tid,
  pub entity_count: u64,
}

impl IdAnalysis {
  pub fn merge(&mut self, other: IdAnalysis) {
    self.highest_oid = self.highest_oid.max(other.highest_oid);
    self.highest_tid = self.highest_tid.max(other.highest_tid);
    self.entity_count += other.entity_count;
  }

  pub fn observe(&mut self, oid: Oid, tid: Tid) {
    self.highest_oid = self.highest_oid.max(oid);
    self.highest_tid = self.highest_tid.max(tid);
  }
}

// ============================================================================
// GC and channel states
// ============================================================================

/// Tri-color marking state carried by every cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcColor {
  /// Not yet reached in the current cycle.
  White,
  /// Reached; outbound references not yet enqueued.
  Gray,
  /// Reached; all outbound references enqueued.
  Black,
}

/// Channel worker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
  Stopped,
  Starting,
  Running,
  Stopping,
  /// Terminal until operator restart.
  Error,
}

impl ChannelState {
  pub fn from_u8(value: u8) -> ChannelState {
    match value {
      1 => ChannelState::Starting,
      2 => ChannelState::Running,
      3 => ChannelState::Stopping,
      4 => ChannelState::Error,
      _ => ChannelState::Stopped,
    }
  }

  pub fn as_u8(self) -> u8 {
    match self {
      ChannelState::Stopped => 0,
      ChannelState::Starting => 1,
      ChannelState::Running => 2,
      ChannelState::Stopping => 3,
      ChannelState::Error => 4,
    }
  }
}
