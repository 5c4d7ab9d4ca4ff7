//! Batching storer.
//!
//! The serializer layer reserves object ids up front, buffers the byte
//! records of one commit, and hands the whole batch over at once. Within one
//! channel, records land in the data file in the order they were accepted;
//! across channels there is no total order.

use std::sync::Arc;

use crate::channel::ChannelManager;
use crate::error::Result;
use crate::oid::OidAllocator;
use crate::types::{now_ms, EntityChunk, Oid, Tid};

pub struct Storer {
  manager: Arc<ChannelManager>,
  allocator: Arc<OidAllocator>,
  buffered: Vec<EntityChunk>,
}

impl Storer {
  pub(crate) fn new(manager: Arc<ChannelManager>, allocator: Arc<OidAllocator>) -> Self {
    Self {
      manager,
      allocator,
      buffered: Vec::new(),
    }
  }

  /// Reserve an object id for an entity of `tid`, steered by the configured
  /// distribution strategy.
  pub fn reserve(&self, tid: Tid) -> Oid {
    match self.manager.choose_channel(tid) {
      Some(target) => self
        .allocator
        .allocate_for_channel(target, self.manager.channel_count()),
      None => self.allocator.allocate(),
    }
  }

  /// Reserve an id and buffer the record in one step.
  pub fn put(&mut self, tid: Tid, payload: Vec<u8>) -> Oid {
    let oid = self.reserve(tid);
    self.put_with_oid(oid, tid, payload);
    oid
  }

  /// Buffer a record for a previously reserved id. Re-storing an id the
  /// database already holds supersedes its old record.
  pub fn put_with_oid(&mut self, oid: Oid, tid: Tid, payload: Vec<u8>) {
    self.buffered.push(EntityChunk::new(oid, tid, payload));
  }

  pub fn pending(&self) -> usize {
    self.buffered.len()
  }

  /// Persist everything buffered. Returns the number of entities stored;
  /// the storer is reusable afterwards.
  pub fn commit(&mut self) -> Result<u64> {
    let chunks = std::mem::take(&mut self.buffered);
    self.manager.store(now_ms(), chunks)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::blob::LocalFileConnector;
  use crate::config::StorageConfig;
  use crate::constants::TID_BYTE_ARRAY;
  use crate::dict::TypeDictionary;
  use tempfile::tempdir;

  fn storer_fixture(dir: &std::path::Path) -> Storer {
    let config = Arc::new(StorageConfig::new(dir).channel_count(2));
    let connector = Arc::new(LocalFileConnector::new(dir));
    let dictionary = Arc::new(TypeDictionary::new());
    let (manager, _analysis) =
      ChannelManager::start(config, connector, dictionary).expect("manager starts");
    Storer::new(Arc::new(manager), Arc::new(OidAllocator::new()))
  }

  #[test]
  fn test_commit_drains_the_buffer() {
    let dir = tempdir().expect("tempdir");
    let mut storer = storer_fixture(dir.path());

    let first = storer.put(TID_BYTE_ARRAY, vec![1; 8]);
    let second = storer.put(TID_BYTE_ARRAY, vec![2; 8]);
    assert!(second > first);
    assert_eq!(storer.pending(), 2);

    assert_eq!(storer.commit().expect("commit"), 2);
    assert_eq!(storer.pending(), 0);
    assert_eq!(storer.commit().expect("empty commit"), 0);
  }

  #[test]
  fn test_reserved_ids_are_usable_across_commits() {
    let dir = tempdir().expect("tempdir");
    let mut storer = storer_fixture(dir.path());

    let reserved = storer.reserve(TID_BYTE_ARRAY);
    storer.put(TID_BYTE_ARRAY, vec![0; 4]);
    storer.commit().expect("commit");

    // The reserved id is still free to be written in a later commit.
    storer.put_with_oid(reserved, TID_BYTE_ARRAY, vec![9; 4]);
    assert_eq!(storer.commit().expect("commit"), 1);
  }
}
