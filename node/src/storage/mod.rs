//! Pending-block overflow storage.
//!
//! Blocks that cannot be imported yet are kept here, indexed by the number of
//! the first block of each stored range ("level") and by the hash of that
//! first block ("queue key").

mod wal;

pub use wal::DiskPendingStore;

use crate::chain::is_out_of_disk_space;
use crate::types::Block;
use alloy_primitives::B256;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::{fmt, io};

/// Queues stored at one level, keyed by the hash of their first block.
pub type PendingQueues = BTreeMap<B256, Vec<Block>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    OutOfDiskSpace(String),
    Io(String),
    Codec(String),
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::OutOfDiskSpace(_))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfDiskSpace(msg) => write!(f, "out of disk space: {msg}"),
            Self::Io(msg) => write!(f, "pending store io: {msg}"),
            Self::Codec(msg) => write!(f, "pending store codec: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        if is_out_of_disk_space(&err) {
            Self::OutOfDiskSpace(err.to_string())
        } else {
            Self::Io(err.to_string())
        }
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        match *err {
            bincode::ErrorKind::Io(io) => io.into(),
            other => Self::Codec(other.to_string()),
        }
    }
}

/// Level-indexed store for blocks waiting on a missing parent.
pub trait PendingBlockStore: Send + Sync {
    /// Stores a contiguous range. Returns how many blocks were written.
    fn store_pending_range(&self, blocks: &[Block]) -> Result<usize, StoreError>;
    fn load_pending_at_level(&self, level: u64) -> Result<PendingQueues, StoreError>;
    /// Removes the queues in `queue_keys` from `level`. `loaded` is the map
    /// previously returned for that level.
    fn drop_imported(
        &self,
        level: u64,
        queue_keys: &[B256],
        loaded: &PendingQueues,
    ) -> Result<(), StoreError>;
    /// Number of stored queues across all levels.
    fn queue_count(&self) -> usize;
}

/// Level index shared by the memory and disk stores.
#[derive(Debug, Default)]
pub(crate) struct LevelIndex {
    levels: BTreeMap<u64, PendingQueues>,
}

impl LevelIndex {
    /// Inserts a range; a shorter range never replaces a longer one under the
    /// same key.
    pub(crate) fn insert(&mut self, blocks: &[Block]) -> Option<(u64, B256)> {
        let first = blocks.first()?;
        let (level, key) = (first.number(), first.hash());
        let queues = self.levels.entry(level).or_default();
        match queues.get(&key) {
            Some(existing) if existing.len() >= blocks.len() => None,
            _ => {
                queues.insert(key, blocks.to_vec());
                Some((level, key))
            }
        }
    }

    pub(crate) fn load(&self, level: u64) -> PendingQueues {
        self.levels.get(&level).cloned().unwrap_or_default()
    }

    pub(crate) fn remove(&mut self, level: u64, queue_keys: &[B256]) {
        if let Some(queues) = self.levels.get_mut(&level) {
            for key in queue_keys {
                queues.remove(key);
            }
            if queues.is_empty() {
                self.levels.remove(&level);
            }
        }
    }

    pub(crate) fn queue_count(&self) -> usize {
        self.levels.values().map(BTreeMap::len).sum()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&u64, &PendingQueues)> {
        self.levels.iter()
    }
}

/// Pending store that lives only for the process lifetime.
#[derive(Debug, Default)]
pub struct MemoryPendingStore {
    index: Mutex<LevelIndex>,
}

impl MemoryPendingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PendingBlockStore for MemoryPendingStore {
    fn store_pending_range(&self, blocks: &[Block]) -> Result<usize, StoreError> {
        Ok(self
            .index
            .lock()
            .insert(blocks)
            .map(|_| blocks.len())
            .unwrap_or(0))
    }

    fn load_pending_at_level(&self, level: u64) -> Result<PendingQueues, StoreError> {
        Ok(self.index.lock().load(level))
    }

    fn drop_imported(
        &self,
        level: u64,
        queue_keys: &[B256],
        _loaded: &PendingQueues,
    ) -> Result<(), StoreError> {
        self.index.lock().remove(level, queue_keys);
        Ok(())
    }

    fn queue_count(&self) -> usize {
        self.index.lock().queue_count()
    }
}
