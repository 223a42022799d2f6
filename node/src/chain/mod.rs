//! Chain collaborator surface used by the sync engine.

mod memory;

pub use memory::MemoryChain;

use crate::types::{BatchImport, Block, BlockHeader, BlockId, DatabaseType, ImportOutcome, TrieNodeOutcome};
use alloy_primitives::{B256, U256};
use std::{fmt, io};

/// Exit code used when persistent storage runs out of space.
pub const EXIT_OUT_OF_DISK_SPACE: i32 = 2;

/// Errors raised by chain mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// Persistent storage is full. Unrecoverable.
    OutOfDiskSpace(String),
    Storage(String),
    Rejected(String),
}

impl ChainError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::OutOfDiskSpace(_))
    }
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfDiskSpace(msg) => write!(f, "out of disk space: {msg}"),
            Self::Storage(msg) => write!(f, "storage error: {msg}"),
            Self::Rejected(msg) => write!(f, "rejected: {msg}"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<io::Error> for ChainError {
    fn from(err: io::Error) -> Self {
        if is_out_of_disk_space(&err) {
            Self::OutOfDiskSpace(err.to_string())
        } else {
            Self::Storage(err.to_string())
        }
    }
}

/// True when `err` reports a full device.
pub fn is_out_of_disk_space(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::StorageFull
        || err.to_string().contains("No space left on device")
}

/// Receives the unrecoverable out-of-disk-space condition.
pub trait FatalHandler: Send + Sync {
    fn on_fatal(&self, error: &str);
}

/// Logs and terminates the process with [`EXIT_OUT_OF_DISK_SPACE`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitOnFatal;

impl FatalHandler for ExitOnFatal {
    #[allow(clippy::exit)]
    fn on_fatal(&self, error: &str) {
        tracing::error!(error, "persistent storage exhausted; exiting");
        std::process::exit(EXIT_OUT_OF_DISK_SPACE);
    }
}

/// Mutation and query surface of the local chain.
///
/// Implementations synchronise internally; every method takes `&self`.
pub trait ChainMutator: Send + Sync {
    /// Imports a contiguous, parent-linked batch in order.
    fn try_to_connect(&self, blocks: &[Block]) -> Result<BatchImport, ChainError>;
    /// Stores a pivot-chain block without requiring its parent.
    fn try_fast_import(&self, block: &Block) -> Result<ImportOutcome, ChainError>;
    fn best_block(&self) -> Block;
    fn total_difficulty(&self) -> U256;
    /// Walks parent links from `block` and returns the first block that is
    /// not stored locally, or `None` when the chain reaches genesis.
    fn find_missing_ancestor(&self, block: &Block) -> Option<BlockId>;
    fn is_block_stored(&self, hash: B256, number: u64) -> bool;
    fn has_block_at(&self, number: u64) -> bool;
    fn has_prune_restriction(&self) -> bool;
    fn is_prune_restricted(&self, number: u64) -> bool;
    fn set_best_block(&self, block: &Block);
    fn prune_and_correct(&self);
    fn flush(&self);
    fn import_trie_node(
        &self,
        key: B256,
        value: &[u8],
        db_type: DatabaseType,
    ) -> Result<TrieNodeOutcome, ChainError>;
}

/// Opaque header validity rule.
pub trait HeaderValidator: Send + Sync {
    fn validate(&self, header: &BlockHeader) -> bool;
}

/// Accepts any header whose hash matches its contents and whose number is
/// above genesis.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicHeaderValidator;

impl HeaderValidator for BasicHeaderValidator {
    fn validate(&self, header: &BlockHeader) -> bool {
        header.number > 0 && header.is_sealed()
    }
}
