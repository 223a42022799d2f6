//! Block, batch, and outcome types shared across the sync engine.

use alloy_primitives::{keccak256, B256, B512, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Node identity of a remote peer.
pub type PeerId = B512;

/// Sealed block header. `hash` is the keccak256 of the remaining fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub parent_hash: B256,
    pub hash: B256,
    pub difficulty: U256,
    pub timestamp: u64,
    pub transactions_root: B256,
    pub state_root: B256,
}

impl BlockHeader {
    /// Builds a header and computes its hash.
    pub fn seal(
        number: u64,
        parent_hash: B256,
        difficulty: U256,
        timestamp: u64,
        transactions_root: B256,
        state_root: B256,
    ) -> Self {
        let mut header = Self {
            number,
            parent_hash,
            hash: B256::ZERO,
            difficulty,
            timestamp,
            transactions_root,
            state_root,
        };
        header.hash = header.compute_hash();
        header
    }

    pub fn compute_hash(&self) -> B256 {
        let mut buf = Vec::with_capacity(8 + 32 + 32 + 8 + 32 + 32);
        buf.extend_from_slice(&self.number.to_be_bytes());
        buf.extend_from_slice(self.parent_hash.as_slice());
        buf.extend_from_slice(&self.difficulty.to_be_bytes::<32>());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(self.transactions_root.as_slice());
        buf.extend_from_slice(self.state_root.as_slice());
        keccak256(&buf)
    }

    pub fn is_sealed(&self) -> bool {
        self.hash == self.compute_hash()
    }

    pub fn id(&self) -> BlockId {
        BlockId {
            hash: self.hash,
            number: self.number,
        }
    }
}

/// Block body: the ordered transaction hashes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBody {
    pub transactions: Vec<B256>,
}

impl BlockBody {
    pub fn transactions_root(&self) -> B256 {
        if self.transactions.is_empty() {
            return B256::ZERO;
        }
        let mut buf = Vec::with_capacity(self.transactions.len() * 32);
        for tx in &self.transactions {
            buf.extend_from_slice(tx.as_slice());
        }
        keccak256(&buf)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub body: BlockBody,
}

impl Block {
    /// Pairs a header with a body, rejecting bodies that do not match the
    /// header's transaction root.
    pub fn assemble(header: BlockHeader, body: BlockBody) -> Option<Self> {
        if body.transactions_root() != header.transactions_root {
            return None;
        }
        Some(Self { header, body })
    }

    pub fn genesis() -> Self {
        let header = BlockHeader::seal(0, B256::ZERO, U256::from(1u64), 0, B256::ZERO, B256::ZERO);
        Self {
            header,
            body: BlockBody::default(),
        }
    }

    /// Builds a child of `self` carrying `transactions`.
    pub fn child(&self, difficulty: U256, timestamp: u64, transactions: Vec<B256>, state_root: B256) -> Self {
        let body = BlockBody { transactions };
        let header = BlockHeader::seal(
            self.number() + 1,
            self.hash(),
            difficulty,
            timestamp,
            body.transactions_root(),
            state_root,
        );
        Self { header, body }
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn hash(&self) -> B256 {
        self.header.hash
    }

    pub fn parent_hash(&self) -> B256 {
        self.header.parent_hash
    }

    pub fn id(&self) -> BlockId {
        self.header.id()
    }
}

/// Hash plus number of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId {
    pub hash: B256,
    pub number: u64,
}

/// Start point of a `RequestBlocks` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockRef {
    Hash(B256),
    Number(u64),
}

/// Header batch received from one peer.
#[derive(Debug, Clone)]
pub struct HeadersWrapper {
    pub peer_id: PeerId,
    pub display_name: String,
    pub headers: Vec<BlockHeader>,
    pub received_at: Instant,
}

impl HeadersWrapper {
    pub fn new(peer_id: PeerId, display_name: impl Into<String>, headers: Vec<BlockHeader>) -> Self {
        Self {
            peer_id,
            display_name: display_name.into(),
            headers,
            received_at: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

/// Assembled block batch received from one peer.
#[derive(Debug, Clone)]
pub struct BlocksWrapper {
    pub peer_id: PeerId,
    pub display_name: String,
    pub blocks: Vec<Block>,
    pub received_at: Instant,
}

impl BlocksWrapper {
    pub fn new(peer_id: PeerId, display_name: impl Into<String>, blocks: Vec<Block>) -> Self {
        Self {
            peer_id,
            display_name: display_name.into(),
            blocks,
            received_at: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn first_number(&self) -> Option<u64> {
        self.blocks.first().map(Block::number)
    }

    pub fn last_number(&self) -> Option<u64> {
        self.blocks.last().map(Block::number)
    }
}

/// Result of handing one block to the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportOutcome {
    NoParent,
    Exist,
    Imported { best: bool },
    Invalid,
}

impl ImportOutcome {
    /// The block is linked into the local chain, canonical or not.
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Exist | Self::Imported { .. })
    }

    pub fn is_best(&self) -> bool {
        matches!(self, Self::Imported { best: true })
    }
}

impl fmt::Display for ImportOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoParent => f.write_str("no_parent"),
            Self::Exist => f.write_str("exist"),
            Self::Imported { best: true } => f.write_str("imported_best"),
            Self::Imported { best: false } => f.write_str("imported_not_best"),
            Self::Invalid => f.write_str("invalid"),
        }
    }
}

/// Result of `try_to_connect` for a whole batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchImport {
    pub best_number: u64,
    pub imported: Vec<B256>,
    /// Outcome of the last block attempted; import stops at the first
    /// `NoParent` or `Invalid`.
    pub outcome: ImportOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseType {
    State,
    Storage,
    Details,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrieNodeOutcome {
    Imported,
    Known,
    Inconsistent,
    InvalidKey,
    InvalidValue,
}

impl TrieNodeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Imported | Self::Known)
    }
}
