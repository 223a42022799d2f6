//! In-memory chain with canonical tracking and total-difficulty fork choice.

use super::{ChainError, ChainMutator};
use crate::types::{
    BatchImport, Block, BlockHeader, BlockId, DatabaseType, ImportOutcome, TrieNodeOutcome,
};
use alloy_primitives::{keccak256, B256, U256};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug)]
struct ChainState {
    blocks: HashMap<B256, Block>,
    total_difficulty: HashMap<B256, U256>,
    canonical: BTreeMap<u64, B256>,
    canonical_by_hash: HashMap<B256, u64>,
    best: B256,
    prune_floor: Option<u64>,
    trie_nodes: HashMap<(DatabaseType, B256), Vec<u8>>,
    injected_failure: Option<ChainError>,
    connected: Vec<B256>,
    flushes: u64,
    corrections: u64,
}

impl ChainState {
    fn best_td(&self) -> U256 {
        self.total_difficulty
            .get(&self.best)
            .copied()
            .unwrap_or_default()
    }

    fn import_block(&mut self, block: &Block) -> ImportOutcome {
        let hash = block.hash();
        if self.blocks.contains_key(&hash) {
            return ImportOutcome::Exist;
        }
        let Some(parent) = self.blocks.get(&block.parent_hash()) else {
            return ImportOutcome::NoParent;
        };
        if parent.number() + 1 != block.number()
            || !block.header.is_sealed()
            || block.body.transactions_root() != block.header.transactions_root
        {
            return ImportOutcome::Invalid;
        }
        let parent_td = self.total_difficulty.get(&block.parent_hash()).copied();
        self.blocks.insert(hash, block.clone());
        let Some(parent_td) = parent_td else {
            // Parent came in through fast import and is not linked to genesis yet.
            return ImportOutcome::Imported { best: false };
        };
        let td = parent_td + block.header.difficulty;
        self.total_difficulty.insert(hash, td);
        if td > self.best_td() {
            self.set_canonical_head(hash);
            ImportOutcome::Imported { best: true }
        } else {
            ImportOutcome::Imported { best: false }
        }
    }

    /// Rewrites the canonical index so that it ends at `head`.
    fn set_canonical_head(&mut self, head: B256) {
        let Some(head_number) = self.blocks.get(&head).map(Block::number) else {
            return;
        };
        let stale: Vec<u64> = self
            .canonical
            .range((head_number + 1)..)
            .map(|(number, _)| *number)
            .collect();
        for number in stale {
            if let Some(hash) = self.canonical.remove(&number) {
                self.canonical_by_hash.remove(&hash);
            }
        }

        let mut cursor = head;
        while let Some(block) = self.blocks.get(&cursor) {
            let number = block.number();
            if self.canonical.get(&number) == Some(&cursor) {
                break;
            }
            if let Some(old) = self.canonical.insert(number, cursor) {
                self.canonical_by_hash.remove(&old);
            }
            self.canonical_by_hash.insert(cursor, number);
            if number == 0 {
                break;
            }
            cursor = block.parent_hash();
        }
        self.best = head;
    }

    /// Fills in total difficulty for blocks between `hash` and the nearest
    /// ancestor that already has it.
    fn recompute_total_difficulty(&mut self, hash: B256) {
        let mut path = Vec::new();
        let mut cursor = hash;
        while !self.total_difficulty.contains_key(&cursor) {
            match self.blocks.get(&cursor) {
                Some(block) => {
                    path.push((cursor, block.header.difficulty));
                    cursor = block.parent_hash();
                }
                None => break,
            }
        }
        let mut td = self
            .total_difficulty
            .get(&cursor)
            .copied()
            .unwrap_or_default();
        for (hash, difficulty) in path.into_iter().rev() {
            td += difficulty;
            self.total_difficulty.insert(hash, td);
        }
    }
}

/// Reference [`ChainMutator`] backed by hash maps.
#[derive(Debug)]
pub struct MemoryChain {
    state: Mutex<ChainState>,
}

impl MemoryChain {
    pub fn new(genesis: Block) -> Self {
        let hash = genesis.hash();
        let td = genesis.header.difficulty;
        let mut state = ChainState {
            blocks: HashMap::new(),
            total_difficulty: HashMap::new(),
            canonical: BTreeMap::new(),
            canonical_by_hash: HashMap::new(),
            best: hash,
            prune_floor: None,
            trie_nodes: HashMap::new(),
            injected_failure: None,
            connected: Vec::new(),
            flushes: 0,
            corrections: 0,
        };
        state.blocks.insert(hash, genesis);
        state.total_difficulty.insert(hash, td);
        state.set_canonical_head(hash);
        Self {
            state: Mutex::new(state),
        }
    }

    /// Marks every height below `floor` as pruned.
    pub fn with_prune_floor(self, floor: u64) -> Self {
        self.state.lock().prune_floor = Some(floor);
        self
    }

    /// Makes the next `try_to_connect` or `try_fast_import` fail with `err`.
    pub fn fail_next_import(&self, err: ChainError) {
        self.state.lock().injected_failure = Some(err);
    }

    /// Every hash handed to `try_to_connect`, in call order.
    pub fn connected_hashes(&self) -> Vec<B256> {
        self.state.lock().connected.clone()
    }

    pub fn canonical_hash(&self, number: u64) -> Option<B256> {
        self.state.lock().canonical.get(&number).copied()
    }

    pub fn block_by_hash(&self, hash: B256) -> Option<Block> {
        self.state.lock().blocks.get(&hash).cloned()
    }

    pub fn block_by_number(&self, number: u64) -> Option<Block> {
        let state = self.state.lock();
        state
            .canonical
            .get(&number)
            .and_then(|hash| state.blocks.get(hash))
            .cloned()
    }

    /// Canonical headers `from..from + count`, stopping at the first gap.
    pub fn canonical_headers(&self, from: u64, count: usize) -> Vec<BlockHeader> {
        let state = self.state.lock();
        state
            .canonical
            .range(from..)
            .take(count)
            .map_while(|(_, hash)| state.blocks.get(hash).map(|block| block.header.clone()))
            .collect()
    }

    pub fn best_number(&self) -> u64 {
        let state = self.state.lock();
        state.blocks.get(&state.best).map(Block::number).unwrap_or(0)
    }

    pub fn trie_node(&self, db_type: DatabaseType, key: B256) -> Option<Vec<u8>> {
        self.state.lock().trie_nodes.get(&(db_type, key)).cloned()
    }

    pub fn flush_count(&self) -> u64 {
        self.state.lock().flushes
    }

    pub fn correction_count(&self) -> u64 {
        self.state.lock().corrections
    }
}

impl ChainMutator for MemoryChain {
    fn try_to_connect(&self, blocks: &[Block]) -> Result<BatchImport, ChainError> {
        let mut state = self.state.lock();
        if let Some(err) = state.injected_failure.take() {
            return Err(err);
        }
        let mut imported = Vec::new();
        let mut outcome = ImportOutcome::Exist;
        for block in blocks {
            state.connected.push(block.hash());
            outcome = state.import_block(block);
            match outcome {
                ImportOutcome::Imported { .. } => imported.push(block.hash()),
                ImportOutcome::Exist => {}
                ImportOutcome::NoParent | ImportOutcome::Invalid => break,
            }
        }
        let best_number = state.blocks.get(&state.best).map(Block::number).unwrap_or(0);
        Ok(BatchImport {
            best_number,
            imported,
            outcome,
        })
    }

    fn try_fast_import(&self, block: &Block) -> Result<ImportOutcome, ChainError> {
        let mut state = self.state.lock();
        if let Some(err) = state.injected_failure.take() {
            return Err(err);
        }
        let hash = block.hash();
        if state.blocks.contains_key(&hash) {
            return Ok(ImportOutcome::Exist);
        }
        if !block.header.is_sealed() {
            return Ok(ImportOutcome::Invalid);
        }
        let number = block.number();
        if let Some(parent_td) = state.total_difficulty.get(&block.parent_hash()).copied() {
            state
                .total_difficulty
                .insert(hash, parent_td + block.header.difficulty);
        }
        state.blocks.insert(hash, block.clone());
        if let Some(old) = state.canonical.insert(number, hash) {
            state.canonical_by_hash.remove(&old);
        }
        state.canonical_by_hash.insert(hash, number);
        Ok(ImportOutcome::Imported { best: false })
    }

    fn best_block(&self) -> Block {
        let state = self.state.lock();
        state
            .blocks
            .get(&state.best)
            .cloned()
            .unwrap_or_else(Block::genesis)
    }

    fn total_difficulty(&self) -> U256 {
        self.state.lock().best_td()
    }

    fn find_missing_ancestor(&self, block: &Block) -> Option<BlockId> {
        let state = self.state.lock();
        let mut number = block.number();
        let mut parent = block.parent_hash();
        loop {
            if number == 0 || state.total_difficulty.contains_key(&parent) {
                return None;
            }
            match state.blocks.get(&parent) {
                Some(ancestor) => {
                    number = ancestor.number();
                    parent = ancestor.parent_hash();
                }
                None => {
                    return Some(BlockId {
                        hash: parent,
                        number: number - 1,
                    })
                }
            }
        }
    }

    fn is_block_stored(&self, hash: B256, number: u64) -> bool {
        self.state
            .lock()
            .blocks
            .get(&hash)
            .is_some_and(|block| block.number() == number)
    }

    fn has_block_at(&self, number: u64) -> bool {
        self.state.lock().canonical.contains_key(&number)
    }

    fn has_prune_restriction(&self) -> bool {
        self.state.lock().prune_floor.is_some()
    }

    fn is_prune_restricted(&self, number: u64) -> bool {
        self.state
            .lock()
            .prune_floor
            .is_some_and(|floor| number < floor)
    }

    fn set_best_block(&self, block: &Block) {
        let mut state = self.state.lock();
        let hash = block.hash();
        state.blocks.entry(hash).or_insert_with(|| block.clone());
        state.recompute_total_difficulty(hash);
        state.set_canonical_head(hash);
    }

    fn prune_and_correct(&self) {
        let mut state = self.state.lock();
        let best = state.best;
        state.recompute_total_difficulty(best);
        state.set_canonical_head(best);
        state.corrections += 1;
    }

    fn flush(&self) {
        self.state.lock().flushes += 1;
    }

    fn import_trie_node(
        &self,
        key: B256,
        value: &[u8],
        db_type: DatabaseType,
    ) -> Result<TrieNodeOutcome, ChainError> {
        if value.is_empty() {
            return Ok(TrieNodeOutcome::InvalidValue);
        }
        if keccak256(value) != key {
            return Ok(TrieNodeOutcome::InvalidKey);
        }
        let mut state = self.state.lock();
        match state.trie_nodes.get(&(db_type, key)) {
            Some(existing) if existing.as_slice() == value => Ok(TrieNodeOutcome::Known),
            Some(_) => Ok(TrieNodeOutcome::Inconsistent),
            None => {
                state.trie_nodes.insert((db_type, key), value.to_vec());
                Ok(TrieNodeOutcome::Imported)
            }
        }
    }
}
