//! Fast sync: pivot tracking, trie-node ledger, and pivot-chain block import.

use crate::chain::{ChainMutator, FatalHandler};
use crate::p2p::{PeerRegistry, SyncMessage, TrieNodeResponse};
use crate::sync::cache::RecencyCache;
use crate::sync::stats::{RequestKind, SyncStats};
use crate::types::{Block, BlockId, BlockRef, BlocksWrapper, DatabaseType, ImportOutcome, PeerId, TrieNodeOutcome};
use alloy_primitives::B256;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Blocks asked for per pivot-chain request.
pub const FAST_BLOCKS_REQUEST_SIZE: u32 = 40;
const REQUEST_INTERVAL: Duration = Duration::from_secs(1);
const IDLE_POLL: Duration = Duration::from_secs(1);
const MAX_BUFFERED_BATCHES: usize = 64;
/// Most recent trie import failures kept for inspection.
pub const MAX_RECORDED_FAILURES: usize = 256;

/// The five conditions that together mean fast sync is done.
pub trait CompletenessChecks: Send + Sync {
    fn blocks(&self, fast: &FastSyncCoordinator) -> bool {
        fast.is_complete_block_data()
    }
    fn receipts(&self, fast: &FastSyncCoordinator) -> bool;
    fn world_state(&self, fast: &FastSyncCoordinator) -> bool;
    fn contract_details(&self, fast: &FastSyncCoordinator) -> bool;
    fn storage(&self, fast: &FastSyncCoordinator) -> bool;
}

/// Completeness derived from the coordinator's own ledgers.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrieCompleteness;

impl CompletenessChecks for TrieCompleteness {
    fn receipts(&self, fast: &FastSyncCoordinator) -> bool {
        fast.outstanding_receipts() == 0
    }

    fn world_state(&self, fast: &FastSyncCoordinator) -> bool {
        fast.trie_complete(DatabaseType::State, true)
    }

    fn contract_details(&self, fast: &FastSyncCoordinator) -> bool {
        fast.trie_complete(DatabaseType::Details, false)
    }

    fn storage(&self, fast: &FastSyncCoordinator) -> bool {
        fast.trie_complete(DatabaseType::Storage, false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Rejected(TrieNodeOutcome),
    Error(String),
}

/// Evidence kept for a trie node the chain refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportFailure {
    pub key: B256,
    pub db_type: DatabaseType,
    pub peer_id: PeerId,
    pub display_name: String,
    pub reason: FailureReason,
    pub pivot_number: Option<u64>,
}

/// Decides whether a trie import failure should move the pivot.
pub trait PivotPolicy: Send + Sync {
    fn choose_new_pivot(&self, old_pivot: &Block, evidence: &ImportFailure) -> Block;
}

/// Keeps the current pivot; the failing batch is dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRollback;

impl PivotPolicy for NoRollback {
    fn choose_new_pivot(&self, old_pivot: &Block, _evidence: &ImportFailure) -> Block {
        old_pivot.clone()
    }
}

/// Trie-node response queued for the import consumer.
#[derive(Debug, Clone)]
pub struct TrieNodeJob {
    pub peer_id: PeerId,
    pub display_name: String,
    pub response: TrieNodeResponse,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrieImportReport {
    pub imported: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct TrieLedger {
    imported: HashMap<(DatabaseType, B256), Vec<u8>>,
    imported_count: HashMap<DatabaseType, u64>,
    outstanding: HashMap<DatabaseType, HashSet<B256>>,
}

/// Pivot-chain batches waiting to be consumed by hash.
#[derive(Debug, Default)]
struct FastBlockBuffer {
    batches: Mutex<VecDeque<BlocksWrapper>>,
    notify: Notify,
}

impl FastBlockBuffer {
    fn push(&self, batch: BlocksWrapper) {
        let mut batches = self.batches.lock();
        if batches.len() >= MAX_BUFFERED_BATCHES {
            batches.pop_front();
        }
        batches.push_back(batch);
        drop(batches);
        self.notify.notify_one();
    }

    /// Removes the first buffered batch containing `hash`, blocks sorted from
    /// highest to lowest.
    fn take_containing(&self, hash: B256) -> Option<BlocksWrapper> {
        let mut batches = self.batches.lock();
        let index = batches
            .iter()
            .position(|batch| batch.blocks.iter().any(|block| block.hash() == hash))?;
        let mut batch = batches.remove(index)?;
        batch.blocks.sort_by(|a, b| b.number().cmp(&a.number()));
        Some(batch)
    }

    fn len(&self) -> usize {
        self.batches.lock().len()
    }
}

/// Drives the fast-sync phase alongside the main import pipeline.
pub struct FastSyncCoordinator {
    enabled: bool,
    chain: Arc<dyn ChainMutator>,
    fatal: Arc<dyn FatalHandler>,
    checks: Box<dyn CompletenessChecks>,
    policy: Box<dyn PivotPolicy>,
    pivot: RwLock<Option<Block>>,
    complete_blocks: AtomicBool,
    complete: AtomicBool,
    ledger: Mutex<TrieLedger>,
    receipts: Mutex<HashSet<B256>>,
    failures: Mutex<VecDeque<ImportFailure>>,
    received_blocks: RecencyCache<B256>,
    imported_blocks: RecencyCache<B256>,
    buffer: FastBlockBuffer,
}

impl FastSyncCoordinator {
    pub fn new(
        enabled: bool,
        chain: Arc<dyn ChainMutator>,
        fatal: Arc<dyn FatalHandler>,
        cache_size: usize,
    ) -> Self {
        Self {
            enabled,
            chain,
            fatal,
            checks: Box::new(TrieCompleteness),
            policy: Box::new(NoRollback),
            pivot: RwLock::new(None),
            complete_blocks: AtomicBool::new(false),
            complete: AtomicBool::new(false),
            ledger: Mutex::new(TrieLedger::default()),
            receipts: Mutex::new(HashSet::new()),
            failures: Mutex::new(VecDeque::new()),
            received_blocks: RecencyCache::new(cache_size),
            imported_blocks: RecencyCache::new(cache_size),
            buffer: FastBlockBuffer::default(),
        }
    }

    pub fn with_checks(mut self, checks: Box<dyn CompletenessChecks>) -> Self {
        self.checks = checks;
        self
    }

    pub fn with_pivot_policy(mut self, policy: Box<dyn PivotPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn pivot(&self) -> Option<Block> {
        self.pivot.read().clone()
    }

    /// Selects `block` as pivot. Refused once block data has been promoted.
    pub fn update_pivot(&self, block: Block) -> bool {
        if self.complete_blocks.load(Ordering::SeqCst) {
            warn!(number = block.number(), "block data already complete; pivot change ignored");
            return false;
        }
        let state_root = block.header.state_root;
        info!(number = block.number(), hash = %block.hash(), "fast sync pivot selected");
        let previous = self.pivot.write().replace(block);
        let mut ledger = self.ledger.lock();
        if let Some(previous) = previous {
            if let Some(outstanding) = ledger.outstanding.get_mut(&DatabaseType::State) {
                outstanding.remove(&previous.header.state_root);
            }
        }
        if state_root != B256::ZERO && !ledger.imported.contains_key(&(DatabaseType::State, state_root)) {
            ledger
                .outstanding
                .entry(DatabaseType::State)
                .or_default()
                .insert(state_root);
        }
        true
    }

    /// True once the chain holds every block from genesis to the pivot.
    ///
    /// The first successful check promotes the pivot to best block, then
    /// prunes, corrects, and flushes the chain. That happens once.
    pub fn is_complete_block_data(&self) -> bool {
        if self.complete_blocks.load(Ordering::SeqCst) {
            return true;
        }
        let Some(pivot) = self.pivot() else {
            return false;
        };
        if !self.chain.has_block_at(1) || self.chain.find_missing_ancestor(&pivot).is_some() {
            return false;
        }
        if self
            .complete_blocks
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.chain.set_best_block(&pivot);
            self.chain.prune_and_correct();
            self.chain.flush();
            info!(number = pivot.number(), "fast sync block data complete; pivot promoted to best");
        }
        true
    }

    /// True when fast sync is disabled or every check has passed once.
    pub fn is_complete(&self) -> bool {
        if !self.enabled || self.complete.load(Ordering::SeqCst) {
            return true;
        }
        let checks = self.checks.as_ref();
        let done = checks.blocks(self)
            && checks.receipts(self)
            && checks.world_state(self)
            && checks.contract_details(self)
            && checks.storage(self);
        if done && !self.complete.swap(true, Ordering::SeqCst) {
            info!("fast sync complete");
        }
        done
    }

    /// The node is already recorded with exactly this value.
    pub fn contains_exact(&self, key: B256, value: &[u8], db_type: DatabaseType) -> bool {
        self.ledger
            .lock()
            .imported
            .get(&(db_type, key))
            .is_some_and(|stored| stored.as_slice() == value)
    }

    pub fn add_imported_node(&self, key: B256, value: &[u8], db_type: DatabaseType) {
        let mut ledger = self.ledger.lock();
        if ledger
            .imported
            .insert((db_type, key), value.to_vec())
            .is_none()
        {
            *ledger.imported_count.entry(db_type).or_default() += 1;
        }
    }

    /// Marks `key` fulfilled and its references outstanding unless imported.
    pub fn update_requests(&self, key: B256, referenced: &[B256], db_type: DatabaseType) {
        let mut ledger = self.ledger.lock();
        let ledger = &mut *ledger;
        let outstanding = ledger.outstanding.entry(db_type).or_default();
        outstanding.remove(&key);
        for reference in referenced {
            if !ledger.imported.contains_key(&(db_type, *reference)) {
                outstanding.insert(*reference);
            }
        }
    }

    pub fn outstanding_nodes(&self, db_type: DatabaseType) -> Vec<B256> {
        self.ledger
            .lock()
            .outstanding
            .get(&db_type)
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn imported_node_count(&self, db_type: DatabaseType) -> u64 {
        self.ledger
            .lock()
            .imported_count
            .get(&db_type)
            .copied()
            .unwrap_or(0)
    }

    /// No outstanding nodes of `db_type`, and at least one imported when
    /// `require_imported` is set.
    pub fn trie_complete(&self, db_type: DatabaseType, require_imported: bool) -> bool {
        let ledger = self.ledger.lock();
        let none_outstanding = ledger
            .outstanding
            .get(&db_type)
            .map_or(true, HashSet::is_empty);
        let has_imported = ledger.imported_count.get(&db_type).copied().unwrap_or(0) > 0;
        none_outstanding && (!require_imported || has_imported)
    }

    /// Imports one trie-node response and any payloads it carries for
    /// referenced nodes.
    pub fn process_trie_response(
        &self,
        peer_id: PeerId,
        display_name: &str,
        response: &TrieNodeResponse,
    ) -> TrieImportReport {
        let mut report = TrieImportReport::default();
        let db_type = response.db_type;
        let key = response.node_key;
        if !self.import_node(peer_id, display_name, key, &response.node_value, db_type, &mut report) {
            return report;
        }
        let referenced: Vec<B256> = response.referenced_nodes.keys().copied().collect();
        self.update_requests(key, &referenced, db_type);
        for (reference, value) in &response.referenced_nodes {
            if value.is_empty() {
                continue;
            }
            if self.import_node(peer_id, display_name, *reference, value, db_type, &mut report) {
                self.update_requests(*reference, &[], db_type);
            }
        }
        debug!(
            peer = %display_name,
            db = ?db_type,
            imported = report.imported,
            skipped = report.skipped,
            failed = report.failed,
            "trie response processed"
        );
        report
    }

    fn import_node(
        &self,
        peer_id: PeerId,
        display_name: &str,
        key: B256,
        value: &[u8],
        db_type: DatabaseType,
        report: &mut TrieImportReport,
    ) -> bool {
        if self.contains_exact(key, value, db_type) {
            report.skipped += 1;
            return true;
        }
        let reason = match self.chain.import_trie_node(key, value, db_type) {
            Ok(outcome) if outcome.is_success() => {
                self.add_imported_node(key, value, db_type);
                report.imported += 1;
                return true;
            }
            Ok(outcome) => FailureReason::Rejected(outcome),
            Err(err) => {
                if err.is_fatal() {
                    error!(error = %err, "trie import hit a fatal storage error");
                    self.fatal.on_fatal(&err.to_string());
                }
                FailureReason::Error(err.to_string())
            }
        };
        report.failed += 1;
        self.handle_failed_import(key, db_type, peer_id, display_name, reason);
        false
    }

    /// Records a rejected trie node and consults the pivot policy.
    pub fn handle_failed_import(
        &self,
        key: B256,
        db_type: DatabaseType,
        peer_id: PeerId,
        display_name: &str,
        reason: FailureReason,
    ) {
        let pivot = self.pivot();
        let failure = ImportFailure {
            key,
            db_type,
            peer_id,
            display_name: display_name.to_string(),
            reason,
            pivot_number: pivot.as_ref().map(Block::number),
        };
        warn!(
            peer = %display_name,
            key = %key,
            db = ?db_type,
            reason = ?failure.reason,
            "trie node import failed"
        );
        if let Some(old) = pivot {
            if !self.complete_blocks.load(Ordering::SeqCst) {
                let new = self.policy.choose_new_pivot(&old, &failure);
                if new.hash() != old.hash() {
                    info!(from = old.number(), to = new.number(), "moving fast sync pivot");
                    self.update_pivot(new);
                }
            }
        }
        let mut failures = self.failures.lock();
        if failures.len() >= MAX_RECORDED_FAILURES {
            failures.pop_front();
        }
        failures.push_back(failure);
    }

    /// Recorded failures, oldest first.
    pub fn failures(&self) -> Vec<ImportFailure> {
        self.failures.lock().iter().cloned().collect()
    }

    /// Dedicated consumer for trie-node responses.
    pub async fn run_trie_import(
        self: Arc<Self>,
        mut jobs: mpsc::UnboundedReceiver<TrieNodeJob>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("trie import started");
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                job = jobs.recv() => {
                    let Some(job) = job else {
                        break;
                    };
                    self.process_trie_response(job.peer_id, &job.display_name, &job.response);
                }
            }
        }
        info!("trie import stopped");
    }

    /// Buffers a pivot-chain block response.
    pub fn on_blocks(&self, mut batch: BlocksWrapper) {
        batch
            .blocks
            .retain(|block| !self.imported_blocks.contains(&block.hash()));
        let Some(top) = batch.blocks.iter().max_by_key(|block| block.number()).map(Block::hash) else {
            return;
        };
        if !self.received_blocks.check_and_insert(top) {
            debug!(peer = %batch.display_name, "duplicate pivot-chain batch");
            return;
        }
        self.buffer.push(batch);
    }

    pub fn on_receipts(&self, tx_hashes: &[B256]) -> usize {
        let mut outstanding = self.receipts.lock();
        tx_hashes
            .iter()
            .filter(|hash| outstanding.remove(*hash))
            .count()
    }

    pub fn outstanding_receipts(&self) -> usize {
        self.receipts.lock().len()
    }

    pub fn buffered_batches(&self) -> usize {
        self.buffer.len()
    }

    /// Imports the pivot chain backward until block data is complete, then
    /// keeps asking for outstanding receipts until every one is answered.
    pub async fn run_block_import(
        self: Arc<Self>,
        registry: Arc<dyn PeerRegistry>,
        stats: Arc<SyncStats>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("pivot block import started");
        let mut required: Option<BlockId> = None;
        let mut last_request: Option<Instant> = None;
        let mut last_receipts_request: Option<Instant> = None;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let blocks_done = self.is_complete_block_data();
            if blocks_done && self.outstanding_receipts() == 0 {
                break;
            }
            if !blocks_done {
                if required.is_none() {
                    required = self.pivot().map(|pivot| pivot.id());
                }
                if let Some(target) = required {
                    if let Some(batch) = self.buffer.take_containing(target.hash) {
                        let before = self.outstanding_receipts();
                        required = self.import_pivot_chain(target, &batch, registry.as_ref(), &stats);
                        if self.outstanding_receipts() > before {
                            last_receipts_request = Some(Instant::now());
                        }
                        continue;
                    }
                    let due = last_request.map_or(true, |at| at.elapsed() >= REQUEST_INTERVAL);
                    if due && self.request_pivot_blocks(target, registry.as_ref(), &stats) {
                        last_request = Some(Instant::now());
                    }
                }
            }
            let receipts_due = last_receipts_request.map_or(true, |at| at.elapsed() >= REQUEST_INTERVAL);
            if receipts_due && self.request_outstanding_receipts(registry.as_ref(), &stats) {
                last_receipts_request = Some(Instant::now());
            }
            tokio::select! {
                _ = self.buffer.notify.notified() => {}
                _ = tokio::time::sleep(IDLE_POLL) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("pivot block import stopped");
    }

    /// Walks `batch` from `target` down through parent hashes. Returns the
    /// next block that must be fetched, or `None` when nothing is missing.
    pub fn import_pivot_chain(
        &self,
        target: BlockId,
        batch: &BlocksWrapper,
        registry: &dyn PeerRegistry,
        stats: &SyncStats,
    ) -> Option<BlockId> {
        let mut required = target;
        let mut imported = 0usize;
        let mut tx_hashes = Vec::new();
        let mut finished = false;
        for block in &batch.blocks {
            if block.number() > required.number {
                continue;
            }
            if block.hash() != required.hash {
                debug!(
                    peer = %batch.display_name,
                    expected = %required.hash,
                    got = %block.hash(),
                    "pivot chain broken inside batch"
                );
                break;
            }
            match self.chain.try_fast_import(block) {
                Ok(ImportOutcome::Imported { .. }) => {
                    imported += 1;
                    self.imported_blocks.insert(block.hash());
                    tx_hashes.extend(block.body.transactions.iter().copied());
                    required = BlockId {
                        hash: block.parent_hash(),
                        number: block.number().saturating_sub(1),
                    };
                }
                Ok(ImportOutcome::Exist) => match self.chain.find_missing_ancestor(block) {
                    Some(missing) => required = missing,
                    None => {
                        finished = true;
                        break;
                    }
                },
                Ok(outcome @ (ImportOutcome::NoParent | ImportOutcome::Invalid)) => {
                    warn!(
                        peer = %batch.display_name,
                        number = block.number(),
                        %outcome,
                        "pivot chain block rejected"
                    );
                    break;
                }
                Err(err) => {
                    if err.is_fatal() {
                        error!(error = %err, "fast import hit a fatal storage error");
                        self.fatal.on_fatal(&err.to_string());
                    } else {
                        warn!(error = %err, number = block.number(), "fast import failed");
                    }
                    break;
                }
            }
        }
        if imported > 0 {
            debug!(
                peer = %batch.display_name,
                imported,
                next = required.number,
                "imported pivot chain blocks"
            );
        }
        if !tx_hashes.is_empty() {
            self.receipts.lock().extend(tx_hashes.iter().copied());
            registry.send(batch.peer_id, SyncMessage::RequestReceipts { tx_hashes });
            stats.record_request(batch.peer_id, RequestKind::Receipts);
        }
        (!finished).then_some(required)
    }

    /// Re-asks the best eligible peer for every receipt still outstanding.
    fn request_outstanding_receipts(&self, registry: &dyn PeerRegistry, stats: &SyncStats) -> bool {
        let mut tx_hashes: Vec<B256> = self.receipts.lock().iter().copied().collect();
        if tx_hashes.is_empty() {
            return false;
        }
        let min_number = self.pivot().map_or(0, |pivot| pivot.number());
        let Some((peer_id, display_name)) = best_peer(registry, min_number) else {
            debug!(outstanding = tx_hashes.len(), "no peer can serve receipts yet");
            return false;
        };
        tx_hashes.sort();
        debug!(peer = %display_name, outstanding = tx_hashes.len(), "requesting outstanding receipts");
        registry.send(peer_id, SyncMessage::RequestReceipts { tx_hashes });
        stats.record_request(peer_id, RequestKind::Receipts);
        true
    }

    fn request_pivot_blocks(&self, target: BlockId, registry: &dyn PeerRegistry, stats: &SyncStats) -> bool {
        let Some((peer_id, display_name)) = best_peer(registry, target.number) else {
            debug!(number = target.number, "no peer can serve the pivot chain yet");
            return false;
        };
        debug!(peer = %display_name, number = target.number, "requesting pivot chain blocks");
        registry.send(
            peer_id,
            SyncMessage::RequestBlocks {
                start: BlockRef::Hash(target.hash),
                count: FAST_BLOCKS_REQUEST_SIZE,
                reverse: true,
            },
        );
        stats.record_request(peer_id, RequestKind::Blocks);
        true
    }
}

/// Highest peer whose best block is at least `min_number`.
fn best_peer(registry: &dyn PeerRegistry, min_number: u64) -> Option<(PeerId, String)> {
    registry
        .active_peers()
        .into_iter()
        .filter(|(_, info)| info.best_number >= min_number)
        .max_by(|(a_id, a), (b_id, b)| a.best_number.cmp(&b.best_number).then(b_id.cmp(a_id)))
        .map(|(peer_id, info)| (peer_id, info.display_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::p2p::PeerPool;
    use crate::test_utils::{build_chain, drain, peer, peer_info, pool_with_peers, RecordingFatal};
    use alloy_primitives::{keccak256, U256};

    struct FakeChecks {
        blocks: AtomicBool,
        rest: AtomicBool,
    }

    impl CompletenessChecks for FakeChecks {
        fn blocks(&self, _fast: &FastSyncCoordinator) -> bool {
            self.blocks.load(Ordering::SeqCst)
        }
        fn receipts(&self, _fast: &FastSyncCoordinator) -> bool {
            self.rest.load(Ordering::SeqCst)
        }
        fn world_state(&self, _fast: &FastSyncCoordinator) -> bool {
            self.rest.load(Ordering::SeqCst)
        }
        fn contract_details(&self, _fast: &FastSyncCoordinator) -> bool {
            self.rest.load(Ordering::SeqCst)
        }
        fn storage(&self, _fast: &FastSyncCoordinator) -> bool {
            self.rest.load(Ordering::SeqCst)
        }
    }

    struct Shared(Arc<FakeChecks>);

    impl CompletenessChecks for Shared {
        fn blocks(&self, fast: &FastSyncCoordinator) -> bool {
            self.0.blocks(fast)
        }
        fn receipts(&self, fast: &FastSyncCoordinator) -> bool {
            self.0.receipts(fast)
        }
        fn world_state(&self, fast: &FastSyncCoordinator) -> bool {
            self.0.world_state(fast)
        }
        fn contract_details(&self, fast: &FastSyncCoordinator) -> bool {
            self.0.contract_details(fast)
        }
        fn storage(&self, fast: &FastSyncCoordinator) -> bool {
            self.0.storage(fast)
        }
    }

    fn coordinator(chain: &Arc<MemoryChain>) -> FastSyncCoordinator {
        FastSyncCoordinator::new(
            true,
            Arc::clone(chain) as Arc<dyn ChainMutator>,
            Arc::new(RecordingFatal::default()),
            1024,
        )
    }

    fn descending(blocks: &[Block]) -> BlocksWrapper {
        let mut blocks = blocks.to_vec();
        blocks.reverse();
        BlocksWrapper::new(peer(1), "peer-1", blocks)
    }

    fn trie_node(payload: &[u8]) -> (B256, Vec<u8>) {
        (keccak256(payload), payload.to_vec())
    }

    #[test]
    fn completion_latches_after_first_full_pass() {
        let chain = Arc::new(MemoryChain::new(Block::genesis()));
        let checks = Arc::new(FakeChecks {
            blocks: AtomicBool::new(false),
            rest: AtomicBool::new(true),
        });
        let fast = coordinator(&chain).with_checks(Box::new(Shared(Arc::clone(&checks))));

        assert!(!fast.is_complete());
        checks.blocks.store(true, Ordering::SeqCst);
        checks.rest.store(false, Ordering::SeqCst);
        assert!(!fast.is_complete());
        checks.rest.store(true, Ordering::SeqCst);
        assert!(fast.is_complete());

        checks.blocks.store(false, Ordering::SeqCst);
        checks.rest.store(false, Ordering::SeqCst);
        assert!(fast.is_complete());
    }

    #[test]
    fn disabled_fast_sync_is_always_complete() {
        let chain = Arc::new(MemoryChain::new(Block::genesis()));
        let fast = FastSyncCoordinator::new(
            false,
            chain as Arc<dyn ChainMutator>,
            Arc::new(RecordingFatal::default()),
            16,
        );
        assert!(fast.is_complete());
    }

    #[test]
    fn block_data_completion_promotes_pivot_once() {
        let genesis = Block::genesis();
        let blocks = build_chain(&genesis, 20);
        let chain = Arc::new(MemoryChain::new(genesis));
        let fast = coordinator(&chain);
        let (pool, mut rx) = pool_with_peers(&[]);
        let stats = SyncStats::new(0);

        assert!(!fast.is_complete_block_data());
        fast.update_pivot(blocks[19].clone());
        assert!(!fast.is_complete_block_data());

        let next = fast.import_pivot_chain(blocks[19].id(), &descending(&blocks), &pool, &stats);
        assert_eq!(next, Some(genesis_id(&chain)));
        assert!(fast.is_complete_block_data());
        assert_eq!(chain.best_number(), 20);
        assert_eq!(chain.flush_count(), 1);
        assert_eq!(chain.correction_count(), 1);

        assert!(fast.is_complete_block_data());
        assert_eq!(chain.flush_count(), 1);
        assert!(!fast.update_pivot(blocks[10].clone()));

        let receipts = drain(&mut rx);
        assert_eq!(receipts.len(), 1);
        assert_eq!(fast.outstanding_receipts(), 20);
    }

    fn genesis_id(chain: &MemoryChain) -> BlockId {
        chain.block_by_number(0).expect("genesis").id()
    }

    #[test]
    fn existing_block_stops_walk_when_nothing_is_missing() {
        let genesis = Block::genesis();
        let blocks = build_chain(&genesis, 20);
        let chain = Arc::new(MemoryChain::new(genesis));
        chain.try_to_connect(&blocks[..5]).expect("seed chain");
        let fast = coordinator(&chain);
        let (pool, _rx) = pool_with_peers(&[]);
        let stats = SyncStats::new(0);
        fast.update_pivot(blocks[19].clone());

        let next = fast.import_pivot_chain(blocks[19].id(), &descending(&blocks), &pool, &stats);
        assert_eq!(next, None);
        assert!(fast.is_complete_block_data());
        assert_eq!(chain.best_number(), 20);
    }

    #[test]
    fn existing_block_recomputes_required_from_missing_ancestor() {
        let genesis = Block::genesis();
        let blocks = build_chain(&genesis, 20);
        let chain = Arc::new(MemoryChain::new(genesis));
        chain.try_to_connect(&blocks[..3]).expect("seed chain");
        for block in &blocks[9..12] {
            chain.try_fast_import(block).expect("fast import");
        }
        let fast = coordinator(&chain);
        let (pool, _rx) = pool_with_peers(&[]);
        let stats = SyncStats::new(0);

        // Blocks 15 down to 8; 10..12 are already present from another source.
        let next = fast.import_pivot_chain(blocks[14].id(), &descending(&blocks[7..15]), &pool, &stats);
        assert_eq!(next, Some(blocks[6].id()));
        assert!(chain.block_by_hash(blocks[8].hash()).is_some());
        assert!(chain.block_by_hash(blocks[7].hash()).is_some());
    }

    #[test]
    fn trie_responses_update_ledger_and_skip_exact_duplicates() {
        let chain = Arc::new(MemoryChain::new(Block::genesis()));
        let fast = coordinator(&chain);
        let (root_key, root) = trie_node(b"root");
        let (left_key, left) = trie_node(b"left");
        let (right_key, _) = trie_node(b"right");

        let pivot = Block::genesis().child(U256::from(1u64), 1, Vec::new(), root_key);
        fast.update_pivot(pivot);
        assert_eq!(fast.outstanding_nodes(DatabaseType::State), vec![root_key]);

        let response = TrieNodeResponse {
            node_key: root_key,
            node_value: root.clone(),
            referenced_nodes: HashMap::from([(left_key, left.clone()), (right_key, Vec::new())]),
            db_type: DatabaseType::State,
        };
        let report = fast.process_trie_response(peer(1), "peer-1", &response);
        assert_eq!(report, TrieImportReport { imported: 2, skipped: 0, failed: 0 });
        assert_eq!(fast.outstanding_nodes(DatabaseType::State), vec![right_key]);
        assert!(!fast.trie_complete(DatabaseType::State, true));

        let again = fast.process_trie_response(peer(1), "peer-1", &response);
        assert_eq!(again.skipped, 2);
        assert_eq!(fast.imported_node_count(DatabaseType::State), 2);

        let (_, right) = trie_node(b"right");
        let leaf = TrieNodeResponse {
            node_key: right_key,
            node_value: right,
            referenced_nodes: HashMap::new(),
            db_type: DatabaseType::State,
        };
        fast.process_trie_response(peer(2), "peer-2", &leaf);
        assert!(fast.trie_complete(DatabaseType::State, true));
        assert!(fast.trie_complete(DatabaseType::Storage, false));
        assert!(TrieCompleteness.world_state(&fast));
    }

    #[test]
    fn rejected_node_is_recorded_and_pivot_kept_by_default() {
        let genesis = Block::genesis();
        let blocks = build_chain(&genesis, 3);
        let chain = Arc::new(MemoryChain::new(genesis));
        let fast = coordinator(&chain);
        fast.update_pivot(blocks[2].clone());

        let response = TrieNodeResponse {
            node_key: B256::with_last_byte(9),
            node_value: b"not matching".to_vec(),
            referenced_nodes: HashMap::new(),
            db_type: DatabaseType::Storage,
        };
        let report = fast.process_trie_response(peer(3), "peer-3", &response);
        assert_eq!(report.failed, 1);
        let failures = fast.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].peer_id, peer(3));
        assert_eq!(failures[0].reason, FailureReason::Rejected(TrieNodeOutcome::InvalidKey));
        assert_eq!(failures[0].pivot_number, Some(3));
        assert_eq!(fast.pivot().map(|p| p.number()), Some(3));
    }

    #[test]
    fn pivot_policy_can_move_the_pivot() {
        struct StepBack(Block);
        impl PivotPolicy for StepBack {
            fn choose_new_pivot(&self, _old: &Block, _evidence: &ImportFailure) -> Block {
                self.0.clone()
            }
        }

        let genesis = Block::genesis();
        let blocks = build_chain(&genesis, 3);
        let chain = Arc::new(MemoryChain::new(genesis));
        let fast = coordinator(&chain).with_pivot_policy(Box::new(StepBack(blocks[0].clone())));
        fast.update_pivot(blocks[2].clone());
        fast.handle_failed_import(
            B256::ZERO,
            DatabaseType::State,
            peer(1),
            "peer-1",
            FailureReason::Error("bad".to_string()),
        );
        assert_eq!(fast.pivot().map(|p| p.number()), Some(1));
    }

    #[test]
    fn duplicate_block_batches_are_buffered_once() {
        let genesis = Block::genesis();
        let blocks = build_chain(&genesis, 5);
        let chain = Arc::new(MemoryChain::new(genesis));
        let fast = coordinator(&chain);
        fast.on_blocks(descending(&blocks));
        fast.on_blocks(descending(&blocks));
        assert_eq!(fast.buffered_batches(), 1);
        assert_eq!(fast.on_receipts(&[B256::ZERO]), 0);
    }

    #[tokio::test]
    async fn block_import_task_requests_and_walks_pivot_chain() {
        let genesis = Block::genesis();
        let blocks = build_chain(&genesis, 60);
        let chain = Arc::new(MemoryChain::new(genesis));
        let fast = Arc::new(coordinator(&chain));
        fast.update_pivot(blocks[59].clone());

        let (pool, mut rx) = PeerPool::new();
        pool.upsert_peer(peer(1), peer_info(60, 61));
        let pool = Arc::new(pool);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&fast).run_block_import(
            Arc::clone(&pool) as Arc<dyn PeerRegistry>,
            Arc::new(SyncStats::new(0)),
            shutdown_rx,
        ));

        let by_hash: HashMap<B256, usize> = blocks
            .iter()
            .enumerate()
            .map(|(index, block)| (block.hash(), index))
            .collect();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !fast.is_complete_block_data() && tokio::time::Instant::now() < deadline {
            let Ok(Some(message)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await else {
                continue;
            };
            if let SyncMessage::RequestBlocks {
                start: BlockRef::Hash(hash),
                count,
                reverse: true,
            } = message.message
            {
                let top = by_hash[&hash];
                let low = top.saturating_sub(count as usize - 1);
                fast.on_blocks(descending(&blocks[low..=top]));
            }
        }
        assert!(fast.is_complete_block_data());
        shutdown_tx.send(true).expect("shutdown");
        task.await.expect("join");
        assert_eq!(chain.best_number(), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_receipts_are_requested_again() {
        let genesis = Block::genesis();
        let blocks = build_chain(&genesis, 10);
        let chain = Arc::new(MemoryChain::new(genesis));
        let fast = Arc::new(coordinator(&chain));
        fast.update_pivot(blocks[9].clone());

        let (pool, mut rx) = PeerPool::new();
        pool.upsert_peer(peer(1), peer_info(10, 11));
        let pool = Arc::new(pool);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&fast).run_block_import(
            Arc::clone(&pool) as Arc<dyn PeerRegistry>,
            Arc::new(SyncStats::new(0)),
            shutdown_rx,
        ));

        let mut receipts_requests = 0;
        while !(fast.is_complete_block_data() && fast.outstanding_receipts() == 0) {
            let message = tokio::time::timeout(Duration::from_secs(30), rx.recv())
                .await
                .expect("importer keeps asking")
                .expect("outbox open");
            match message.message {
                SyncMessage::RequestBlocks { reverse: true, .. } => {
                    fast.on_blocks(descending(&blocks));
                }
                SyncMessage::RequestReceipts { tx_hashes } => {
                    receipts_requests += 1;
                    // The first reply is lost.
                    if receipts_requests > 1 {
                        assert_eq!(tx_hashes.len(), 10);
                        fast.on_receipts(&tx_hashes);
                    }
                }
                _ => {}
            }
        }
        assert!(receipts_requests >= 2);
        assert!(TrieCompleteness.receipts(&fast));
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("importer exits once receipts are in")
            .expect("join");
    }

    #[test]
    fn failure_log_keeps_only_recent_entries() {
        let chain = Arc::new(MemoryChain::new(Block::genesis()));
        let fast = coordinator(&chain);
        let total = MAX_RECORDED_FAILURES + 5;
        for index in 0..total {
            fast.handle_failed_import(
                keccak256((index as u64).to_be_bytes()),
                DatabaseType::State,
                peer(1),
                "peer-1",
                FailureReason::Error("bad node".to_string()),
            );
        }
        let failures = fast.failures();
        assert_eq!(failures.len(), MAX_RECORDED_FAILURES);
        assert_eq!(failures[0].key, keccak256(5u64.to_be_bytes()));
        assert_eq!(
            failures[MAX_RECORDED_FAILURES - 1].key,
            keccak256(((total - 1) as u64).to_be_bytes())
        );
    }
}
