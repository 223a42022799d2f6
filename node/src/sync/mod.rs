//! Block sync engine: header scheduling, body matching, ordered import, fast
//! sync, and new-block propagation.

pub mod assembler;
pub mod cache;
pub mod fast;
pub mod headers;
pub mod import;
pub mod mode;
pub mod propagation;
pub mod queue;
pub mod scheduler;
pub mod stats;

use crate::chain::{BasicHeaderValidator, ChainMutator, ExitOnFatal, FatalHandler, HeaderValidator};
use crate::cli::SyncConfig;
use crate::metrics::{eta, lag_behind};
use crate::p2p::{PeerRegistry, StatusResponse, SyncMessage, TrieNodeResponse};
use crate::storage::PendingBlockStore;
use crate::types::{Block, BlockBody, BlockHeader, BlocksWrapper, HeadersWrapper, PeerId};
use alloy_primitives::{B256, U256};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use self::assembler::assemble_batch;
use self::cache::RecencyCache;
use self::fast::{FastSyncCoordinator, TrieNodeJob};
use self::headers::validate_headers;
use self::import::ImportPipeline;
use self::mode::{ModeTable, SyncMode};
use self::propagation::{PropagationGuard, PropagationStatus};
use self::queue::{ImportQueue, PushOutcome};
use self::scheduler::{HeaderRequest, RequestScheduler};
use self::stats::{RequestKind, SyncStats, SyncStatsSnapshot};

/// Minimum spacing between network-status updates.
const NETWORK_STATUS_THROTTLE: Duration = Duration::from_secs(1);

/// Collaborators the engine runs against.
pub struct SyncContext {
    pub chain: Arc<dyn ChainMutator>,
    pub registry: Arc<dyn PeerRegistry>,
    pub pending: Arc<dyn PendingBlockStore>,
    pub validator: Arc<dyn HeaderValidator>,
    pub fatal: Arc<dyn FatalHandler>,
}

impl SyncContext {
    pub fn new(
        chain: Arc<dyn ChainMutator>,
        registry: Arc<dyn PeerRegistry>,
        pending: Arc<dyn PendingBlockStore>,
    ) -> Self {
        Self {
            chain,
            registry,
            pending,
            validator: Arc::new(BasicHeaderValidator),
            fatal: Arc::new(ExitOnFatal),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn HeaderValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_fatal_handler(mut self, fatal: Arc<dyn FatalHandler>) -> Self {
        self.fatal = fatal;
        self
    }
}

/// Best chain advertised by any peer, as last accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkStatus {
    pub display_name: String,
    pub total_difficulty: U256,
    pub best_number: u64,
    pub best_hash: B256,
}

/// Point-in-time view of sync progress.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatusSnapshot {
    pub local_best: u64,
    pub network: NetworkStatus,
    pub lag: Option<u64>,
    pub avg_blocks_per_sec: Option<f64>,
    pub eta_secs: Option<u64>,
    pub import_queue_len: usize,
    pub pending_queues: usize,
    pub header_batches: usize,
    pub peers_backward: usize,
    pub peers_forward: usize,
    pub fast_sync_complete: bool,
    pub stats: SyncStatsSnapshot,
}

#[derive(Debug, Default)]
struct NetworkTracker {
    status: NetworkStatus,
    updated_at: Option<Instant>,
}

/// Wires the sync components together and owns their shared state.
pub struct SyncManager {
    config: SyncConfig,
    chain: Arc<dyn ChainMutator>,
    registry: Arc<dyn PeerRegistry>,
    pending: Arc<dyn PendingBlockStore>,
    validator: Arc<dyn HeaderValidator>,
    fatal: Arc<dyn FatalHandler>,
    scheduler: RequestScheduler,
    modes: Arc<ModeTable>,
    stats: Arc<SyncStats>,
    queue: Arc<ImportQueue>,
    imported: Arc<RecencyCache<B256>>,
    fast: Arc<FastSyncCoordinator>,
    propagation: PropagationGuard,
    network: Mutex<NetworkTracker>,
    header_trigger: Notify,
    trie_jobs: mpsc::UnboundedSender<TrieNodeJob>,
    trie_rx: Mutex<Option<mpsc::UnboundedReceiver<TrieNodeJob>>>,
}

impl SyncManager {
    pub fn new(config: SyncConfig, ctx: SyncContext) -> Arc<Self> {
        let fast = FastSyncCoordinator::new(
            config.fast_sync,
            Arc::clone(&ctx.chain),
            Arc::clone(&ctx.fatal),
            config.imported_cache_size,
        );
        Self::with_fast_sync(config, ctx, fast)
    }

    /// Like [`SyncManager::new`] with a caller-built fast-sync coordinator,
    /// e.g. one carrying a custom pivot policy.
    pub fn with_fast_sync(config: SyncConfig, ctx: SyncContext, fast: FastSyncCoordinator) -> Arc<Self> {
        let seed = config.seed.unwrap_or_else(rand::random);
        let best = ctx.chain.best_block().number();
        info!(seed, best, fast_sync = config.fast_sync, "sync engine initialised");

        let modes = Arc::new(ModeTable::new());
        let stats = Arc::new(SyncStats::new(best));
        let imported = Arc::new(RecencyCache::new(config.imported_cache_size));
        let queue = Arc::new(ImportQueue::new(
            config.blocks_queue_max,
            config.import_slack,
            Arc::clone(&ctx.pending),
        ));
        let scheduler = RequestScheduler::new(
            config.scheduler_config(seed),
            Arc::clone(&modes),
            Arc::clone(&stats),
        );
        let propagation = PropagationGuard::new(
            Arc::clone(&ctx.chain),
            Arc::clone(&ctx.registry),
            Arc::clone(&ctx.validator),
            Arc::clone(&ctx.fatal),
            Arc::clone(&imported),
            config.propagation_cache_size,
            config.sync_only_node,
        );
        let (trie_jobs, trie_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            chain: ctx.chain,
            registry: ctx.registry,
            pending: ctx.pending,
            validator: ctx.validator,
            fatal: ctx.fatal,
            scheduler,
            modes,
            stats,
            queue,
            imported,
            fast: Arc::new(fast),
            propagation,
            network: Mutex::new(NetworkTracker::default()),
            header_trigger: Notify::new(),
            trie_jobs,
            trie_rx: Mutex::new(Some(trie_rx)),
        })
    }

    /// Spawns the periodic tickers, the import consumer, and the fast-sync
    /// tasks when enabled.
    pub fn start(self: &Arc<Self>) -> SyncHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        tasks.push((
            "header_requests",
            tokio::spawn(Arc::clone(self).run_header_requests(shutdown_rx.clone())),
        ));
        tasks.push((
            "status_requests",
            tokio::spawn(Arc::clone(self).run_status_requests(shutdown_rx.clone())),
        ));

        let mut pipeline = ImportPipeline::new(
            Arc::clone(&self.chain),
            Arc::clone(&self.queue),
            Arc::clone(&self.pending),
            Arc::clone(&self.imported),
            Arc::clone(&self.modes),
            Arc::clone(&self.stats),
            Arc::clone(&self.fatal),
        );
        if self.fast.is_enabled() {
            pipeline = pipeline.with_fast_sync(Arc::clone(&self.fast));
            if let Some(trie_rx) = self.trie_rx.lock().take() {
                tasks.push((
                    "trie_import",
                    tokio::spawn(Arc::clone(&self.fast).run_trie_import(trie_rx, shutdown_rx.clone())),
                ));
            }
            tasks.push((
                "pivot_blocks",
                tokio::spawn(Arc::clone(&self.fast).run_block_import(
                    Arc::clone(&self.registry),
                    Arc::clone(&self.stats),
                    shutdown_rx.clone(),
                )),
            ));
        }
        tasks.push(("import_pipeline", tokio::spawn(pipeline.run(shutdown_rx.clone()))));

        if self.config.show_status {
            tasks.push((
                "status_log",
                tokio::spawn(Arc::clone(self).run_status_log(shutdown_rx)),
            ));
        }

        info!(tasks = tasks.len(), "sync engine started");
        SyncHandle {
            shutdown: shutdown_tx,
            queue: Arc::clone(&self.queue),
            tasks,
            timeout: self.config.shutdown_timeout(),
        }
    }

    async fn run_header_requests(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.header_request_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.header_trigger.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
            self.request_headers();
        }
        debug!("header request ticker stopped");
    }

    async fn run_status_requests(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.status_request_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
            self.request_status();
        }
        debug!("status request ticker stopped");
    }

    async fn run_status_log(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.status_log_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
            self.log_status();
        }
    }

    /// One header scheduling pass against the current local best.
    pub fn request_headers(&self) -> Vec<HeaderRequest> {
        let best = self.chain.best_block().number();
        let td = self.chain.total_difficulty();
        let requests = self
            .scheduler
            .send_header_requests(best, td, self.registry.as_ref());
        self.stats.set_network_best(self.scheduler.network_height());
        if !requests.is_empty() {
            debug!(best, requests = requests.len(), "header requests sent");
        }
        requests
    }

    /// Sends `RequestStatus` to every active peer.
    pub fn request_status(&self) -> usize {
        let peers = self.registry.active_peers();
        for peer_id in peers.keys() {
            self.registry.send(*peer_id, SyncMessage::RequestStatus);
            self.stats.record_request(*peer_id, RequestKind::Status);
        }
        peers.len()
    }

    /// Applies a status reply. Returns `true` when it triggered an immediate
    /// header pass.
    pub fn on_status(&self, peer_id: PeerId, display_name: &str, status: &StatusResponse) -> bool {
        self.stats.record_response(peer_id, RequestKind::Status);
        self.stats.set_network_best(status.best_number);
        {
            let now = Instant::now();
            let mut network = self.network.lock();
            let throttled = network
                .updated_at
                .is_some_and(|at| now.saturating_duration_since(at) < NETWORK_STATUS_THROTTLE);
            if !throttled && status.total_difficulty >= network.status.total_difficulty {
                network.status = NetworkStatus {
                    display_name: display_name.to_string(),
                    total_difficulty: status.total_difficulty,
                    best_number: status.best_number,
                    best_hash: status.best_hash,
                };
                network.updated_at = Some(now);
                debug!(
                    peer = %display_name,
                    number = status.best_number,
                    latency_ms = status.latency_ms,
                    "network status updated"
                );
            }
        }
        if status.total_difficulty > self.chain.total_difficulty() {
            self.header_trigger.notify_one();
            return true;
        }
        false
    }

    /// Validates a header response, stores it for body matching, and asks
    /// the peer for the bodies. Returns the number of bodies requested.
    pub fn on_headers(&self, peer_id: PeerId, display_name: &str, headers: Vec<BlockHeader>) -> usize {
        self.stats.record_response(peer_id, RequestKind::Headers);
        let batch = HeadersWrapper::new(peer_id, display_name, headers);
        let Some(batch) = validate_headers(batch, self.validator.as_ref(), &self.imported) else {
            return 0;
        };
        let header_hashes: Vec<B256> = batch.headers.iter().map(|header| header.hash).collect();
        let count = header_hashes.len();
        self.scheduler.store_headers(batch);
        self.registry
            .send(peer_id, SyncMessage::RequestBodies { header_hashes });
        self.stats.record_request(peer_id, RequestKind::Bodies);
        count
    }

    /// Pairs a body response with its stored headers and queues the
    /// assembled batch.
    pub fn on_bodies(&self, peer_id: PeerId, bodies: Vec<BlockBody>) -> Option<PushOutcome> {
        self.stats.record_response(peer_id, RequestKind::Bodies);
        let Some(headers) = self.scheduler.match_headers(&peer_id, bodies.len()) else {
            debug!(peer_id = ?peer_id, bodies = bodies.len(), "no stored headers match body response");
            return None;
        };
        let batch = assemble_batch(headers, bodies)?;
        self.stats.record_received(peer_id, batch.len() as u64);
        self.enqueue(batch)
    }

    /// Routes a block response: pivot-chain data while fast sync still needs
    /// blocks, the import queue otherwise.
    pub fn on_blocks(&self, peer_id: PeerId, display_name: &str, mut blocks: Vec<Block>) -> Option<PushOutcome> {
        self.stats.record_response(peer_id, RequestKind::Blocks);
        self.stats.record_received(peer_id, blocks.len() as u64);
        if self.fast.is_enabled() && !self.fast.is_complete_block_data() {
            self.fast
                .on_blocks(BlocksWrapper::new(peer_id, display_name, blocks));
            return None;
        }
        blocks.sort_by_key(Block::number);
        self.enqueue(BlocksWrapper::new(peer_id, display_name, blocks))
    }

    pub fn on_trie_node(&self, peer_id: PeerId, display_name: &str, response: TrieNodeResponse) -> bool {
        if !self.fast.is_enabled() {
            debug!(peer = %display_name, "trie node received with fast sync disabled");
            return false;
        }
        self.trie_jobs
            .send(TrieNodeJob {
                peer_id,
                display_name: display_name.to_string(),
                response,
            })
            .is_ok()
    }

    pub fn on_receipts(&self, peer_id: PeerId, tx_hashes: &[B256]) -> usize {
        self.stats.record_response(peer_id, RequestKind::Receipts);
        self.fast.on_receipts(tx_hashes)
    }

    pub fn on_new_block(&self, peer_id: PeerId, display_name: &str, block: &Block) -> PropagationStatus {
        let status = self
            .propagation
            .process_incoming_block(peer_id, display_name, block);
        if matches!(status, PropagationStatus::Connected | PropagationStatus::PropConnected) {
            self.stats.update_best(self.chain.best_block().number());
        }
        status
    }

    pub fn broadcast_new_block(&self, block: &Block) -> usize {
        self.propagation.send_new_block(block)
    }

    /// Selects the fast-sync pivot.
    pub fn set_pivot(&self, block: Block) -> bool {
        self.fast.update_pivot(block)
    }

    fn enqueue(&self, batch: BlocksWrapper) -> Option<PushOutcome> {
        let peer_id = batch.peer_id;
        match self.queue.push(batch, self.chain.best_block().number()) {
            Ok(PushOutcome::Diverted(stored)) => {
                self.stats.record_stored(peer_id, stored as u64);
                Some(PushOutcome::Diverted(stored))
            }
            Ok(outcome) => Some(outcome),
            Err(err) if err.is_fatal() => {
                error!(error = %err, "pending store exhausted disk space");
                self.fatal.on_fatal(&err.to_string());
                None
            }
            Err(err) => {
                warn!(error = %err, "failed to divert batch to pending store");
                None
            }
        }
    }

    pub fn status_snapshot(&self) -> SyncStatusSnapshot {
        let local_best = self.chain.best_block().number();
        let network = self.network.lock().status.clone();
        let network_best = network.best_number.max(self.scheduler.network_height());
        let modes = self.modes.counts();
        let lag = lag_behind(network_best, local_best);
        let avg_blocks_per_sec = self.stats.update_best(local_best);
        SyncStatusSnapshot {
            local_best,
            lag,
            network,
            avg_blocks_per_sec,
            eta_secs: eta(lag, avg_blocks_per_sec).map(|left| left.as_secs()),
            import_queue_len: self.queue.len(),
            pending_queues: self.pending.queue_count(),
            header_batches: self.scheduler.stored_header_batches(),
            peers_backward: modes.get(&SyncMode::Backward).copied().unwrap_or(0),
            peers_forward: modes.get(&SyncMode::Forward).copied().unwrap_or(0),
            fast_sync_complete: self.fast.is_complete(),
            stats: self.stats.snapshot(),
        }
    }

    fn log_status(&self) {
        let status = self.status_snapshot();
        info!(
            local_best = status.local_best,
            network_best = status.network.best_number,
            lag = ?status.lag,
            blocks_per_sec = ?status.avg_blocks_per_sec,
            eta_secs = ?status.eta_secs,
            queue = status.import_queue_len,
            pending = status.pending_queues,
            "sync status"
        );
    }

    pub fn scheduler(&self) -> &RequestScheduler {
        &self.scheduler
    }

    pub fn fast_sync(&self) -> &Arc<FastSyncCoordinator> {
        &self.fast
    }

    pub fn stats(&self) -> &Arc<SyncStats> {
        &self.stats
    }

    pub fn network_status(&self) -> NetworkStatus {
        self.network.lock().status.clone()
    }

    pub fn import_queue_len(&self) -> usize {
        self.queue.len()
    }
}

/// Running engine tasks.
pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    queue: Arc<ImportQueue>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    timeout: Duration,
}

impl SyncHandle {
    /// Flags shutdown, wakes the import consumer, and joins every task with
    /// a bounded wait. Returns how many tasks had to be abandoned.
    pub async fn shutdown(self) -> usize {
        info!("stopping sync engine");
        // Every task holds a receiver until it exits.
        let _ = self.shutdown.send(true);
        self.queue.wake();
        let mut abandoned = 0;
        for (name, mut handle) in self.tasks {
            match tokio::time::timeout(self.timeout, &mut handle).await {
                Ok(Ok(())) => debug!(task = name, "task stopped"),
                Ok(Err(err)) => warn!(task = name, error = %err, "task ended abnormally"),
                Err(_) => {
                    warn!(task = name, timeout_ms = self.timeout.as_millis() as u64, "task did not stop in time");
                    handle.abort();
                    abandoned += 1;
                }
            }
        }
        abandoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::p2p::{OutboundMessage, PeerPool};
    use crate::storage::MemoryPendingStore;
    use crate::test_utils::{build_chain, peer, peer_info, RecordingFatal};
    use std::collections::HashMap;

    fn config() -> SyncConfig {
        SyncConfig {
            header_request_interval_ms: 10,
            status_request_interval_ms: 50,
            shutdown_timeout_ms: 2000,
            seed: Some(7),
            ..SyncConfig::default()
        }
    }

    fn manager(
        config: SyncConfig,
        chain: &Arc<MemoryChain>,
        pool: &Arc<PeerPool>,
    ) -> (Arc<SyncManager>, Arc<RecordingFatal>) {
        let fatal = Arc::new(RecordingFatal::default());
        let ctx = SyncContext::new(
            Arc::clone(chain) as Arc<dyn ChainMutator>,
            Arc::clone(pool) as Arc<dyn PeerRegistry>,
            Arc::new(MemoryPendingStore::new()),
        )
        .with_fatal_handler(Arc::clone(&fatal) as Arc<dyn FatalHandler>);
        (SyncManager::new(config, ctx), fatal)
    }

    /// Answers header and body requests from `remote`.
    fn serve(manager: &SyncManager, remote: &[Block], message: OutboundMessage) {
        let by_hash: HashMap<B256, &Block> = remote.iter().map(|block| (block.hash(), block)).collect();
        match message.message {
            SyncMessage::RequestHeaders { from, count } => {
                let headers: Vec<BlockHeader> = remote
                    .iter()
                    .filter(|block| block.number() >= from && block.number() < from + u64::from(count))
                    .map(|block| block.header.clone())
                    .collect();
                manager.on_headers(message.peer_id, "remote", headers);
            }
            SyncMessage::RequestBodies { header_hashes } => {
                let bodies = header_hashes
                    .iter()
                    .filter_map(|hash| by_hash.get(hash).map(|block| block.body.clone()))
                    .collect();
                manager.on_bodies(message.peer_id, bodies);
            }
            _ => {}
        }
    }

    #[tokio::test]
    async fn syncs_to_peer_head_and_shuts_down() {
        let genesis = Block::genesis();
        let remote = build_chain(&genesis, 60);
        let chain = Arc::new(MemoryChain::new(genesis));
        let (pool, mut rx) = PeerPool::new();
        pool.upsert_peer(peer(1), peer_info(60, 61));
        let pool = Arc::new(pool);
        let (manager, fatal) = manager(config(), &chain, &pool);
        let handle = manager.start();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while chain.best_number() < 60 && tokio::time::Instant::now() < deadline {
            if let Ok(Some(message)) = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await {
                serve(&manager, &remote, message);
            }
        }
        assert_eq!(chain.best_number(), 60);
        assert_eq!(chain.canonical_hash(60), Some(remote[59].hash()));
        assert!(fatal.errors.lock().is_empty());
        assert_eq!(handle.shutdown().await, 0);
    }

    #[tokio::test]
    async fn fast_sync_gate_holds_queued_batches() {
        let genesis = Block::genesis();
        let remote = build_chain(&genesis, 5);
        let chain = Arc::new(MemoryChain::new(genesis));
        let (pool, _rx) = PeerPool::new();
        let pool = Arc::new(pool);
        let config = SyncConfig {
            fast_sync: true,
            ..config()
        };
        let (manager, _) = manager(config, &chain, &pool);
        let handle = manager.start();

        assert_eq!(
            manager.enqueue(BlocksWrapper::new(peer(1), "remote", remote.clone())),
            Some(PushOutcome::Queued)
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(chain.best_number(), 0);
        assert_eq!(manager.import_queue_len(), 1);
        assert!(!manager.status_snapshot().fast_sync_complete);
        assert_eq!(handle.shutdown().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn status_updates_are_throttled_and_trigger_requests() {
        let chain = Arc::new(MemoryChain::new(Block::genesis()));
        let (pool, _rx) = PeerPool::new();
        let pool = Arc::new(pool);
        let (manager, _) = manager(config(), &chain, &pool);
        let status = |best: u64| StatusResponse {
            best_number: best,
            best_hash: B256::with_last_byte(best as u8),
            total_difficulty: U256::from(best + 1),
            peer_count: 1,
            pending_tx_count: 0,
            latency_ms: 5,
        };

        assert!(manager.on_status(peer(1), "peer-1", &status(10)));
        assert_eq!(manager.network_status().best_number, 10);
        assert!(manager.on_status(peer(2), "peer-2", &status(20)));
        assert_eq!(manager.network_status().display_name, "peer-1");
        assert!(!manager.on_status(peer(3), "peer-3", &status(0)));
        assert_eq!(manager.status_snapshot().stats.network_best, 20);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!manager.on_status(peer(3), "peer-3", &status(0)));
        assert_eq!(manager.network_status().display_name, "peer-1");
        assert!(manager.on_status(peer(2), "peer-2", &status(30)));
        assert_eq!(manager.network_status().best_number, 30);
        assert_eq!(manager.network_status().display_name, "peer-2");
    }

    #[test]
    fn unmatched_bodies_are_dropped() {
        let genesis = Block::genesis();
        let remote = build_chain(&genesis, 3);
        let chain = Arc::new(MemoryChain::new(genesis));
        let (pool, _rx) = PeerPool::new();
        let pool = Arc::new(pool);
        let (manager, _) = manager(config(), &chain, &pool);
        let bodies = remote.iter().map(|block| block.body.clone()).collect();
        assert_eq!(manager.on_bodies(peer(1), bodies), None);
        assert_eq!(manager.import_queue_len(), 0);
    }

    #[test]
    fn new_blocks_update_progress() {
        let genesis = Block::genesis();
        let remote = build_chain(&genesis, 1);
        let chain = Arc::new(MemoryChain::new(genesis));
        let (pool, _rx) = PeerPool::new();
        let pool = Arc::new(pool);
        let (manager, _) = manager(config(), &chain, &pool);

        assert_eq!(
            manager.on_new_block(peer(1), "peer-1", &remote[0]),
            PropagationStatus::Connected
        );
        let snapshot = manager.status_snapshot();
        assert_eq!(snapshot.local_best, 1);
        let json = serde_json::to_value(&snapshot).expect("serialize snapshot");
        assert_eq!(json["local_best"], 1);
    }
}
