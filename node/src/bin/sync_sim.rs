//! Runs the sync engine against simulated in-process peers and prints a JSON
//! summary.
//!
//! Run with: cargo run --bin sync-sim --manifest-path node/Cargo.toml -- --blocks 2000

use alloy_primitives::{keccak256, B256, U256};
use block_sync::chain::{ChainMutator, MemoryChain};
use block_sync::cli::{LogConfig, SyncConfig};
use block_sync::logging::init_tracing;
use block_sync::p2p::{OutboundMessage, PeerInfo, PeerPool, PeerRegistry, StatusResponse, SyncMessage, TrieNodeResponse};
use block_sync::storage::{DiskPendingStore, MemoryPendingStore, PendingBlockStore};
use block_sync::sync::propagation::PropagationStatus;
use block_sync::sync::{SyncContext, SyncManager, SyncStatusSnapshot};
use block_sync::types::{Block, BlockBody, BlockHeader, BlockRef, DatabaseType, PeerId};
use clap::Parser;
use eyre::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Distance of the fast-sync pivot below the remote head.
const PIVOT_DISTANCE: u64 = 16;
/// Leaves in the simulated state trie.
const STATE_LEAVES: usize = 32;

#[derive(Parser, Debug)]
#[command(name = "sync-sim", about = "Block sync engine against simulated peers")]
struct Cli {
    #[command(flatten)]
    sync: SyncConfig,
    #[command(flatten)]
    log: LogConfig,
    /// Number of simulated peers.
    #[arg(long, default_value_t = 4)]
    peers: u8,
    /// Length of the remote chain.
    #[arg(long, default_value_t = 500)]
    blocks: u64,
    /// Simulated response latency.
    #[arg(long, default_value_t = 5)]
    latency_ms: u64,
    /// Give up after this many seconds.
    #[arg(long, default_value_t = 60)]
    deadline_secs: u64,
}

/// Chain the simulated peers serve from.
struct RemoteChain {
    blocks: Vec<Block>,
    by_hash: HashMap<B256, usize>,
    state_root: (B256, Vec<u8>),
    state_leaves: Vec<(B256, Vec<u8>)>,
}

impl RemoteChain {
    fn build(len: u64) -> Self {
        let state_leaves: Vec<(B256, Vec<u8>)> = (0..STATE_LEAVES)
            .map(|index| {
                let value = format!("account-{index}").into_bytes();
                (keccak256(&value), value)
            })
            .collect();
        let root_value: Vec<u8> = state_leaves
            .iter()
            .flat_map(|(key, _)| key.as_slice().to_vec())
            .collect();
        let state_root = (keccak256(&root_value), root_value);

        let mut blocks = vec![Block::genesis()];
        for number in 1..=len {
            let transactions = if number % 2 == 0 {
                vec![keccak256(number.to_be_bytes())]
            } else {
                Vec::new()
            };
            let parent = &blocks[blocks.len() - 1];
            let block = parent.child(U256::from(1u64), number * 12, transactions, state_root.0);
            blocks.push(block);
        }
        let by_hash = blocks
            .iter()
            .enumerate()
            .map(|(index, block)| (block.hash(), index))
            .collect();
        Self {
            blocks,
            by_hash,
            state_root,
            state_leaves,
        }
    }

    fn tip(&self) -> &Block {
        &self.blocks[self.blocks.len() - 1]
    }

    fn best(&self) -> u64 {
        self.tip().number()
    }

    fn total_difficulty(&self) -> U256 {
        U256::from(self.blocks.len() as u64)
    }

    fn block(&self, number: u64) -> Option<&Block> {
        self.blocks.get(usize::try_from(number).ok()?)
    }

    fn headers(&self, from: u64, count: u32) -> Vec<BlockHeader> {
        (from..from.saturating_add(u64::from(count)))
            .map_while(|number| self.block(number))
            .map(|block| block.header.clone())
            .collect()
    }

    fn bodies(&self, hashes: &[B256]) -> Vec<BlockBody> {
        hashes
            .iter()
            .filter_map(|hash| self.by_hash.get(hash))
            .map(|index| self.blocks[*index].body.clone())
            .collect()
    }

    fn blocks_from(&self, start: BlockRef, count: u32, reverse: bool) -> Vec<Block> {
        let start = match start {
            BlockRef::Hash(hash) => match self.by_hash.get(&hash) {
                Some(index) => *index as u64,
                None => return Vec::new(),
            },
            BlockRef::Number(number) => number,
        };
        let count = u64::from(count);
        let numbers: Vec<u64> = if reverse {
            (start.saturating_sub(count.saturating_sub(1)).max(1)..=start).rev().collect()
        } else {
            (start..start.saturating_add(count)).collect()
        };
        numbers
            .into_iter()
            .filter_map(|number| self.block(number).cloned())
            .collect()
    }

    /// Root node response. Half of the leaves ride along, the rest are
    /// references only.
    fn root_response(&self) -> TrieNodeResponse {
        let referenced_nodes = self
            .state_leaves
            .iter()
            .enumerate()
            .map(|(index, (key, value))| {
                let payload = if index % 2 == 0 { value.clone() } else { Vec::new() };
                (*key, payload)
            })
            .collect();
        TrieNodeResponse {
            node_key: self.state_root.0,
            node_value: self.state_root.1.clone(),
            referenced_nodes,
            db_type: DatabaseType::State,
        }
    }

    fn leaf_responses(&self) -> Vec<TrieNodeResponse> {
        self.state_leaves
            .iter()
            .skip(1)
            .step_by(2)
            .map(|(key, value)| TrieNodeResponse {
                node_key: *key,
                node_value: value.clone(),
                referenced_nodes: HashMap::new(),
                db_type: DatabaseType::State,
            })
            .collect()
    }
}

#[derive(Debug, Serialize)]
struct Summary {
    caught_up: bool,
    elapsed_ms: u64,
    peers: usize,
    remote_best: u64,
    local_best: u64,
    head_matches: bool,
    fast_sync_pivot: Option<u64>,
    new_block: Option<PropagationStatus>,
    abandoned_tasks: usize,
    status: SyncStatusSnapshot,
}

/// Answers the engine's outbound messages from `remote`.
async fn respond(
    manager: Arc<SyncManager>,
    remote: Arc<RemoteChain>,
    pool: Arc<PeerPool>,
    mut outbox: mpsc::UnboundedReceiver<OutboundMessage>,
    latency: Duration,
) {
    while let Some(OutboundMessage { peer_id, message }) = outbox.recv().await {
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let display_name = peer_name(&pool, peer_id);
        match message {
            SyncMessage::RequestStatus => {
                let status = StatusResponse {
                    best_number: remote.best(),
                    best_hash: remote.tip().hash(),
                    total_difficulty: remote.total_difficulty(),
                    peer_count: pool.len() as u32,
                    pending_tx_count: 0,
                    latency_ms: latency.as_millis() as u64,
                };
                pool.update_status(peer_id, &status);
                manager.on_status(peer_id, &display_name, &status);
            }
            SyncMessage::RequestHeaders { from, count } => {
                manager.on_headers(peer_id, &display_name, remote.headers(from, count));
            }
            SyncMessage::RequestBodies { header_hashes } => {
                manager.on_bodies(peer_id, remote.bodies(&header_hashes));
            }
            SyncMessage::RequestBlocks { start, count, reverse } => {
                manager.on_blocks(peer_id, &display_name, remote.blocks_from(start, count, reverse));
            }
            SyncMessage::RequestReceipts { tx_hashes } => {
                manager.on_receipts(peer_id, &tx_hashes);
            }
            SyncMessage::BroadcastNewBlock { block } => {
                debug!(peer = %display_name, number = block.number(), "peer received new block");
            }
        }
    }
}

fn peer_name(pool: &PeerPool, peer_id: PeerId) -> String {
    pool.active_peers()
        .get(&peer_id)
        .map(|info| info.display_name.clone())
        .unwrap_or_else(|| format!("{peer_id:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log)?;

    let remote = Arc::new(RemoteChain::build(cli.blocks.max(1)));
    let chain = Arc::new(MemoryChain::new(Block::genesis()));
    let (pool, outbox) = PeerPool::new();
    let pool = Arc::new(pool);
    for index in 1..=cli.peers.max(1) {
        pool.upsert_peer(
            PeerId::with_last_byte(index),
            PeerInfo {
                best_number: remote.best(),
                total_difficulty: remote.total_difficulty(),
                display_name: format!("sim-{index}"),
            },
        );
    }
    let pending: Arc<dyn PendingBlockStore> = match &cli.sync.pending_dir {
        Some(dir) => Arc::new(DiskPendingStore::open(dir)?),
        None => Arc::new(MemoryPendingStore::new()),
    };
    info!(
        blocks = remote.best(),
        peers = pool.len(),
        fast_sync = cli.sync.fast_sync,
        "starting simulation"
    );

    let ctx = SyncContext::new(
        Arc::clone(&chain) as Arc<dyn ChainMutator>,
        Arc::clone(&pool) as Arc<dyn PeerRegistry>,
        pending,
    );
    let manager = SyncManager::new(cli.sync.clone(), ctx);

    let mut fast_sync_pivot = None;
    if cli.sync.fast_sync {
        let pivot_number = remote.best().saturating_sub(PIVOT_DISTANCE).max(1);
        if let Some(pivot) = remote.block(pivot_number) {
            manager.set_pivot(pivot.clone());
            fast_sync_pivot = Some(pivot_number);
        }
        let first_peer = PeerId::with_last_byte(1);
        manager.on_trie_node(first_peer, "sim-1", remote.root_response());
        for response in remote.leaf_responses() {
            manager.on_trie_node(first_peer, "sim-1", response);
        }
    }

    let handle = manager.start();
    let responder = tokio::spawn(respond(
        Arc::clone(&manager),
        Arc::clone(&remote),
        Arc::clone(&pool),
        outbox,
        Duration::from_millis(cli.latency_ms),
    ));

    let started = Instant::now();
    let deadline = Duration::from_secs(cli.deadline_secs);
    let mut poll = tokio::time::interval(Duration::from_millis(100));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let caught_up = loop {
        tokio::select! {
            _ = poll.tick() => {}
            _ = &mut ctrl_c => {
                warn!("interrupted");
                break false;
            }
        }
        if chain.best_number() >= remote.best() {
            break true;
        }
        if started.elapsed() >= deadline {
            warn!(local_best = chain.best_number(), remote_best = remote.best(), "deadline reached");
            break false;
        }
    };
    let elapsed = started.elapsed();

    let new_block = caught_up.then(|| {
        let block = remote
            .tip()
            .child(U256::from(1u64), remote.tip().header.timestamp + 12, Vec::new(), remote.state_root.0);
        manager.on_new_block(PeerId::with_last_byte(1), "sim-1", &block)
    });

    let status = manager.status_snapshot();
    let abandoned_tasks = handle.shutdown().await;
    responder.abort();

    let local_best = chain.best_number();
    let summary = Summary {
        caught_up,
        elapsed_ms: elapsed.as_millis() as u64,
        peers: pool.len(),
        remote_best: remote.best(),
        local_best,
        head_matches: chain.canonical_hash(remote.best()) == Some(remote.tip().hash()),
        fast_sync_pivot,
        new_block,
        abandoned_tasks,
        status,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    info!(caught_up, local_best, elapsed_ms = summary.elapsed_ms, "simulation finished");
    Ok(())
}
