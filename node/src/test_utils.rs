use crate::chain::FatalHandler;
use crate::p2p::{OutboundMessage, PeerInfo, PeerPool, SyncMessage};
use crate::types::{Block, PeerId};
use alloy_primitives::{keccak256, B256, U256};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

pub fn temp_dir(prefix: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time moves forward")
        .as_nanos();
    let suffix = COUNTER.fetch_add(1, Ordering::SeqCst);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "block-sync-{prefix}-test-{now}-{}-{suffix}",
        std::process::id()
    ));
    path
}

pub fn peer(id: u8) -> PeerId {
    PeerId::with_last_byte(id)
}

/// `len` children of `parent`, difficulty 1 each, one transaction per block.
pub fn build_chain(parent: &Block, len: usize) -> Vec<Block> {
    fork_chain(parent, len, 0)
}

/// Like [`build_chain`] but `tag` changes every hash so branches differ.
pub fn fork_chain(parent: &Block, len: usize, tag: u64) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(len);
    let mut cursor = parent.clone();
    for _ in 0..len {
        let number = cursor.number() + 1;
        let tx = keccak256([number.to_be_bytes(), tag.to_be_bytes()].concat());
        let next = cursor.child(U256::from(1u64), number * 10 + tag, vec![tx], B256::ZERO);
        blocks.push(next.clone());
        cursor = next;
    }
    blocks
}

pub fn peer_info(best_number: u64, total_difficulty: u64) -> PeerInfo {
    PeerInfo {
        best_number,
        total_difficulty: U256::from(total_difficulty),
        display_name: format!("peer@{best_number}"),
    }
}

/// Peer pool plus the receiving end of its outbox.
pub fn pool_with_peers(peers: &[(PeerId, PeerInfo)]) -> (PeerPool, mpsc::UnboundedReceiver<OutboundMessage>) {
    let (pool, rx) = PeerPool::new();
    for (peer_id, info) in peers {
        pool.upsert_peer(*peer_id, info.clone());
    }
    (pool, rx)
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> Vec<(PeerId, SyncMessage)> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push((msg.peer_id, msg.message));
    }
    out
}

/// Records fatal conditions instead of exiting.
#[derive(Debug, Default)]
pub struct RecordingFatal {
    pub errors: Mutex<Vec<String>>,
}

impl FatalHandler for RecordingFatal {
    fn on_fatal(&self, error: &str) {
        self.errors.lock().push(error.to_string());
    }
}
