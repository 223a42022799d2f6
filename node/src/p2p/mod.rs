//! Peer registry surface and the messages the sync engine exchanges with peers.

use crate::types::{Block, BlockRef, DatabaseType, PeerId};
use alloy_primitives::{B256, U256};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::trace;

/// What a peer last advertised about its chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub best_number: u64,
    pub total_difficulty: U256,
    pub display_name: String,
}

/// Requests and announcements sent to peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    RequestStatus,
    RequestHeaders { from: u64, count: u32 },
    RequestBodies { header_hashes: Vec<B256> },
    RequestBlocks { start: BlockRef, count: u32, reverse: bool },
    BroadcastNewBlock { block: Block },
    RequestReceipts { tx_hashes: Vec<B256> },
}

impl SyncMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestStatus => "request_status",
            Self::RequestHeaders { .. } => "request_headers",
            Self::RequestBodies { .. } => "request_bodies",
            Self::RequestBlocks { .. } => "request_blocks",
            Self::BroadcastNewBlock { .. } => "broadcast_new_block",
            Self::RequestReceipts { .. } => "request_receipts",
        }
    }
}

/// Status reply from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub best_number: u64,
    pub best_hash: B256,
    pub total_difficulty: U256,
    pub peer_count: u32,
    pub pending_tx_count: u32,
    pub latency_ms: u64,
}

/// One state-trie node plus the nodes it references.
///
/// A referenced node with an empty value is only a reference; its payload
/// must arrive in a later response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrieNodeResponse {
    pub node_key: B256,
    pub node_value: Vec<u8>,
    pub referenced_nodes: HashMap<B256, Vec<u8>>,
    pub db_type: DatabaseType,
}

/// Connection-layer view the sync engine depends on.
pub trait PeerRegistry: Send + Sync {
    fn active_peers(&self) -> HashMap<PeerId, PeerInfo>;
    fn send(&self, peer_id: PeerId, message: SyncMessage);
}

/// Message queued for delivery to a peer.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub peer_id: PeerId,
    pub message: SyncMessage,
}

/// Registry of connected peers whose outgoing messages land on a channel
/// drained by the transport.
#[derive(Debug)]
pub struct PeerPool {
    peers: RwLock<HashMap<PeerId, PeerInfo>>,
    outbox: mpsc::UnboundedSender<OutboundMessage>,
}

impl PeerPool {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers: RwLock::new(HashMap::new()),
                outbox,
            },
            rx,
        )
    }

    pub fn upsert_peer(&self, peer_id: PeerId, info: PeerInfo) {
        self.peers.write().insert(peer_id, info);
    }

    pub fn remove_peer(&self, peer_id: PeerId) {
        self.peers.write().remove(&peer_id);
    }

    /// Applies a status reply to the stored peer info.
    pub fn update_status(&self, peer_id: PeerId, status: &StatusResponse) {
        if let Some(info) = self.peers.write().get_mut(&peer_id) {
            info.best_number = status.best_number;
            info.total_difficulty = status.total_difficulty;
        }
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn best_head(&self) -> Option<u64> {
        self.peers.read().values().map(|peer| peer.best_number).max()
    }
}

impl PeerRegistry for PeerPool {
    fn active_peers(&self) -> HashMap<PeerId, PeerInfo> {
        self.peers.read().clone()
    }

    fn send(&self, peer_id: PeerId, message: SyncMessage) {
        trace!(peer_id = ?peer_id, message = message.name(), "queue outbound message");
        // The receiver only goes away during shutdown.
        let _ = self.outbox.send(OutboundMessage { peer_id, message });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{drain, peer, peer_info};

    #[test]
    fn pool_tracks_peers_and_queues_messages() {
        let (pool, mut rx) = PeerPool::new();
        pool.upsert_peer(peer(1), peer_info(10, 11));
        pool.upsert_peer(peer(2), peer_info(30, 31));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.best_head(), Some(30));

        pool.update_status(
            peer(1),
            &StatusResponse {
                best_number: 50,
                best_hash: B256::ZERO,
                total_difficulty: U256::from(51u64),
                peer_count: 3,
                pending_tx_count: 0,
                latency_ms: 20,
            },
        );
        assert_eq!(pool.best_head(), Some(50));

        pool.send(peer(2), SyncMessage::RequestStatus);
        assert_eq!(drain(&mut rx), vec![(peer(2), SyncMessage::RequestStatus)]);

        pool.remove_peer(peer(2));
        assert_eq!(pool.active_peers().len(), 1);
    }
}
