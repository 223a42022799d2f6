//! New-block announcement and de-duplicated rebroadcast.

use crate::chain::{ChainMutator, FatalHandler, HeaderValidator};
use crate::p2p::{PeerRegistry, SyncMessage};
use crate::sync::cache::RecencyCache;
use crate::types::{Block, PeerId};
use alloy_primitives::B256;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of handling an incoming new block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationStatus {
    Dropped,
    Propagated,
    Connected,
    PropConnected,
}

impl PropagationStatus {
    fn from_flags(propagated: bool, connected: bool) -> Self {
        match (propagated, connected) {
            (true, true) => Self::PropConnected,
            (false, true) => Self::Connected,
            (true, false) => Self::Propagated,
            (false, false) => Self::Dropped,
        }
    }
}

/// Forwards new blocks to peers exactly once per hash.
pub struct PropagationGuard {
    chain: Arc<dyn ChainMutator>,
    registry: Arc<dyn PeerRegistry>,
    validator: Arc<dyn HeaderValidator>,
    fatal: Arc<dyn FatalHandler>,
    seen: RecencyCache<B256>,
    imported: Arc<RecencyCache<B256>>,
    sync_only_node: bool,
}

impl PropagationGuard {
    pub fn new(
        chain: Arc<dyn ChainMutator>,
        registry: Arc<dyn PeerRegistry>,
        validator: Arc<dyn HeaderValidator>,
        fatal: Arc<dyn FatalHandler>,
        imported: Arc<RecencyCache<B256>>,
        cache_size: usize,
        sync_only_node: bool,
    ) -> Self {
        Self {
            chain,
            registry,
            validator,
            fatal,
            seen: RecencyCache::new(cache_size),
            imported,
            sync_only_node,
        }
    }

    /// Announces a locally produced block to every peer.
    pub fn send_new_block(&self, block: &Block) -> usize {
        self.seen.insert(block.hash());
        let peers = self.registry.active_peers();
        for peer_id in peers.keys() {
            self.registry.send(
                *peer_id,
                SyncMessage::BroadcastNewBlock {
                    block: block.clone(),
                },
            );
        }
        info!(number = block.number(), hash = %block.hash(), peers = peers.len(), "new block announced");
        peers.len()
    }

    /// Handles a block announced by `peer_id`.
    pub fn process_incoming_block(&self, peer_id: PeerId, display_name: &str, block: &Block) -> PropagationStatus {
        if !self.validator.validate(&block.header) {
            debug!(peer = %display_name, number = block.number(), "invalid new block header");
            return PropagationStatus::Dropped;
        }
        if !self.seen.check_and_insert(block.hash()) {
            debug!(peer = %display_name, hash = %block.hash(), "new block already seen");
            return PropagationStatus::Dropped;
        }
        let best = self.chain.best_block();
        if block.number() != best.number() + 1 || block.parent_hash() != best.hash() {
            debug!(
                peer = %display_name,
                number = block.number(),
                local_best = best.number(),
                "new block does not extend local best"
            );
            return PropagationStatus::Dropped;
        }

        let propagated = self.rebroadcast(peer_id, block);
        let connected = match self.chain.try_to_connect(std::slice::from_ref(block)) {
            Ok(result) if result.outcome.is_stored() => {
                self.imported.insert(block.hash());
                true
            }
            Ok(result) => {
                debug!(peer = %display_name, outcome = %result.outcome, "new block not connected");
                false
            }
            Err(err) if err.is_fatal() => {
                error!(error = %err, "new block import hit a fatal storage error");
                self.fatal.on_fatal(&err.to_string());
                false
            }
            Err(err) => {
                warn!(error = %err, number = block.number(), "new block import failed");
                false
            }
        };
        let status = PropagationStatus::from_flags(propagated, connected);
        debug!(peer = %display_name, number = block.number(), ?status, "new block handled");
        status
    }

    /// Sends `block` to every peer except the sender that has not advertised
    /// a height above it.
    fn rebroadcast(&self, sender: PeerId, block: &Block) -> bool {
        let targets: Vec<PeerId> = self
            .registry
            .active_peers()
            .into_iter()
            .filter(|(peer_id, info)| *peer_id != sender && info.best_number <= block.number())
            .map(|(peer_id, _)| peer_id)
            .collect();
        if targets.is_empty() {
            return false;
        }
        if self.sync_only_node {
            return true;
        }
        for peer_id in targets {
            self.registry.send(
                peer_id,
                SyncMessage::BroadcastNewBlock {
                    block: block.clone(),
                },
            );
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{BasicHeaderValidator, ChainError, MemoryChain};
    use crate::test_utils::{build_chain, drain, peer, peer_info, pool_with_peers, RecordingFatal};

    fn guard(
        chain: &Arc<MemoryChain>,
        pool: crate::p2p::PeerPool,
        sync_only_node: bool,
    ) -> (PropagationGuard, Arc<RecencyCache<B256>>, Arc<RecordingFatal>) {
        let imported = Arc::new(RecencyCache::new(64));
        let fatal = Arc::new(RecordingFatal::default());
        let guard = PropagationGuard::new(
            Arc::clone(chain) as Arc<dyn ChainMutator>,
            Arc::new(pool),
            Arc::new(BasicHeaderValidator),
            Arc::clone(&fatal) as Arc<dyn FatalHandler>,
            Arc::clone(&imported),
            16,
            sync_only_node,
        );
        (guard, imported, fatal)
    }

    #[test]
    fn child_of_best_is_rebroadcast_and_connected_once() {
        let genesis = Block::genesis();
        let blocks = build_chain(&genesis, 3);
        let chain = Arc::new(MemoryChain::new(genesis));
        chain.try_to_connect(&blocks[..2]).expect("seed chain");
        let (pool, mut rx) = pool_with_peers(&[
            (peer(1), peer_info(3, 4)),
            (peer(2), peer_info(2, 3)),
            (peer(3), peer_info(9, 10)),
        ]);
        let (guard, imported, _) = guard(&chain, pool, false);

        let status = guard.process_incoming_block(peer(1), "peer-1", &blocks[2]);
        assert_eq!(status, PropagationStatus::PropConnected);
        assert_eq!(chain.best_number(), 3);
        assert!(imported.contains(&blocks[2].hash()));

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, peer(2));

        assert_eq!(
            guard.process_incoming_block(peer(2), "peer-2", &blocks[2]),
            PropagationStatus::Dropped
        );
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn stale_or_detached_blocks_are_dropped() {
        let genesis = Block::genesis();
        let blocks = build_chain(&genesis, 4);
        let chain = Arc::new(MemoryChain::new(genesis));
        chain.try_to_connect(&blocks[..2]).expect("seed chain");
        let (pool, mut rx) = pool_with_peers(&[(peer(2), peer_info(0, 1))]);
        let (guard, _, _) = guard(&chain, pool, false);

        assert_eq!(
            guard.process_incoming_block(peer(1), "peer-1", &blocks[1]),
            PropagationStatus::Dropped
        );
        assert_eq!(
            guard.process_incoming_block(peer(1), "peer-1", &blocks[3]),
            PropagationStatus::Dropped
        );
        let mut tampered = blocks[2].clone();
        tampered.header.timestamp += 1;
        assert_eq!(
            guard.process_incoming_block(peer(1), "peer-1", &tampered),
            PropagationStatus::Dropped
        );
        assert!(drain(&mut rx).is_empty());

        // The tampered copy did not poison the cache for the real block.
        assert_eq!(
            guard.process_incoming_block(peer(1), "peer-1", &blocks[2]),
            PropagationStatus::PropConnected
        );
    }

    #[test]
    fn sync_only_node_skips_sending() {
        let genesis = Block::genesis();
        let blocks = build_chain(&genesis, 1);
        let chain = Arc::new(MemoryChain::new(genesis));
        let (pool, mut rx) = pool_with_peers(&[(peer(2), peer_info(0, 1))]);
        let (guard, _, _) = guard(&chain, pool, true);

        assert_eq!(
            guard.process_incoming_block(peer(1), "peer-1", &blocks[0]),
            PropagationStatus::PropConnected
        );
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn import_failure_still_reports_propagation() {
        let genesis = Block::genesis();
        let blocks = build_chain(&genesis, 1);
        let chain = Arc::new(MemoryChain::new(genesis));
        chain.fail_next_import(ChainError::OutOfDiskSpace("full".to_string()));
        let (pool, _rx) = pool_with_peers(&[(peer(2), peer_info(0, 1))]);
        let (guard, _, fatal) = guard(&chain, pool, false);

        assert_eq!(
            guard.process_incoming_block(peer(1), "peer-1", &blocks[0]),
            PropagationStatus::Propagated
        );
        assert_eq!(fatal.errors.lock().len(), 1);
    }

    #[test]
    fn alone_on_the_network_connects_without_propagating() {
        let genesis = Block::genesis();
        let blocks = build_chain(&genesis, 1);
        let chain = Arc::new(MemoryChain::new(genesis));
        let (pool, _rx) = pool_with_peers(&[(peer(1), peer_info(1, 2))]);
        let (guard, _, _) = guard(&chain, pool, false);

        assert_eq!(
            guard.process_incoming_block(peer(1), "peer-1", &blocks[0]),
            PropagationStatus::Connected
        );
    }

    #[test]
    fn announced_blocks_reach_every_peer_and_are_not_reaccepted() {
        let genesis = Block::genesis();
        let blocks = build_chain(&genesis, 1);
        let chain = Arc::new(MemoryChain::new(genesis));
        let (pool, mut rx) = pool_with_peers(&[(peer(1), peer_info(9, 10)), (peer(2), peer_info(0, 1))]);
        let (guard, _, _) = guard(&chain, pool, false);

        assert_eq!(guard.send_new_block(&blocks[0]), 2);
        assert_eq!(drain(&mut rx).len(), 2);
        assert_eq!(
            guard.process_incoming_block(peer(1), "peer-1", &blocks[0]),
            PropagationStatus::Dropped
        );
    }
}
