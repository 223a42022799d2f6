//! Request, response, and import counters.

use crate::metrics::{import_rate, lag_behind};
use crate::types::PeerId;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Outstanding request timestamps kept per peer and kind.
const MAX_OUTSTANDING_SAMPLES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Status,
    Headers,
    Bodies,
    Blocks,
    Receipts,
}

#[derive(Debug, Default)]
struct PeerCounters {
    display_name: String,
    requests: BTreeMap<RequestKind, u64>,
    outstanding: HashMap<RequestKind, VecDeque<Instant>>,
    response_ms_total: u64,
    responses: u64,
    blocks_received: u64,
    blocks_imported: u64,
    blocks_stored: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerStatsSnapshot {
    pub peer_id: String,
    pub display_name: String,
    pub requests: BTreeMap<RequestKind, u64>,
    pub avg_response_ms: Option<f64>,
    pub blocks_received: u64,
    pub blocks_imported: u64,
    pub blocks_stored: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatsSnapshot {
    pub elapsed_ms: u64,
    pub start_block: u64,
    pub best_block: u64,
    pub network_best: u64,
    pub lag: Option<u64>,
    pub avg_blocks_per_sec: Option<f64>,
    pub peers: Vec<PeerStatsSnapshot>,
}

/// Write-mostly statistics shared by every sync task.
#[derive(Debug)]
pub struct SyncStats {
    started_at: Instant,
    start_block: u64,
    best_block: AtomicU64,
    network_best: AtomicU64,
    peers: Mutex<HashMap<PeerId, PeerCounters>>,
}

impl SyncStats {
    pub fn new(start_block: u64) -> Self {
        Self {
            started_at: Instant::now(),
            start_block,
            best_block: AtomicU64::new(start_block),
            network_best: AtomicU64::new(0),
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn note_peer(&self, peer_id: PeerId, display_name: &str) {
        let mut peers = self.peers.lock();
        let entry = peers.entry(peer_id).or_default();
        if entry.display_name != display_name {
            entry.display_name = display_name.to_string();
        }
    }

    /// Drops counters for peers `keep` rejects. Returns how many were removed.
    pub fn retain_peers(&self, mut keep: impl FnMut(&PeerId) -> bool) -> usize {
        let mut peers = self.peers.lock();
        let before = peers.len();
        peers.retain(|peer_id, _| keep(peer_id));
        before - peers.len()
    }

    pub fn record_request(&self, peer_id: PeerId, kind: RequestKind) {
        self.record_request_at(peer_id, kind, Instant::now());
    }

    pub fn record_request_at(&self, peer_id: PeerId, kind: RequestKind, now: Instant) {
        let mut peers = self.peers.lock();
        let entry = peers.entry(peer_id).or_default();
        *entry.requests.entry(kind).or_default() += 1;
        let outstanding = entry.outstanding.entry(kind).or_default();
        if outstanding.len() >= MAX_OUTSTANDING_SAMPLES {
            outstanding.pop_front();
        }
        outstanding.push_back(now);
    }

    pub fn record_response(&self, peer_id: PeerId, kind: RequestKind) {
        self.record_response_at(peer_id, kind, Instant::now());
    }

    /// Pairs a response with the oldest outstanding request of that kind.
    pub fn record_response_at(&self, peer_id: PeerId, kind: RequestKind, now: Instant) {
        let mut peers = self.peers.lock();
        let Some(entry) = peers.get_mut(&peer_id) else {
            return;
        };
        let Some(sent_at) = entry
            .outstanding
            .get_mut(&kind)
            .and_then(VecDeque::pop_front)
        else {
            return;
        };
        let elapsed = now.saturating_duration_since(sent_at);
        entry.response_ms_total += elapsed.as_millis() as u64;
        entry.responses += 1;
    }

    pub fn record_received(&self, peer_id: PeerId, blocks: u64) {
        self.peers.lock().entry(peer_id).or_default().blocks_received += blocks;
    }

    pub fn record_imported(&self, peer_id: PeerId, blocks: u64) {
        if blocks == 0 {
            return;
        }
        self.peers.lock().entry(peer_id).or_default().blocks_imported += blocks;
    }

    pub fn record_stored(&self, peer_id: PeerId, blocks: u64) {
        if blocks == 0 {
            return;
        }
        self.peers.lock().entry(peer_id).or_default().blocks_stored += blocks;
    }

    pub fn set_network_best(&self, number: u64) {
        self.network_best.fetch_max(number, Ordering::SeqCst);
    }

    /// Records the local best and returns the average import rate since start.
    pub fn update_best(&self, best: u64) -> Option<f64> {
        self.best_block.store(best, Ordering::SeqCst);
        self.avg_blocks_per_sec()
    }

    pub fn avg_blocks_per_sec(&self) -> Option<f64> {
        let best = self.best_block.load(Ordering::SeqCst);
        import_rate(self.start_block, best, self.started_at.elapsed())
    }

    pub fn best_block(&self) -> u64 {
        self.best_block.load(Ordering::SeqCst)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> SyncStatsSnapshot {
        let best_block = self.best_block();
        let network_best = self.network_best.load(Ordering::SeqCst);
        let mut peers: Vec<PeerStatsSnapshot> = self
            .peers
            .lock()
            .iter()
            .map(|(peer_id, counters)| PeerStatsSnapshot {
                peer_id: peer_id.to_string(),
                display_name: counters.display_name.clone(),
                requests: counters.requests.clone(),
                avg_response_ms: (counters.responses > 0)
                    .then(|| counters.response_ms_total as f64 / counters.responses as f64),
                blocks_received: counters.blocks_received,
                blocks_imported: counters.blocks_imported,
                blocks_stored: counters.blocks_stored,
            })
            .collect();
        peers.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        SyncStatsSnapshot {
            elapsed_ms: self.elapsed().as_millis() as u64,
            start_block: self.start_block,
            best_block,
            network_best,
            lag: lag_behind(network_best, best_block),
            avg_blocks_per_sec: self.avg_blocks_per_sec(),
            peers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::peer;

    #[test]
    fn response_time_pairs_with_oldest_request() {
        let stats = SyncStats::new(0);
        let t0 = Instant::now();
        stats.note_peer(peer(1), "alpha");
        stats.record_request_at(peer(1), RequestKind::Headers, t0);
        stats.record_request_at(peer(1), RequestKind::Headers, t0 + Duration::from_millis(100));
        stats.record_response_at(peer(1), RequestKind::Headers, t0 + Duration::from_millis(300));
        stats.record_response_at(peer(1), RequestKind::Headers, t0 + Duration::from_millis(300));
        stats.record_response_at(peer(1), RequestKind::Bodies, t0 + Duration::from_millis(300));

        let snapshot = stats.snapshot();
        let peer_stats = &snapshot.peers[0];
        assert_eq!(peer_stats.display_name, "alpha");
        assert_eq!(peer_stats.requests.get(&RequestKind::Headers), Some(&2));
        let avg = peer_stats.avg_response_ms.expect("avg");
        assert!((avg - 250.0).abs() < 1e-6);
    }

    #[test]
    fn block_counters_and_lag() {
        let stats = SyncStats::new(10);
        stats.record_received(peer(2), 40);
        stats.record_imported(peer(2), 30);
        stats.record_stored(peer(2), 10);
        stats.set_network_best(100);
        stats.update_best(40);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.best_block, 40);
        assert_eq!(snapshot.lag, Some(60));
        assert_eq!(snapshot.peers[0].blocks_imported, 30);
        assert_eq!(snapshot.peers[0].blocks_stored, 10);
    }

    #[test]
    fn retain_peers_drops_departed_counters() {
        let stats = SyncStats::new(0);
        stats.note_peer(peer(1), "alpha");
        stats.note_peer(peer(2), "beta");
        stats.record_received(peer(3), 5);

        assert_eq!(stats.retain_peers(|peer_id| *peer_id == peer(2)), 2);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.peers.len(), 1);
        assert_eq!(snapshot.peers[0].display_name, "beta");
        assert_eq!(stats.retain_peers(|_| true), 0);
    }
}
