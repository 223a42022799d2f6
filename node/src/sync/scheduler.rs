//! Peer-driven header request scheduling.

use crate::p2p::{PeerInfo, PeerRegistry, SyncMessage};
use crate::sync::headers::HeaderStore;
use crate::sync::mode::{ModeTable, SyncMode};
use crate::sync::stats::{RequestKind, SyncStats};
use crate::types::{HeadersWrapper, PeerId};
use alloy_primitives::U256;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Overlap with the local best when far behind the network.
pub const FAR_OVERLAPPING_BLOCKS: u64 = 3;
/// Overlap with the local best when close to the network.
pub const CLOSE_OVERLAPPING_BLOCKS: u64 = 15;
pub const SWITCH_OVERLAPPING_BLOCKS_RANGE: u64 = 128;
pub const MIN_REQUEST_SIZE: u32 = 24;
pub const MAX_REQUEST_SIZE: u32 = 40;
pub const BACKWARD_SYNC_STEP: u64 = 128;
/// Requested-ahead distance above which only one peer is asked per tick.
pub const MAX_BLOCK_DIFF: u64 = 10_000;
pub const MAX_REQUESTS_PER_SECOND: usize = 2;
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_requests_per_second: usize,
    /// Stored header batches older than this are dropped.
    pub header_expiry: Duration,
    /// Seed for the single-peer pick near the request horizon.
    pub seed: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: MAX_REQUESTS_PER_SECOND,
            header_expiry: Duration::from_secs(60),
            seed: rand::random(),
        }
    }
}

/// Request bookkeeping for one peer.
#[derive(Debug, Clone)]
pub struct PeerRequestState {
    pub peer_id: PeerId,
    pub display_name: String,
    /// Mode as of the last scheduling pass.
    pub mode: SyncMode,
    pub from: u64,
    pub size: u32,
    pub last_best_block: u64,
    pub recent_request_times: VecDeque<Instant>,
}

impl PeerRequestState {
    fn new(peer_id: PeerId, info: &PeerInfo) -> Self {
        Self {
            peer_id,
            display_name: info.display_name.clone(),
            mode: SyncMode::Normal,
            from: 0,
            size: MIN_REQUEST_SIZE,
            last_best_block: info.best_number,
            recent_request_times: VecDeque::new(),
        }
    }

    /// Size for the next request: two less than the last, wrapping from the
    /// floor back to the ceiling.
    fn next_size(&self) -> u32 {
        let next = self.size.saturating_sub(2);
        if next < MIN_REQUEST_SIZE {
            MAX_REQUEST_SIZE
        } else {
            next
        }
    }

    /// True when the peer has room in its one-second request window. Evicts
    /// the oldest timestamp once it has aged out.
    pub fn try_make_available(&mut self, now: Instant, max_per_second: usize) -> bool {
        if self.recent_request_times.len() < max_per_second {
            return true;
        }
        match self.recent_request_times.front() {
            Some(oldest) if now.saturating_duration_since(*oldest) >= RATE_WINDOW => {
                self.recent_request_times.pop_front();
                true
            }
            _ => false,
        }
    }
}

/// A header request issued during one scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderRequest {
    pub peer_id: PeerId,
    pub from: u64,
    pub count: u32,
}

#[derive(Debug)]
struct SchedulerState {
    peers: HashMap<PeerId, PeerRequestState>,
    available: BTreeSet<PeerId>,
    booked: HashSet<PeerId>,
    headers: HeaderStore,
    local_height: u64,
    network_height: u64,
    request_height: u64,
    rng: StdRng,
}

impl SchedulerState {
    fn remove_peer(&mut self, peer_id: &PeerId) {
        self.peers.remove(peer_id);
        self.available.remove(peer_id);
        self.booked.remove(peer_id);
        self.headers.remove_peer(peer_id);
    }

    fn release_if_allowed(&mut self, peer_id: &PeerId, now: Instant, max_per_second: usize) {
        if !self.booked.contains(peer_id) {
            return;
        }
        let released = self
            .peers
            .get_mut(peer_id)
            .is_some_and(|state| state.try_make_available(now, max_per_second));
        if released {
            self.booked.remove(peer_id);
            self.available.insert(*peer_id);
        }
    }
}

/// Owns every [`PeerRequestState`] and the header batches awaiting bodies.
#[derive(Debug)]
pub struct RequestScheduler {
    config: SchedulerConfig,
    modes: Arc<ModeTable>,
    stats: Arc<SyncStats>,
    state: Mutex<SchedulerState>,
}

impl RequestScheduler {
    pub fn new(config: SchedulerConfig, modes: Arc<ModeTable>, stats: Arc<SyncStats>) -> Self {
        let state = SchedulerState {
            peers: HashMap::new(),
            available: BTreeSet::new(),
            booked: HashSet::new(),
            headers: HeaderStore::new(config.header_expiry),
            local_height: 0,
            network_height: 0,
            request_height: 0,
            rng: StdRng::seed_from_u64(config.seed),
        };
        Self {
            config,
            modes,
            stats,
            state: Mutex::new(state),
        }
    }

    pub fn send_header_requests(
        &self,
        local_best: u64,
        local_td: U256,
        registry: &dyn PeerRegistry,
    ) -> Vec<HeaderRequest> {
        self.send_header_requests_at(Instant::now(), local_best, local_td, registry)
    }

    /// One scheduling pass at `now`.
    pub fn send_header_requests_at(
        &self,
        now: Instant,
        local_best: u64,
        local_td: U256,
        registry: &dyn PeerRegistry,
    ) -> Vec<HeaderRequest> {
        let active = registry.active_peers();
        let mut requests = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            self.refresh_peers(state, &active, now);
            let expired = state.headers.prune_expired(now);
            if expired > 0 {
                debug!(expired, "dropped expired header batches");
            }

            state.local_height = state.local_height.max(local_best);
            let overlap = if state.network_height >= local_best + SWITCH_OVERLAPPING_BLOCKS_RANGE {
                FAR_OVERLAPPING_BLOCKS
            } else {
                CLOSE_OVERLAPPING_BLOCKS
            };
            let mut next_from = local_best.saturating_sub(overlap).max(1);

            let mut candidates: Vec<PeerId> = state
                .available
                .iter()
                .filter(|peer_id| {
                    active
                        .get(*peer_id)
                        .is_some_and(|info| info.total_difficulty >= local_td)
                })
                .copied()
                .collect();
            if state.request_height > state.local_height + MAX_BLOCK_DIFF && !candidates.is_empty() {
                let pick = state.rng.gen_range(0..candidates.len());
                candidates = vec![candidates[pick]];
            }

            for peer_id in candidates {
                let mode = self.modes.mode(&peer_id);
                let Some(peer) = state.peers.get_mut(&peer_id) else {
                    continue;
                };
                peer.mode = mode;
                let next_size = peer.next_size();
                match mode {
                    SyncMode::Backward => {
                        peer.from = peer.from.saturating_sub(BACKWARD_SYNC_STEP).max(1);
                    }
                    SyncMode::Forward => {
                        peer.from += u64::from(peer.size);
                    }
                    SyncMode::Normal => {
                        if peer.from == next_from {
                            next_from += u64::from(peer.size);
                        }
                        peer.from = next_from;
                        next_from = state.request_height.max(next_from + u64::from(next_size));
                    }
                }
                peer.size = next_size;

                if peer.from <= peer.last_best_block || peer.last_best_block == 0 {
                    requests.push(HeaderRequest {
                        peer_id,
                        from: peer.from,
                        count: peer.size,
                    });
                    state.request_height = state.request_height.max(peer.from + u64::from(peer.size));
                    peer.recent_request_times.push_back(now);
                    state.available.remove(&peer_id);
                    state.booked.insert(peer_id);
                    trace!(
                        peer = %peer.display_name,
                        mode = %mode,
                        from = peer.from,
                        size = peer.size,
                        "scheduled header request"
                    );
                } else {
                    trace!(
                        peer = %peer.display_name,
                        from = peer.from,
                        peer_best = peer.last_best_block,
                        "request beyond peer best; skipping"
                    );
                    peer.from = 0;
                }
            }
        }

        for request in &requests {
            registry.send(
                request.peer_id,
                SyncMessage::RequestHeaders {
                    from: request.from,
                    count: request.count,
                },
            );
            self.stats.record_request_at(request.peer_id, RequestKind::Headers, now);
        }
        requests
    }

    /// Syncs peer membership with the registry and releases booked peers
    /// whose request window has room.
    fn refresh_peers(
        &self,
        state: &mut SchedulerState,
        active: &HashMap<PeerId, PeerInfo>,
        now: Instant,
    ) {
        let gone: Vec<PeerId> = state
            .peers
            .keys()
            .filter(|peer_id| !active.contains_key(*peer_id))
            .copied()
            .collect();
        for peer_id in gone {
            state.remove_peer(&peer_id);
            self.modes.forget(&peer_id);
            debug!(peer_id = ?peer_id, "peer disconnected; request state dropped");
        }
        self.stats.retain_peers(|peer_id| active.contains_key(peer_id));

        state.network_height = active
            .values()
            .map(|info| info.best_number)
            .max()
            .unwrap_or(0);
        for (peer_id, info) in active {
            match state.peers.get_mut(peer_id) {
                Some(peer) => {
                    peer.last_best_block = info.best_number;
                    if peer.display_name != info.display_name {
                        peer.display_name = info.display_name.clone();
                    }
                }
                None => {
                    state.peers.insert(*peer_id, PeerRequestState::new(*peer_id, info));
                    state.available.insert(*peer_id);
                    self.modes.track(*peer_id);
                    self.stats.note_peer(*peer_id, &info.display_name);
                }
            }
        }

        let max_per_second = self.config.max_requests_per_second.max(1);
        let booked: Vec<PeerId> = state.booked.iter().copied().collect();
        for peer_id in booked {
            state.release_if_allowed(&peer_id, now, max_per_second);
        }
    }

    /// Stores a validated header response and frees the peer if its request
    /// window allows.
    pub fn store_headers(&self, batch: HeadersWrapper) {
        self.store_headers_at(batch, Instant::now());
    }

    pub fn store_headers_at(&self, batch: HeadersWrapper, now: Instant) {
        let max_per_second = self.config.max_requests_per_second.max(1);
        let peer_id = batch.peer_id;
        let mut state = self.state.lock();
        if !state.peers.contains_key(&peer_id) {
            debug!(peer = %batch.display_name, "headers from untracked peer; dropping");
            return;
        }
        state.headers.store(batch);
        state.release_if_allowed(&peer_id, now, max_per_second);
    }

    /// Removes the stored header batch of `size` headers for `peer_id`.
    pub fn match_headers(&self, peer_id: &PeerId, size: usize) -> Option<HeadersWrapper> {
        self.state.lock().headers.take(peer_id, size)
    }

    pub fn peer_state(&self, peer_id: &PeerId) -> Option<PeerRequestState> {
        self.state.lock().peers.get(peer_id).cloned()
    }

    pub fn is_available(&self, peer_id: &PeerId) -> bool {
        self.state.lock().available.contains(peer_id)
    }

    pub fn network_height(&self) -> u64 {
        self.state.lock().network_height
    }

    pub fn stored_header_batches(&self) -> usize {
        self.state.lock().headers.len()
    }
}
