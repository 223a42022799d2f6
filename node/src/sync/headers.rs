//! Header batches waiting for their bodies.

use crate::chain::HeaderValidator;
use crate::sync::cache::RecencyCache;
use crate::types::{HeadersWrapper, PeerId};
use alloy_primitives::B256;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

/// Header batches indexed by `(peer, batch size)`.
///
/// Body responses carry no range, so the number of bodies is the only key
/// available to pair them with the headers they answer.
#[derive(Debug)]
pub struct HeaderStore {
    entries: HashMap<PeerId, HashMap<usize, VecDeque<HeadersWrapper>>>,
    expiry: Duration,
}

impl HeaderStore {
    pub fn new(expiry: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            expiry,
        }
    }

    pub fn store(&mut self, batch: HeadersWrapper) {
        if batch.is_empty() {
            return;
        }
        self.entries
            .entry(batch.peer_id)
            .or_default()
            .entry(batch.len())
            .or_default()
            .push_back(batch);
    }

    /// Removes and returns the oldest batch of exactly `size` headers from
    /// `peer_id`.
    pub fn take(&mut self, peer_id: &PeerId, size: usize) -> Option<HeadersWrapper> {
        let by_size = self.entries.get_mut(peer_id)?;
        let queue = by_size.get_mut(&size)?;
        let batch = queue.pop_front();
        if queue.is_empty() {
            by_size.remove(&size);
        }
        if by_size.is_empty() {
            self.entries.remove(peer_id);
        }
        batch
    }

    pub fn remove_peer(&mut self, peer_id: &PeerId) -> usize {
        self.entries
            .remove(peer_id)
            .map(|by_size| by_size.values().map(VecDeque::len).sum())
            .unwrap_or(0)
    }

    /// Drops batches older than the expiry window. Returns how many were
    /// dropped.
    pub fn prune_expired(&mut self, now: Instant) -> usize {
        let expiry = self.expiry;
        let mut dropped = 0;
        self.entries.retain(|_, by_size| {
            by_size.retain(|_, queue| {
                let before = queue.len();
                queue.retain(|batch| now.saturating_duration_since(batch.received_at) < expiry);
                dropped += before - queue.len();
                !queue.is_empty()
            });
            !by_size.is_empty()
        });
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries
            .values()
            .flat_map(HashMap::values)
            .map(VecDeque::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Checks a header response and strips already-imported headers.
///
/// The whole batch is dropped when any header fails validation or the batch
/// is not contiguous by number and parent hash. Returns `None` when nothing
/// is left to fetch.
pub fn validate_headers(
    mut batch: HeadersWrapper,
    validator: &dyn HeaderValidator,
    imported: &RecencyCache<B256>,
) -> Option<HeadersWrapper> {
    if batch.is_empty() {
        return None;
    }
    if let Some(bad) = batch.headers.iter().find(|header| !validator.validate(header)) {
        debug!(
            peer = %batch.display_name,
            number = bad.number,
            hash = %bad.hash,
            "dropping header batch with invalid header"
        );
        return None;
    }
    let linked = batch
        .headers
        .windows(2)
        .all(|pair| pair[1].number == pair[0].number + 1 && pair[1].parent_hash == pair[0].hash);
    if !linked {
        debug!(
            peer = %batch.display_name,
            len = batch.len(),
            "dropping non-sequential header batch"
        );
        return None;
    }
    batch.headers.retain(|header| !imported.contains(&header.hash));
    if batch.is_empty() {
        return None;
    }
    Some(batch)
}
