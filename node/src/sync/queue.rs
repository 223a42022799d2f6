//! Ordered in-memory import queue with disk overflow.

use crate::storage::{PendingBlockStore, StoreError};
use crate::types::BlocksWrapper;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, trace};

/// What happened to a pushed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Replaced a shorter batch starting at the same number.
    Replaced,
    /// A batch at least as long already starts at the same number.
    Superseded,
    /// Written to the pending store; carries the stored block count.
    Diverted(usize),
    Empty,
}

/// Block batches ordered by first block number.
///
/// The map itself is unbounded; producers divert batches that cannot be
/// imported soon once `preferred_len` is reached.
pub struct ImportQueue {
    batches: Mutex<BTreeMap<u64, BlocksWrapper>>,
    notify: Notify,
    preferred_len: usize,
    import_slack: u64,
    pending: Arc<dyn PendingBlockStore>,
}

impl ImportQueue {
    pub fn new(preferred_len: usize, import_slack: u64, pending: Arc<dyn PendingBlockStore>) -> Self {
        Self {
            batches: Mutex::new(BTreeMap::new()),
            notify: Notify::new(),
            preferred_len: preferred_len.max(1),
            import_slack,
            pending,
        }
    }

    pub fn push(&self, batch: BlocksWrapper, local_best: u64) -> Result<PushOutcome, StoreError> {
        let Some(first) = batch.first_number() else {
            return Ok(PushOutcome::Empty);
        };
        let mut batches = self.batches.lock();
        if batches.len() >= self.preferred_len && first > local_best + self.import_slack {
            drop(batches);
            let stored = self.pending.store_pending_range(&batch.blocks)?;
            debug!(
                peer = %batch.display_name,
                first,
                stored,
                "import queue full; batch diverted to pending store"
            );
            return Ok(PushOutcome::Diverted(stored));
        }
        let existing_len = batches.get(&first).map(BlocksWrapper::len);
        let outcome = match existing_len {
            Some(len) if len >= batch.len() => PushOutcome::Superseded,
            Some(_) => {
                batches.insert(first, batch);
                PushOutcome::Replaced
            }
            None => {
                batches.insert(first, batch);
                PushOutcome::Queued
            }
        };
        drop(batches);
        if outcome != PushOutcome::Superseded {
            trace!(first, ?outcome, "batch queued for import");
            self.notify.notify_one();
        }
        Ok(outcome)
    }

    /// Removes the batch with the lowest first block number.
    pub fn try_pop(&self) -> Option<BlocksWrapper> {
        self.batches.lock().pop_first().map(|(_, batch)| batch)
    }

    /// Waits for the next batch. Returns `None` once shutdown is signalled.
    pub async fn pop(&self, shutdown: &mut watch::Receiver<bool>) -> Option<BlocksWrapper> {
        loop {
            if *shutdown.borrow() {
                return None;
            }
            if let Some(batch) = self.try_pop() {
                return Some(batch);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Wakes a waiting consumer without adding work.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.lock().is_empty()
    }
}
