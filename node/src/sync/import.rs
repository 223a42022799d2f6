//! Single-consumer block import loop.

use crate::chain::{ChainError, ChainMutator, FatalHandler};
use crate::storage::{PendingBlockStore, StoreError};
use crate::sync::cache::RecencyCache;
use crate::sync::fast::FastSyncCoordinator;
use crate::sync::mode::{ImportEvent, ModeTable, SyncMode};
use crate::sync::queue::ImportQueue;
use crate::sync::stats::SyncStats;
use crate::types::{Block, BlocksWrapper, ImportOutcome, PeerId};
use alloy_primitives::B256;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How often a gated pipeline re-checks fast-sync completeness.
const FAST_SYNC_POLL: Duration = Duration::from_secs(1);

/// What happened to one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Blocks left after filtering.
    pub filtered: usize,
    pub skipped: bool,
    pub outcome: Option<ImportOutcome>,
    pub imported: usize,
    pub stored_pending: usize,
    /// Blocks imported from the pending store afterwards.
    pub drained: usize,
    pub mode: Option<SyncMode>,
}

/// Pulls batches off the [`ImportQueue`] and hands them to the chain.
///
/// This is the only component that writes block data through
/// [`ChainMutator::try_to_connect`] during normal sync.
pub struct ImportPipeline {
    chain: Arc<dyn ChainMutator>,
    queue: Arc<ImportQueue>,
    pending: Arc<dyn PendingBlockStore>,
    imported: Arc<RecencyCache<B256>>,
    modes: Arc<ModeTable>,
    stats: Arc<SyncStats>,
    fatal: Arc<dyn FatalHandler>,
    fast_sync: Option<Arc<FastSyncCoordinator>>,
}

impl ImportPipeline {
    pub fn new(
        chain: Arc<dyn ChainMutator>,
        queue: Arc<ImportQueue>,
        pending: Arc<dyn PendingBlockStore>,
        imported: Arc<RecencyCache<B256>>,
        modes: Arc<ModeTable>,
        stats: Arc<SyncStats>,
        fatal: Arc<dyn FatalHandler>,
    ) -> Self {
        Self {
            chain,
            queue,
            pending,
            imported,
            modes,
            stats,
            fatal,
            fast_sync: None,
        }
    }

    /// Holds imports back until fast sync reports completion.
    pub fn with_fast_sync(mut self, fast_sync: Arc<FastSyncCoordinator>) -> Self {
        self.fast_sync = Some(fast_sync);
        self
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("import pipeline started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Some(fast_sync) = &self.fast_sync {
                if !fast_sync.is_complete() {
                    tokio::select! {
                        _ = tokio::time::sleep(FAST_SYNC_POLL) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    continue;
                }
            }
            let Some(batch) = self.queue.pop(&mut shutdown).await else {
                break;
            };
            self.process_batch(batch);
        }
        info!("import pipeline stopped");
    }

    /// Filters, imports, and interprets one batch, then drains any pending
    /// ranges it unblocked.
    pub fn process_batch(&self, batch: BlocksWrapper) -> BatchReport {
        let peer_id = batch.peer_id;
        let display_name = batch.display_name;
        let received = batch.blocks.len();
        let best_before = self.chain.best_block().number();
        let mode = self.modes.mode(&peer_id);
        let blocks = self.filter_blocks(batch.blocks);
        let mut report = BatchReport {
            filtered: blocks.len(),
            ..BatchReport::default()
        };

        let (Some(first), Some(last)) = (blocks.first(), blocks.last()) else {
            report.mode = self.modes.apply(&peer_id, ImportEvent::EmptyAfterFilter);
            debug!(peer = %display_name, received, "batch already imported");
            self.finish();
            return report;
        };
        let (first, last) = (first.id(), last.id());

        if mode != SyncMode::Backward && self.chain.is_block_stored(last.hash, last.number) {
            self.imported.insert(last.hash);
            report.skipped = true;
            report.mode = self.modes.apply(&peer_id, ImportEvent::SkippedKnown);
            debug!(
                peer = %display_name,
                first = first.number,
                last = last.number,
                "batch tail already stored; skipping"
            );
            self.finish();
            return report;
        }

        let result = match self.chain.try_to_connect(&blocks) {
            Ok(result) => result,
            Err(err) => {
                self.handle_chain_error(&err, &display_name);
                self.finish();
                return report;
            }
        };
        for hash in &result.imported {
            self.imported.insert(*hash);
        }
        report.imported = result.imported.len();
        report.outcome = Some(result.outcome);
        self.stats.record_imported(peer_id, result.imported.len() as u64);

        match result.outcome {
            ImportOutcome::NoParent => {
                report.stored_pending = self.store_pending(peer_id, &display_name, &blocks);
            }
            ImportOutcome::Invalid => {
                debug!(peer = %display_name, first = first.number, "batch rejected as invalid");
            }
            ImportOutcome::Exist | ImportOutcome::Imported { .. } => {}
        }

        let salvageable = first.number <= best_before + 1;
        report.mode = self.modes.apply(
            &peer_id,
            ImportEvent::Outcome {
                outcome: result.outcome,
                salvageable,
            },
        );
        if report.imported > 0 {
            info!(
                peer = %display_name,
                first = first.number,
                last = last.number,
                imported = report.imported,
                best = result.best_number,
                outcome = %result.outcome,
                "imported blocks"
            );
        } else {
            debug!(
                peer = %display_name,
                first = first.number,
                outcome = %result.outcome,
                mode = ?report.mode,
                "batch import finished"
            );
        }

        if result.outcome.is_stored() {
            let last_level = result.best_number.max(last.number) + 1;
            report.drained = self.import_from_pending(peer_id, &display_name, first.number, last_level);
        }
        self.finish();
        report
    }

    fn filter_blocks(&self, blocks: Vec<Block>) -> Vec<Block> {
        let prune = self.chain.has_prune_restriction();
        blocks
            .into_iter()
            .filter(|block| !self.imported.contains(&block.hash()))
            .filter(|block| !(prune && self.chain.is_prune_restricted(block.number())))
            .collect()
    }

    fn store_pending(&self, peer_id: PeerId, display_name: &str, blocks: &[Block]) -> usize {
        match self.pending.store_pending_range(blocks) {
            Ok(stored) => {
                self.stats.record_stored(peer_id, stored as u64);
                debug!(
                    peer = %display_name,
                    first = blocks.first().map(Block::number),
                    stored,
                    "parent missing; batch stored as pending"
                );
                stored
            }
            Err(err) => {
                self.handle_store_error(&err);
                0
            }
        }
    }

    /// Walks pending levels `from_level..=last_level`, importing stored
    /// ranges that now connect. `last_level` grows with the best block.
    fn import_from_pending(
        &self,
        peer_id: PeerId,
        display_name: &str,
        from_level: u64,
        mut last_level: u64,
    ) -> usize {
        let mut drained = 0;
        let mut level = from_level;
        while level <= last_level {
            let queues = match self.pending.load_pending_at_level(level) {
                Ok(queues) => queues,
                Err(err) => {
                    self.handle_store_error(&err);
                    break;
                }
            };
            if queues.is_empty() {
                level += 1;
                continue;
            }

            let mut done = Vec::new();
            for (key, blocks) in &queues {
                let filtered = self.filter_blocks(blocks.clone());
                let Some(tail) = filtered.last().map(Block::number) else {
                    done.push(*key);
                    continue;
                };
                let result = match self.chain.try_to_connect(&filtered) {
                    Ok(result) => result,
                    Err(err) => {
                        self.handle_chain_error(&err, display_name);
                        if err.is_fatal() {
                            return drained;
                        }
                        continue;
                    }
                };
                for hash in &result.imported {
                    self.imported.insert(*hash);
                }
                self.stats.record_imported(peer_id, result.imported.len() as u64);
                match result.outcome {
                    ImportOutcome::Exist | ImportOutcome::Imported { .. } => {
                        done.push(*key);
                        drained += result.imported.len();
                        last_level = last_level.max(result.best_number.max(tail) + 1);
                        self.modes.apply(
                            &peer_id,
                            ImportEvent::Drained {
                                outcome: result.outcome,
                            },
                        );
                    }
                    ImportOutcome::Invalid => {
                        debug!(level, "dropping invalid pending range");
                        done.push(*key);
                    }
                    ImportOutcome::NoParent => {}
                }
            }
            if !done.is_empty() {
                if let Err(err) = self.pending.drop_imported(level, &done, &queues) {
                    self.handle_store_error(&err);
                }
            }
            level += 1;
        }
        if drained > 0 {
            info!(
                peer = %display_name,
                drained,
                from_level,
                "imported blocks from pending store"
            );
        }
        drained
    }

    fn handle_chain_error(&self, err: &ChainError, display_name: &str) {
        if err.is_fatal() {
            error!(peer = %display_name, error = %err, "block import hit a fatal storage error");
            self.fatal.on_fatal(&err.to_string());
        } else {
            error!(peer = %display_name, error = %err, "block import failed; batch abandoned");
        }
    }

    fn handle_store_error(&self, err: &StoreError) {
        if err.is_fatal() {
            error!(error = %err, "pending store hit a fatal storage error");
            self.fatal.on_fatal(&err.to_string());
        } else {
            warn!(error = %err, "pending store operation failed");
        }
    }

    fn finish(&self) {
        let best = self.chain.best_block().number();
        self.stats.update_best(best);
    }
}
