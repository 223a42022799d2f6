//! Per-peer sync mode and its transition function.

use crate::types::{ImportOutcome, PeerId};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// How the scheduler computes the next header range for a peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Peer chain assumed to extend the local canonical chain.
    #[default]
    Normal,
    /// Searching backward for a common ancestor.
    Backward,
    /// Walking forward along a side chain after the fork point was found.
    Forward,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("normal"),
            Self::Backward => f.write_str("backward"),
            Self::Forward => f.write_str("forward"),
        }
    }
}

/// What the import pipeline observed for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportEvent {
    /// Every block was already imported or pruned.
    EmptyAfterFilter,
    /// The batch's last block is already stored; import skipped.
    SkippedKnown,
    /// Result of importing a freshly received batch. `salvageable` is set when
    /// the batch starts at or below local best + 1.
    Outcome {
        outcome: ImportOutcome,
        salvageable: bool,
    },
    /// Result of importing a batch drained from the pending store.
    Drained { outcome: ImportOutcome },
}

pub fn next_mode(current: SyncMode, event: ImportEvent) -> SyncMode {
    use SyncMode::{Backward, Forward, Normal};
    match event {
        ImportEvent::EmptyAfterFilter => Normal,
        ImportEvent::SkippedKnown => match current {
            Forward => Forward,
            Normal | Backward => Normal,
        },
        ImportEvent::Outcome {
            outcome,
            salvageable,
        } => match outcome {
            ImportOutcome::NoParent if salvageable => Backward,
            ImportOutcome::NoParent | ImportOutcome::Invalid => current,
            ImportOutcome::Exist | ImportOutcome::Imported { .. } => match current {
                Backward => Forward,
                Forward if outcome.is_best() => Normal,
                Forward => Forward,
                Normal => Normal,
            },
        },
        ImportEvent::Drained { outcome } => match outcome {
            ImportOutcome::Imported { best: true } => Normal,
            ImportOutcome::Exist | ImportOutcome::Imported { best: false } => match current {
                Backward => Forward,
                other => other,
            },
            ImportOutcome::NoParent | ImportOutcome::Invalid => current,
        },
    }
}

/// Current mode of every tracked peer.
///
/// The scheduler tracks and forgets peers and reads modes; only the import
/// pipeline applies transitions.
#[derive(Debug, Default)]
pub struct ModeTable {
    modes: RwLock<HashMap<PeerId, SyncMode>>,
}

impl ModeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, peer_id: PeerId) {
        self.modes.write().entry(peer_id).or_default();
    }

    pub fn forget(&self, peer_id: &PeerId) {
        self.modes.write().remove(peer_id);
    }

    pub fn mode(&self, peer_id: &PeerId) -> SyncMode {
        self.modes.read().get(peer_id).copied().unwrap_or_default()
    }

    /// Applies `event` to a tracked peer and returns its new mode. Untracked
    /// peers (already disconnected) are left alone.
    pub fn apply(&self, peer_id: &PeerId, event: ImportEvent) -> Option<SyncMode> {
        let mut modes = self.modes.write();
        let mode = modes.get_mut(peer_id)?;
        *mode = next_mode(*mode, event);
        Some(*mode)
    }

    pub fn counts(&self) -> HashMap<SyncMode, usize> {
        let mut counts = HashMap::new();
        for mode in self.modes.read().values() {
            *counts.entry(*mode).or_default() += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::peer;

    const ALL: [SyncMode; 3] = [SyncMode::Normal, SyncMode::Backward, SyncMode::Forward];

    fn outcome(outcome: ImportOutcome, salvageable: bool) -> ImportEvent {
        ImportEvent::Outcome {
            outcome,
            salvageable,
        }
    }

    #[test]
    fn empty_batch_always_resets_to_normal() {
        for mode in ALL {
            assert_eq!(next_mode(mode, ImportEvent::EmptyAfterFilter), SyncMode::Normal);
        }
    }

    #[test]
    fn stored_import_moves_backward_to_forward() {
        for stored in [
            ImportOutcome::Exist,
            ImportOutcome::Imported { best: false },
            ImportOutcome::Imported { best: true },
        ] {
            assert_eq!(
                next_mode(SyncMode::Backward, outcome(stored, false)),
                SyncMode::Forward
            );
        }
    }

    #[test]
    fn best_import_finishes_forward_walk() {
        assert_eq!(
            next_mode(
                SyncMode::Forward,
                outcome(ImportOutcome::Imported { best: true }, false)
            ),
            SyncMode::Normal
        );
        assert_eq!(
            next_mode(
                SyncMode::Forward,
                outcome(ImportOutcome::Imported { best: false }, false)
            ),
            SyncMode::Forward
        );
    }

    #[test]
    fn no_parent_enters_backward_only_when_salvageable() {
        for mode in ALL {
            assert_eq!(
                next_mode(mode, outcome(ImportOutcome::NoParent, true)),
                SyncMode::Backward
            );
            assert_eq!(next_mode(mode, outcome(ImportOutcome::NoParent, false)), mode);
            assert_eq!(next_mode(mode, outcome(ImportOutcome::Invalid, true)), mode);
        }
    }

    #[test]
    fn skipped_known_batch_keeps_forward_only() {
        assert_eq!(next_mode(SyncMode::Forward, ImportEvent::SkippedKnown), SyncMode::Forward);
        assert_eq!(next_mode(SyncMode::Backward, ImportEvent::SkippedKnown), SyncMode::Normal);
    }

    #[test]
    fn drained_outcomes() {
        let best = ImportEvent::Drained {
            outcome: ImportOutcome::Imported { best: true },
        };
        let stored = ImportEvent::Drained {
            outcome: ImportOutcome::Imported { best: false },
        };
        assert_eq!(next_mode(SyncMode::Backward, best), SyncMode::Normal);
        assert_eq!(next_mode(SyncMode::Backward, stored), SyncMode::Forward);
        assert_eq!(next_mode(SyncMode::Forward, stored), SyncMode::Forward);
    }

    #[test]
    fn table_ignores_untracked_peers() {
        let table = ModeTable::new();
        assert_eq!(table.apply(&peer(1), ImportEvent::EmptyAfterFilter), None);
        table.track(peer(1));
        assert_eq!(
            table.apply(&peer(1), outcome(ImportOutcome::NoParent, true)),
            Some(SyncMode::Backward)
        );
        assert_eq!(table.mode(&peer(1)), SyncMode::Backward);
        table.forget(&peer(1));
        assert_eq!(table.mode(&peer(1)), SyncMode::Normal);
    }
}
