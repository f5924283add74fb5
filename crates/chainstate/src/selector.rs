//! Chain tip tracking and canonical tip choice.

use std::cmp::Reverse;
use std::collections::HashMap;

use ledgerd_consensus::Hash256;
use primitive_types::U256;

use crate::blockindex::BlockIndexEntry;
use crate::tree::BlockTree;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TipState {
    Candidate,
    /// Every block on its path connected cleanly.
    Validated,
    Active,
    Superseded,
    Failed,
}

impl TipState {
    pub fn as_str(self) -> &'static str {
        match self {
            TipState::Candidate => "candidate",
            TipState::Validated => "validated",
            TipState::Active => "active",
            TipState::Superseded => "superseded",
            TipState::Failed => "failed",
        }
    }

    fn is_selectable(self) -> bool {
        matches!(
            self,
            TipState::Candidate | TipState::Validated | TipState::Active
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TipRecord {
    pub height: i32,
    pub chainwork: U256,
    pub sequence: u64,
    pub state: TipState,
}

impl TipRecord {
    pub fn from_entry(entry: &BlockIndexEntry, state: TipState) -> Self {
        Self {
            height: entry.height,
            chainwork: entry.chainwork_value(),
            sequence: entry.sequence,
            state,
        }
    }
}

/// Leaves of the block tree with their cumulative work. The most-work tip is
/// canonical; among equal work the one seen first wins.
#[derive(Debug, Default)]
pub struct ChainSelector {
    tips: HashMap<Hash256, TipRecord>,
    active: Option<Hash256>,
}

impl ChainSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the tip set from stored blocks at startup.
    pub fn from_tree(tree: &BlockTree, active: Option<Hash256>) -> Self {
        let mut selector = Self::new();
        for (hash, entry) in tree.iter() {
            if !entry.has_data() || entry.is_failed() {
                continue;
            }
            let extended = tree.children(hash).iter().any(|child| {
                tree.get(child)
                    .is_some_and(|child| child.has_data() && !child.is_failed())
            });
            if extended && active != Some(*hash) {
                continue;
            }
            let state = if active == Some(*hash) {
                TipState::Active
            } else if entry.is_valid() {
                TipState::Validated
            } else {
                TipState::Candidate
            };
            selector.tips.insert(*hash, TipRecord::from_entry(entry, state));
        }
        selector.active = active;
        selector
    }

    pub fn get(&self, hash: &Hash256) -> Option<&TipRecord> {
        self.tips.get(hash)
    }

    pub fn active(&self) -> Option<&Hash256> {
        self.active.as_ref()
    }

    pub fn len(&self) -> usize {
        self.tips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tips.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Hash256, &TipRecord)> {
        self.tips.iter()
    }

    /// Registers a new leaf. Its parent stops being a tip unless it is the
    /// active one, which stays until something replaces it.
    pub fn insert(&mut self, hash: Hash256, parent: &Hash256, record: TipRecord) {
        if self
            .tips
            .get(parent)
            .is_some_and(|tip| tip.state != TipState::Active)
        {
            self.tips.remove(parent);
        }
        self.tips.insert(hash, record);
    }

    /// Makes a block a candidate again, e.g. when all its children failed.
    pub fn restore(&mut self, hash: Hash256, record: TipRecord) {
        self.tips.entry(hash).or_insert(record);
    }

    /// Most-work selectable tip; ties go to the lowest arrival sequence.
    pub fn best_candidate(&self) -> Option<(Hash256, TipRecord)> {
        self.tips
            .iter()
            .filter(|(_, tip)| tip.state.is_selectable())
            .max_by_key(|(_, tip)| (tip.chainwork, Reverse(tip.sequence)))
            .map(|(hash, tip)| (*hash, *tip))
    }

    /// The tip to switch to, if one has strictly more work than the active.
    pub fn pick_activation(&self) -> Option<Hash256> {
        let (best, record) = self.best_candidate()?;
        match self.active.and_then(|active| self.tips.get(&active).map(|tip| (active, tip))) {
            Some((active, _)) if active == best => None,
            Some((_, active)) if record.chainwork <= active.chainwork => None,
            _ => Some(best),
        }
    }

    pub fn mark_validated(&mut self, hash: &Hash256) {
        if let Some(tip) = self.tips.get_mut(hash) {
            if tip.state == TipState::Candidate {
                tip.state = TipState::Validated;
            }
        }
    }

    /// Promotes `hash`. The previous active tip is dropped when it is an
    /// ancestor of the new one and kept as superseded when it is a fork.
    pub fn activate(&mut self, hash: Hash256, previous_is_ancestor: bool) {
        if let Some(previous) = self.active.take() {
            if previous != hash {
                if previous_is_ancestor {
                    self.tips.remove(&previous);
                } else if let Some(tip) = self.tips.get_mut(&previous) {
                    tip.state = TipState::Superseded;
                }
            }
        }
        if let Some(tip) = self.tips.get_mut(&hash) {
            tip.state = TipState::Active;
        }
        self.active = Some(hash);
    }

    pub fn mark_failed(&mut self, hash: &Hash256) {
        if let Some(tip) = self.tips.get_mut(hash) {
            tip.state = TipState::Failed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(work: u64, sequence: u64, state: TipState) -> TipRecord {
        TipRecord {
            height: work as i32,
            chainwork: U256::from(work),
            sequence,
            state,
        }
    }

    #[test]
    fn first_seen_wins_ties() {
        let mut selector = ChainSelector::new();
        selector.insert([1u8; 32], &[0u8; 32], record(10, 1, TipState::Active));
        selector.activate([1u8; 32], true);
        selector.insert([2u8; 32], &[0u8; 32], record(10, 2, TipState::Candidate));
        assert_eq!(selector.best_candidate().map(|(hash, _)| hash), Some([1u8; 32]));
        assert_eq!(selector.pick_activation(), None);

        selector.insert([3u8; 32], &[2u8; 32], record(15, 3, TipState::Candidate));
        assert!(selector.get(&[2u8; 32]).is_none());
        assert_eq!(selector.pick_activation(), Some([3u8; 32]));

        selector.mark_validated(&[3u8; 32]);
        assert_eq!(
            selector.get(&[3u8; 32]).map(|tip| tip.state),
            Some(TipState::Validated)
        );
        selector.activate([3u8; 32], false);
        assert_eq!(
            selector.get(&[1u8; 32]).map(|tip| tip.state),
            Some(TipState::Superseded)
        );
        assert_eq!(selector.active(), Some(&[3u8; 32]));
    }

    #[test]
    fn failed_tips_are_skipped() {
        let mut selector = ChainSelector::new();
        selector.insert([1u8; 32], &[0u8; 32], record(10, 1, TipState::Active));
        selector.activate([1u8; 32], true);
        selector.insert([2u8; 32], &[1u8; 32], record(12, 2, TipState::Candidate));
        assert!(selector.get(&[1u8; 32]).is_some());
        selector.mark_failed(&[2u8; 32]);
        assert_eq!(selector.pick_activation(), None);
    }
}
