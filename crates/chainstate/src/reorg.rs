//! Moves the active chain from one tip to another, all or nothing.

use ledgerd_consensus::params::hash256_to_hex;
use ledgerd_consensus::Hash256;
use ledgerd_storage::{KeyValueStore, WriteBatch};

use crate::cancel::CancelToken;
use crate::error::ChainError;
use crate::state::ChainState;
use crate::tree::ChainView;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReorgPlan {
    pub fork: Hash256,
    pub fork_height: i32,
    /// Old-path blocks, tip first.
    pub disconnect: Vec<Hash256>,
    /// New-path blocks, fork child first.
    pub connect: Vec<Hash256>,
}

impl ReorgPlan {
    /// The block the active chain ends at once the plan is applied.
    pub fn target(&self) -> &Hash256 {
        self.connect.last().unwrap_or(&self.fork)
    }

    pub fn is_extension(&self) -> bool {
        self.disconnect.is_empty()
    }
}

/// A reorganization that did not reach its target. `failed` names the block
/// that was rejected, if the failure was a rejection.
#[derive(Debug)]
pub struct ReorgError {
    pub failed: Option<Hash256>,
    pub error: ChainError,
}

pub fn plan_reorg(view: &ChainView, target: &Hash256) -> Result<ReorgPlan, ChainError> {
    let tip = *view
        .active
        .tip()
        .ok_or_else(|| ChainError::corrupt("no active chain to reorganize"))?;
    let fork = view
        .tree
        .find_fork(&tip, target)
        .ok_or_else(|| ChainError::corrupt("target shares no ancestor with the active tip"))?;
    let fork_height = view
        .tree
        .get(&fork)
        .map(|entry| entry.height)
        .ok_or(ChainError::NotFound(fork))?;

    let mut disconnect = Vec::new();
    for height in (fork_height + 1..=view.active.height()).rev() {
        let hash = view
            .active
            .at(height)
            .ok_or_else(|| ChainError::corrupt("active chain has a gap"))?;
        disconnect.push(*hash);
    }

    let mut connect = Vec::new();
    let mut cursor = *target;
    while cursor != fork {
        connect.push(cursor);
        cursor = view
            .tree
            .parent(&cursor)
            .ok_or_else(|| ChainError::corrupt("target path does not reach the fork"))?;
    }
    connect.reverse();

    Ok(ReorgPlan {
        fork,
        fork_height,
        disconnect,
        connect,
    })
}

/// Disconnects the old path, connects the new one with full validation and
/// moves the persisted tip last. Any failure restores the old chain; if that
/// restore fails the returned error is a non-rolled-back `ReorgFailure`.
pub fn reorganize<S: KeyValueStore>(
    state: &ChainState<S>,
    view: &mut ChainView,
    plan: &ReorgPlan,
    cancel: &CancelToken,
    now: i64,
) -> Result<(), ReorgError> {
    if plan.disconnect.is_empty() && plan.connect.is_empty() {
        return Ok(());
    }
    let target = *plan.target();
    if !plan.is_extension() {
        ledgerd_log::log_info!(
            "Reorganizing at fork {} height {}: disconnect {}, connect {}",
            hash256_to_hex(&plan.fork),
            plan.fork_height,
            plan.disconnect.len(),
            plan.connect.len()
        );
    }

    if let Err((failed, error)) = apply_plan(state, view, plan, cancel, now) {
        return Err(roll_back(state, view, plan, now, failed, error));
    }

    let mut batch = WriteBatch::new();
    state.blocks().set_tip(&mut batch, &target);
    if let Err(error) = state.commit_batch(batch) {
        return Err(roll_back(state, view, plan, now, None, error));
    }
    Ok(())
}

fn apply_plan<S: KeyValueStore>(
    state: &ChainState<S>,
    view: &mut ChainView,
    plan: &ReorgPlan,
    cancel: &CancelToken,
    now: i64,
) -> Result<(), (Option<Hash256>, ChainError)> {
    for _ in &plan.disconnect {
        cancel.check().map_err(|err| (None, err))?;
        state.disconnect_tip(view).map_err(|err| (None, err))?;
    }
    for hash in &plan.connect {
        if let Err(err) = state.connect_tip(view, hash, cancel, now) {
            let failed = err.reject_reason().map(|_| *hash);
            return Err((failed, err));
        }
    }
    Ok(())
}

/// Returns the active chain to the old tip. Runs to completion regardless of
/// the shutdown signal.
fn roll_back<S: KeyValueStore>(
    state: &ChainState<S>,
    view: &mut ChainView,
    plan: &ReorgPlan,
    now: i64,
    failed: Option<Hash256>,
    error: ChainError,
) -> ReorgError {
    if matches!(error, ChainError::Interrupted) {
        ledgerd_log::log_info!("Reorganization interrupted; restoring previous tip");
    } else {
        ledgerd_log::log_warn!("Reorganization failed ({error}); restoring previous tip");
    }

    let result = restore_old_path(state, view, plan, now);
    match result {
        Ok(()) => ReorgError { failed, error },
        Err(rollback_error) => {
            ledgerd_log::log_error!(
                "Rollback to the previous tip failed: {rollback_error}; halting"
            );
            ReorgError {
                failed,
                error: ChainError::ReorgFailure {
                    cause: Box::new(error),
                    rolled_back: false,
                },
            }
        }
    }
}

fn restore_old_path<S: KeyValueStore>(
    state: &ChainState<S>,
    view: &mut ChainView,
    plan: &ReorgPlan,
    now: i64,
) -> Result<(), ChainError> {
    let restore = CancelToken::new();
    let old_path: Vec<Hash256> = plan.disconnect.iter().rev().copied().collect();
    while view.active.height() > plan.fork_height {
        let height = view.active.height();
        let offset = (height - plan.fork_height - 1) as usize;
        if view.active.at(height) == old_path.get(offset) {
            break;
        }
        state.disconnect_tip(view)?;
    }
    let start = (view.active.height() - plan.fork_height) as usize;
    for hash in old_path.iter().skip(start) {
        state.connect_tip(view, hash, &restore, now)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockindex::BlockIndexEntry;
    use crate::tree::{ActiveChain, BlockTree};
    use ledgerd_primitives::BlockHeader;

    fn child(tree: &mut BlockTree, parent: Hash256, height: i32, nonce: u32) -> Hash256 {
        let header = BlockHeader {
            version: 4,
            prev_block: parent,
            merkle_root: [0u8; 32],
            time: 1_000 + height as u32,
            bits: 0x207fffff,
            nonce,
        };
        let hash = header.hash();
        let entry = match tree.get(&parent) {
            Some(parent) => BlockIndexEntry::child_of(parent, header, height as u64),
            None => BlockIndexEntry::genesis(header),
        }
        .expect("entry");
        tree.insert(hash, entry);
        hash
    }

    #[test]
    fn plan_walks_both_sides_of_the_fork() {
        let mut tree = BlockTree::new();
        let genesis = child(&mut tree, [0u8; 32], 0, 0);
        let fork = child(&mut tree, genesis, 1, 0);
        let a2 = child(&mut tree, fork, 2, 1);
        let a3 = child(&mut tree, a2, 3, 1);
        let b2 = child(&mut tree, fork, 2, 2);
        let b3 = child(&mut tree, b2, 3, 2);
        let b4 = child(&mut tree, b3, 4, 2);

        let active = ActiveChain::from_tip(&tree, &a3).expect("active");
        let view = ChainView {
            tree,
            active,
            ..ChainView::default()
        };
        let plan = plan_reorg(&view, &b4).expect("plan");
        assert_eq!(plan.fork, fork);
        assert_eq!(plan.fork_height, 1);
        assert_eq!(plan.disconnect, vec![a3, a2]);
        assert_eq!(plan.connect, vec![b2, b3, b4]);
        assert!(!plan.is_extension());

        let extension = plan_reorg(&view, &a3).expect("plan");
        assert!(extension.connect.is_empty());
        assert_eq!(extension.target(), &a3);
    }
}
