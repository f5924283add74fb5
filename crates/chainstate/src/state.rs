//! Connects and disconnects single blocks against the active chain.
//!
//! Each step builds one `WriteBatch` holding the UTXO changes, the undo
//! record, the index updates and the chain metadata, so a crash leaves the
//! store either before or after the whole block.

use std::sync::Arc;

use ledgerd_consensus::params::hash256_to_hex;
use ledgerd_consensus::{ChainParams, Hash256};
use ledgerd_storage::{KeyValueStore, WriteBatch};

use crate::blockindex::STATUS_VALID;
use crate::blockstore::BlockStore;
use crate::cancel::CancelToken;
use crate::error::ChainError;
use crate::flatfiles::FlatFileStore;
use crate::indexes::{BlockEffects, ChainEvent, IndexManager};
use crate::tree::ChainView;
use crate::undo::UndoStore;
use crate::utxo::{UtxoError, UtxoSet};
use crate::validation::{ancestor_window, BlockContext, BlockValidator};

pub struct ChainState<S> {
    store: Arc<S>,
    blocks: BlockStore<S>,
    utxos: UtxoSet<S>,
    undo: UndoStore<S>,
    indexes: IndexManager<S>,
    validator: BlockValidator,
    params: ChainParams,
    max_future_block_time: i64,
}

impl<S: KeyValueStore> ChainState<S> {
    pub fn new(
        store: Arc<S>,
        files: FlatFileStore,
        validator: BlockValidator,
        params: ChainParams,
        max_future_block_time: i64,
    ) -> Self {
        Self {
            blocks: BlockStore::new(Arc::clone(&store), files),
            utxos: UtxoSet::new(Arc::clone(&store)),
            undo: UndoStore::new(Arc::clone(&store)),
            indexes: IndexManager::new(Arc::clone(&store)),
            store,
            validator,
            params,
            max_future_block_time,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn blocks(&self) -> &BlockStore<S> {
        &self.blocks
    }

    pub fn utxos(&self) -> &UtxoSet<S> {
        &self.utxos
    }

    pub fn undo(&self) -> &UndoStore<S> {
        &self.undo
    }

    pub fn indexes(&self) -> &IndexManager<S> {
        &self.indexes
    }

    pub fn validator(&self) -> &BlockValidator {
        &self.validator
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn max_future_block_time(&self) -> i64 {
        self.max_future_block_time
    }

    /// Validates `hash` on top of the active tip and stages its effects.
    /// Nothing is written until the batch is committed.
    pub fn connect_block(
        &self,
        view: &ChainView,
        hash: &Hash256,
        cancel: &CancelToken,
        now: i64,
    ) -> Result<WriteBatch, ChainError> {
        let mut entry = view
            .tree
            .get(hash)
            .cloned()
            .ok_or(ChainError::NotFound(*hash))?;
        let height = entry.height;
        let extends_tip = if height == 0 {
            view.active.tip().is_none()
        } else {
            view.active.tip() == Some(&entry.header.prev_block)
                && view.active.height() + 1 == height
        };
        if !extends_tip {
            return Err(ChainError::corrupt(format!(
                "block {} does not extend the active tip",
                hash256_to_hex(hash)
            )));
        }

        let block = self.blocks.get(hash)?;
        let consensus = &self.params.consensus;
        let ancestors = if height == 0 {
            Vec::new()
        } else {
            view.tree
                .ancestors_info(&entry.header.prev_block, ancestor_window(height, consensus))
        };
        let ctx = BlockContext {
            height,
            ancestors: &ancestors,
            params: consensus,
            now,
            max_future_block_time: self.max_future_block_time,
        };
        let validated = self
            .validator
            .validate(&block, hash, &ctx, &self.utxos, cancel)?;

        let mut batch = WriteBatch::new();
        let undo = self
            .utxos
            .apply_resolved(&mut batch, &block, &validated.txids, height, &validated.resolved)
            .map_err(utxo_failure)?;
        self.undo.put(&mut batch, hash, &undo);
        self.indexes.apply(
            &mut batch,
            view.indexes,
            &ChainEvent::Connected(BlockEffects {
                block: &block,
                hash,
                height,
                txids: &validated.txids,
                undo: &undo,
            }),
        )?;
        let index = self.blocks.index();
        index.set_height_hash(&mut batch, height, hash);
        index.set_utxo_tip(&mut batch, hash);
        entry.status |= STATUS_VALID;
        index.put(&mut batch, hash, &entry);

        ledgerd_log::log_debug!(
            "Connect block {} height {} txs {} fees {}",
            hash256_to_hex(hash),
            height,
            block.transactions.len(),
            validated.fees
        );
        Ok(batch)
    }

    /// Stages the reversal of the active tip `hash`.
    pub fn disconnect_block(
        &self,
        view: &ChainView,
        hash: &Hash256,
    ) -> Result<WriteBatch, ChainError> {
        if view.active.tip() != Some(hash) {
            return Err(ChainError::corrupt(format!(
                "block {} is not the active tip",
                hash256_to_hex(hash)
            )));
        }
        let entry = view.tree.get(hash).ok_or(ChainError::NotFound(*hash))?;
        if entry.height == 0 {
            return Err(ChainError::corrupt("genesis cannot be disconnected"));
        }
        let block = self.blocks.get(hash)?;
        let undo = self.undo.get(hash)?.ok_or_else(|| {
            ChainError::corrupt(format!("missing undo for {}", hash256_to_hex(hash)))
        })?;
        let txids = block.txids();

        let mut batch = WriteBatch::new();
        self.utxos
            .undo_block(&mut batch, &block, &undo)
            .map_err(utxo_failure)?;
        self.indexes.apply(
            &mut batch,
            view.indexes,
            &ChainEvent::Disconnected(BlockEffects {
                block: &block,
                hash,
                height: entry.height,
                txids: &txids,
                undo: &undo,
            }),
        )?;
        self.undo.delete(&mut batch, hash);
        let index = self.blocks.index();
        index.clear_height_hash(&mut batch, entry.height);
        index.set_utxo_tip(&mut batch, &entry.header.prev_block);

        ledgerd_log::log_debug!(
            "Disconnect block {} height {}",
            hash256_to_hex(hash),
            entry.height
        );
        Ok(batch)
    }

    pub fn commit_batch(&self, batch: WriteBatch) -> Result<(), ChainError> {
        self.store.write_batch(&batch)?;
        Ok(())
    }

    /// Connects `hash` and commits it; the smallest interruptible unit.
    pub fn connect_tip(
        &self,
        view: &mut ChainView,
        hash: &Hash256,
        cancel: &CancelToken,
        now: i64,
    ) -> Result<(), ChainError> {
        cancel.check()?;
        let batch = self.connect_block(view, hash, cancel, now)?;
        self.commit_batch(batch)?;
        view.mark_connected(*hash);
        Ok(())
    }

    pub fn disconnect_tip(&self, view: &mut ChainView) -> Result<Hash256, ChainError> {
        let hash = *view
            .active
            .tip()
            .ok_or_else(|| ChainError::corrupt("no active tip to disconnect"))?;
        let batch = self.disconnect_block(view, &hash)?;
        self.commit_batch(batch)?;
        view.mark_disconnected();
        Ok(hash)
    }
}

/// Errors left after validation resolved every input are storage problems.
pub(crate) fn utxo_failure(err: UtxoError) -> ChainError {
    match err {
        UtxoError::Store(err) => ChainError::from(err),
        other => ChainError::corrupt(other.to_string()),
    }
}
