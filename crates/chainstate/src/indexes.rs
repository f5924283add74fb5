//! Optional derived indexes and the ordered events that maintain them.

use std::sync::Arc;

use ledgerd_consensus::Hash256;
use ledgerd_primitives::Block;
use ledgerd_script::standard::Destination;
use ledgerd_storage::{Column, KeyValueStore, WriteBatch};

use crate::address_index::{AddressActivity, AddressIndex};
use crate::cancel::CancelToken;
use crate::config::IndexConfig;
use crate::error::{ChainError, StorageError};
use crate::txindex::{TxIndex, TxLocation};
use crate::undo::BlockUndo;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum IndexKind {
    Transaction,
    Address,
}

impl IndexKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexKind::Transaction => "transaction index",
            IndexKind::Address => "address index",
        }
    }

    fn meta_key(self) -> &'static [u8] {
        match self {
            IndexKind::Transaction => b"index_tx",
            IndexKind::Address => b"index_address",
        }
    }

    pub fn column(self) -> Column {
        match self {
            IndexKind::Transaction => Column::TxIndex,
            IndexKind::Address => Column::AddressIndex,
        }
    }
}

/// Persisted presence of an index.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IndexState {
    Absent,
    /// Kept in step with the active chain.
    Maintained,
    /// On disk but not updated since it was disabled.
    Stale,
}

impl IndexState {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(IndexState::Maintained),
            2 => Some(IndexState::Stale),
            _ => None,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            IndexState::Absent => 0,
            IndexState::Maintained => 1,
            IndexState::Stale => 2,
        }
    }
}

/// Indexes the engine currently maintains and answers queries from.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IndexFlags {
    pub tx_index: bool,
    pub address_index: bool,
}

impl IndexFlags {
    pub fn is_enabled(&self, kind: IndexKind) -> bool {
        match kind {
            IndexKind::Transaction => self.tx_index,
            IndexKind::Address => self.address_index,
        }
    }

    pub fn set(&mut self, kind: IndexKind, enabled: bool) {
        match kind {
            IndexKind::Transaction => self.tx_index = enabled,
            IndexKind::Address => self.address_index = enabled,
        }
    }
}

/// Effects of one connected or disconnected block.
pub struct BlockEffects<'a> {
    pub block: &'a Block,
    pub hash: &'a Hash256,
    pub height: i32,
    pub txids: &'a [Hash256],
    pub undo: &'a BlockUndo,
}

/// Chain mutations in the order they are committed.
pub enum ChainEvent<'a> {
    Connected(BlockEffects<'a>),
    Disconnected(BlockEffects<'a>),
}

pub struct IndexManager<S> {
    store: Arc<S>,
    tx: TxIndex<S>,
    address: AddressIndex<S>,
}

impl<S: KeyValueStore> IndexManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            tx: TxIndex::new(Arc::clone(&store)),
            address: AddressIndex::new(Arc::clone(&store)),
            store,
        }
    }

    /// Stages index updates for `event` in the same batch as the chain
    /// mutation. Transaction records go in before address records and come
    /// out after them.
    pub fn apply(
        &self,
        batch: &mut WriteBatch,
        flags: IndexFlags,
        event: &ChainEvent<'_>,
    ) -> Result<(), StorageError> {
        match event {
            ChainEvent::Connected(effects) => {
                if flags.tx_index {
                    self.tx
                        .connect_block(batch, effects.block, effects.hash, effects.txids)?;
                }
                if flags.address_index {
                    self.address.connect_block(
                        batch,
                        effects.block,
                        effects.txids,
                        effects.height,
                        effects.undo,
                    )?;
                }
            }
            ChainEvent::Disconnected(effects) => {
                if flags.address_index {
                    self.address.disconnect_block(
                        batch,
                        effects.block,
                        effects.txids,
                        effects.height,
                        effects.undo,
                    )?;
                }
                if flags.tx_index {
                    self.tx.disconnect_block(batch, effects.hash, effects.txids)?;
                }
            }
        }
        Ok(())
    }

    pub fn state(&self, kind: IndexKind) -> Result<IndexState, StorageError> {
        match self.store.get(Column::Meta, kind.meta_key())? {
            None => Ok(IndexState::Absent),
            Some(bytes) => bytes
                .first()
                .copied()
                .and_then(IndexState::from_byte)
                .filter(|_| bytes.len() == 1)
                .ok_or_else(|| StorageError::Corrupt(format!("{} flag", kind.as_str()))),
        }
    }

    pub fn set_state(&self, batch: &mut WriteBatch, kind: IndexKind, state: IndexState) {
        match state {
            IndexState::Absent => batch.delete(Column::Meta, kind.meta_key()),
            other => batch.put(Column::Meta, kind.meta_key(), [other.to_byte()]),
        }
    }

    pub fn lookup_tx(&self, txid: &Hash256) -> Result<Option<TxLocation>, StorageError> {
        self.tx.get(txid)
    }

    pub fn lookup_address(&self, dest: &Destination) -> Result<Vec<AddressActivity>, StorageError> {
        self.address.scan(dest)
    }

    /// Compares persisted index state with the configuration. Returns the
    /// flags to maintain and the indexes that must be rebuilt before use, in
    /// build order. Indexes disabled in config are marked stale.
    pub fn reconcile(&self, config: IndexConfig) -> Result<(IndexFlags, Vec<IndexKind>), ChainError> {
        if config.address_index && !config.tx_index {
            return Err(ChainError::DependencyViolation(
                "address index requires the transaction index",
            ));
        }
        let mut flags = IndexFlags::default();
        let mut rebuild = Vec::new();
        let mut batch = WriteBatch::new();
        for (kind, enabled) in [
            (IndexKind::Transaction, config.tx_index),
            (IndexKind::Address, config.address_index),
        ] {
            let state = self.state(kind)?;
            match (enabled, state) {
                (true, IndexState::Maintained) => flags.set(kind, true),
                (true, _) => rebuild.push(kind),
                (false, IndexState::Maintained) => {
                    ledgerd_log::log_warn!(
                        "{} is disabled; existing entries will not be updated",
                        kind.as_str()
                    );
                    self.set_state(&mut batch, kind, IndexState::Stale);
                }
                (false, _) => {}
            }
        }
        if !batch.is_empty() {
            self.store.write_batch(&batch)?;
        }
        Ok((flags, rebuild))
    }

    /// Removes an index. The presence flag goes first so an interrupted drop
    /// leaves an absent index with leftover entries, which a later rebuild
    /// clears.
    pub fn drop_index(&self, kind: IndexKind) -> Result<(), ChainError> {
        if kind == IndexKind::Transaction && self.state(IndexKind::Address)? != IndexState::Absent {
            return Err(ChainError::DependencyViolation(
                "drop the address index before the transaction index",
            ));
        }
        let mut batch = WriteBatch::new();
        self.set_state(&mut batch, kind, IndexState::Absent);
        self.store.write_batch(&batch)?;
        let removed = self.clear(kind)?;
        ledgerd_log::log_info!("Dropped {} ({} entries)", kind.as_str(), removed);
        Ok(())
    }

    /// Rebuilds an index by replaying the active chain from genesis.
    /// `load` yields the stored block and undo record for a hash.
    pub fn catch_up<'a, F>(
        &self,
        kind: IndexKind,
        active: impl Iterator<Item = &'a Hash256>,
        mut load: F,
        cancel: &CancelToken,
    ) -> Result<(), ChainError>
    where
        F: FnMut(&Hash256) -> Result<(Block, BlockUndo, i32), ChainError>,
    {
        if kind == IndexKind::Address && self.state(IndexKind::Transaction)? != IndexState::Maintained
        {
            return Err(ChainError::DependencyViolation(
                "address index requires the transaction index",
            ));
        }
        self.clear(kind)?;
        ledgerd_log::log_info!("Building {} from the active chain", kind.as_str());
        let mut flags = IndexFlags::default();
        flags.set(kind, true);
        let mut blocks = 0u64;
        for hash in active {
            cancel.check()?;
            let (block, undo, height) = load(hash)?;
            let txids = block.txids();
            let mut batch = WriteBatch::new();
            let event = ChainEvent::Connected(BlockEffects {
                block: &block,
                hash,
                height,
                txids: &txids,
                undo: &undo,
            });
            self.apply(&mut batch, flags, &event)?;
            self.store.write_batch(&batch)?;
            blocks += 1;
        }
        let mut batch = WriteBatch::new();
        self.set_state(&mut batch, kind, IndexState::Maintained);
        self.store.write_batch(&batch)?;
        ledgerd_log::log_info!("Built {} over {} blocks", kind.as_str(), blocks);
        Ok(())
    }

    fn clear(&self, kind: IndexKind) -> Result<usize, StorageError> {
        Ok(self.store.clear_column(kind.column())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerd_storage::memory::MemoryStore;

    fn manager() -> (Arc<MemoryStore>, IndexManager<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Arc::clone(&store), IndexManager::new(store))
    }

    fn mark(manager: &IndexManager<MemoryStore>, store: &MemoryStore, kind: IndexKind) {
        let mut batch = WriteBatch::new();
        manager.set_state(&mut batch, kind, IndexState::Maintained);
        batch.put(kind.column(), [1u8; 4], [0u8; 0]);
        store.write_batch(&batch).expect("write");
    }

    #[test]
    fn tx_index_cannot_be_dropped_under_address_index() {
        let (store, manager) = manager();
        mark(&manager, &store, IndexKind::Transaction);
        mark(&manager, &store, IndexKind::Address);

        let err = manager
            .drop_index(IndexKind::Transaction)
            .expect_err("dependency");
        assert!(matches!(err, ChainError::DependencyViolation(_)));
        assert_eq!(
            manager.state(IndexKind::Transaction).expect("state"),
            IndexState::Maintained
        );
        assert!(store
            .get(Column::TxIndex, &[1u8; 4])
            .expect("get")
            .is_some());

        manager.drop_index(IndexKind::Address).expect("drop address");
        manager.drop_index(IndexKind::Transaction).expect("drop tx");
        assert_eq!(
            manager.state(IndexKind::Address).expect("state"),
            IndexState::Absent
        );
        assert!(store
            .scan_prefix(Column::TxIndex, &[])
            .expect("scan")
            .is_empty());
    }

    #[test]
    fn reconcile_marks_disabled_indexes_stale() {
        let (store, manager) = manager();
        mark(&manager, &store, IndexKind::Transaction);

        let (flags, rebuild) = manager
            .reconcile(IndexConfig::default())
            .expect("reconcile");
        assert_eq!(flags, IndexFlags::default());
        assert!(rebuild.is_empty());
        assert_eq!(
            manager.state(IndexKind::Transaction).expect("state"),
            IndexState::Stale
        );

        let (flags, rebuild) = manager
            .reconcile(IndexConfig {
                tx_index: true,
                address_index: true,
            })
            .expect("reconcile");
        assert_eq!(flags, IndexFlags::default());
        assert_eq!(rebuild, vec![IndexKind::Transaction, IndexKind::Address]);

        let err = manager
            .reconcile(IndexConfig {
                tx_index: false,
                address_index: true,
            })
            .expect_err("dependency");
        assert!(matches!(err, ChainError::DependencyViolation(_)));
    }
}
