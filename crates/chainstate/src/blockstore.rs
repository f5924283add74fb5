//! Raw block bytes in flat files, located through the block index.

use std::sync::Arc;

use ledgerd_consensus::Hash256;
use ledgerd_primitives::{Block, BlockHeader, Transaction, TxSpan};
use ledgerd_storage::{KeyValueStore, WriteBatch};
use primitive_types::U256;

use crate::blockindex::{BlockIndexEntry, ChainIndex, STATUS_HAVE_DATA};
use crate::error::{ChainError, StorageError};
use crate::flatfiles::FlatFileStore;

/// A stored block as seen by the chain selector.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockRef {
    pub hash: Hash256,
    pub height: i32,
    pub chainwork: U256,
}

impl BlockRef {
    pub fn from_entry(hash: Hash256, entry: &BlockIndexEntry) -> Self {
        Self {
            hash,
            height: entry.height,
            chainwork: entry.chainwork_value(),
        }
    }
}

pub struct BlockStore<S> {
    store: Arc<S>,
    index: ChainIndex<S>,
    files: FlatFileStore,
}

impl<S: KeyValueStore> BlockStore<S> {
    pub fn new(store: Arc<S>, files: FlatFileStore) -> Self {
        Self {
            index: ChainIndex::new(Arc::clone(&store)),
            store,
            files,
        }
    }

    pub fn index(&self) -> &ChainIndex<S> {
        &self.index
    }

    /// Writes the block bytes, then commits its index entry together with the
    /// arrival counter. The block is stored once that batch lands.
    pub fn put(&self, block: &Block, entry: &mut BlockIndexEntry) -> Result<BlockRef, ChainError> {
        let hash = block.hash();
        let location = self.files.append(&block.consensus_encode())?;
        entry.location = Some(location);
        entry.tx_count = block.transactions.len() as u32;
        entry.status |= STATUS_HAVE_DATA;

        let mut batch = WriteBatch::new();
        self.index.put(&mut batch, &hash, entry);
        self.index.set_next_sequence(&mut batch, entry.sequence + 1);
        self.store.write_batch(&batch)?;
        Ok(BlockRef::from_entry(hash, entry))
    }

    /// Records a header-only entry, used for blocks known to be invalid.
    pub fn put_entry(&self, hash: &Hash256, entry: &BlockIndexEntry) -> Result<(), ChainError> {
        let mut batch = WriteBatch::new();
        self.index.put(&mut batch, hash, entry);
        self.store.write_batch(&batch)?;
        Ok(())
    }

    pub fn get(&self, hash: &Hash256) -> Result<Block, ChainError> {
        let entry = self.index.get(hash)?.ok_or(ChainError::NotFound(*hash))?;
        let location = entry.location.ok_or(ChainError::NotFound(*hash))?;
        let bytes = self.files.read(location)?;
        Block::consensus_decode(&bytes).map_err(|err| {
            ChainError::StorageFailure(StorageError::Corrupt(format!("stored block: {err}")))
        })
    }

    pub fn get_header(&self, hash: &Hash256) -> Result<BlockHeader, ChainError> {
        self.index
            .get(hash)?
            .map(|entry| entry.header)
            .ok_or(ChainError::NotFound(*hash))
    }

    pub fn set_tip(&self, batch: &mut WriteBatch, hash: &Hash256) {
        self.index.set_tip(batch, hash);
    }

    /// Reads one transaction out of a stored block.
    pub fn read_transaction(
        &self,
        entry: &BlockIndexEntry,
        span: TxSpan,
    ) -> Result<Transaction, ChainError> {
        let location = entry
            .location
            .ok_or_else(|| ChainError::corrupt("indexed block has no data"))?;
        let bytes = self.files.read_range(location, span.offset, span.len)?;
        Transaction::consensus_decode(&bytes).map_err(|err| {
            ChainError::StorageFailure(StorageError::Corrupt(format!("stored tx: {err}")))
        })
    }

    pub fn sync(&self) -> Result<(), ChainError> {
        self.files.sync()?;
        Ok(())
    }
}
