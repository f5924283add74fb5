//! txid -> (block hash, byte span) records for canonical transactions.

use std::sync::Arc;

use ledgerd_consensus::Hash256;
use ledgerd_primitives::{Block, TxSpan};
use ledgerd_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::StorageError;

const RECORD_LEN: usize = 32 + 4 + 4;

/// Where a canonical transaction sits inside its stored block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxLocation {
    pub block_hash: Hash256,
    pub offset: u32,
    pub len: u32,
}

impl TxLocation {
    fn in_block(block_hash: Hash256, span: TxSpan) -> Self {
        Self {
            block_hash,
            offset: span.offset,
            len: span.len,
        }
    }

    pub fn span(&self) -> TxSpan {
        TxSpan {
            offset: self.offset,
            len: self.len,
        }
    }

    fn to_record(self) -> [u8; RECORD_LEN] {
        let mut record = [0u8; RECORD_LEN];
        let (hash, span) = record.split_at_mut(32);
        hash.copy_from_slice(&self.block_hash);
        span[..4].copy_from_slice(&self.offset.to_le_bytes());
        span[4..].copy_from_slice(&self.len.to_le_bytes());
        record
    }

    fn from_record(record: &[u8]) -> Option<Self> {
        let record: &[u8; RECORD_LEN] = record.try_into().ok()?;
        let (hash, span) = record.split_at(32);
        let (offset, len) = span.split_at(4);
        Some(Self {
            block_hash: hash.try_into().ok()?,
            offset: u32::from_le_bytes(offset.try_into().ok()?),
            len: u32::from_le_bytes(len.try_into().ok()?),
        })
    }
}

pub struct TxIndex<S> {
    store: Arc<S>,
}

impl<S: KeyValueStore> TxIndex<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn get(&self, txid: &Hash256) -> Result<Option<TxLocation>, StorageError> {
        self.store
            .get(Column::TxIndex, txid)?
            .map(|record| {
                TxLocation::from_record(&record)
                    .ok_or_else(|| StorageError::Corrupt("tx index record".to_string()))
            })
            .transpose()
    }

    /// Stages a record for every transaction of a connected block. A txid
    /// already indexed (a repeat after its outputs were spent) keeps the
    /// record of its first occurrence.
    pub fn connect_block(
        &self,
        batch: &mut WriteBatch,
        block: &Block,
        hash: &Hash256,
        txids: &[Hash256],
    ) -> Result<(), StorageError> {
        for (txid, span) in txids.iter().zip(block.tx_spans()) {
            if self.store.get(Column::TxIndex, txid)?.is_some() {
                continue;
            }
            let location = TxLocation::in_block(*hash, span);
            batch.put(Column::TxIndex, txid, location.to_record());
        }
        Ok(())
    }

    /// Stages removal of the records block `hash` wrote, last transaction
    /// first. Records owned by an earlier block stay.
    pub fn disconnect_block(
        &self,
        batch: &mut WriteBatch,
        hash: &Hash256,
        txids: &[Hash256],
    ) -> Result<(), StorageError> {
        for txid in txids.iter().rev() {
            if let Some(location) = self.get(txid)? {
                if location.block_hash == *hash {
                    batch.delete(Column::TxIndex, txid);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerd_storage::memory::MemoryStore;

    #[test]
    fn records_are_fixed_width() {
        let location = TxLocation {
            block_hash: [7u8; 32],
            offset: 81,
            len: 200,
        };
        let record = location.to_record();
        assert_eq!(&record[32..], &[81, 0, 0, 0, 200, 0, 0, 0]);
        assert_eq!(TxLocation::from_record(&record), Some(location));
        assert_eq!(TxLocation::from_record(&record[..39]), None);
    }

    #[test]
    fn block_records_come_and_go_together() {
        let store = Arc::new(MemoryStore::new());
        let index = TxIndex::new(Arc::clone(&store));
        let block = ledgerd_primitives::genesis_block(
            &ledgerd_consensus::consensus_params(ledgerd_consensus::Network::Regtest),
        );
        let hash = block.hash();
        let txids = block.txids();

        let mut batch = WriteBatch::new();
        index
            .connect_block(&mut batch, &block, &hash, &txids)
            .expect("stage");
        store.write_batch(&batch).expect("write");
        let location = index.get(&txids[0]).expect("get").expect("indexed");
        assert_eq!(location.block_hash, hash);
        assert_eq!(location.offset, 81);
        assert_eq!(location.len as usize, block.transactions[0].serialized_size());

        let mut batch = WriteBatch::new();
        index
            .disconnect_block(&mut batch, &hash, &txids)
            .expect("stage");
        store.write_batch(&batch).expect("write");
        assert_eq!(index.get(&txids[0]).expect("get"), None);
        assert_eq!(store.count(Column::TxIndex).expect("count"), 0);
    }

    #[test]
    fn malformed_record_is_corruption() {
        let store = Arc::new(MemoryStore::new());
        let mut batch = WriteBatch::new();
        batch.put(Column::TxIndex, &[3u8; 32], &[0u8; 7]);
        store.write_batch(&batch).expect("write");
        let index = TxIndex::new(store);
        assert!(matches!(index.get(&[3u8; 32]), Err(StorageError::Corrupt(_))));
    }

    #[test]
    fn repeated_txid_keeps_first_record() {
        let store = Arc::new(MemoryStore::new());
        let index = TxIndex::new(Arc::clone(&store));
        let block = ledgerd_primitives::genesis_block(
            &ledgerd_consensus::consensus_params(ledgerd_consensus::Network::Regtest),
        );
        let txids = block.txids();
        let (first, repeat) = ([1u8; 32], [2u8; 32]);

        for hash in [first, repeat] {
            let mut batch = WriteBatch::new();
            index
                .connect_block(&mut batch, &block, &hash, &txids)
                .expect("stage");
            store.write_batch(&batch).expect("write");
        }
        let location = index.get(&txids[0]).expect("get").expect("indexed");
        assert_eq!(location.block_hash, first);

        let mut batch = WriteBatch::new();
        index
            .disconnect_block(&mut batch, &repeat, &txids)
            .expect("stage");
        assert!(batch.is_empty());
    }
}
