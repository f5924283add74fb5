//! UTXO set logic backed by the storage trait.

use std::collections::HashMap;
use std::sync::Arc;

use ledgerd_consensus::Hash256;
use ledgerd_primitives::encoding::{var_bytes_len, DecodeError, Decoder, Encoder};
use ledgerd_primitives::outpoint::OutPoint;
use ledgerd_primitives::Block;
use ledgerd_script::standard::is_unspendable;
use ledgerd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::undo::{BlockUndo, SpentOutput};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UtxoEntry {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
    pub height: u32,
    pub is_coinbase: bool,
}

impl UtxoEntry {
    /// Length of `encode` output.
    pub fn encoded_len(&self) -> usize {
        8 + var_bytes_len(&self.script_pubkey) + 4 + 1
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.encoded_len());
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_u32_le(self.height);
        encoder.write_u8(if self.is_coinbase { 1 } else { 0 });
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let height = decoder.read_u32_le()?;
        let is_coinbase = decoder.read_u8()? != 0;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            value,
            script_pubkey,
            height,
            is_coinbase,
        })
    }
}

#[derive(Debug)]
pub enum UtxoError {
    Missing(OutPoint),
    /// Spent earlier in the same block.
    AlreadySpent(OutPoint),
    Immature {
        outpoint: OutPoint,
        created: u32,
        spend_height: i32,
    },
    DuplicateOutput(OutPoint),
    Store(StoreError),
    Corrupt(String),
}

impl std::fmt::Display for UtxoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UtxoError::Missing(outpoint) => write!(f, "input {outpoint} missing or spent"),
            UtxoError::AlreadySpent(outpoint) => {
                write!(f, "input {outpoint} spent twice in one block")
            }
            UtxoError::Immature {
                outpoint,
                created,
                spend_height,
            } => write!(
                f,
                "coinbase output {outpoint} from height {created} spent at height {spend_height}"
            ),
            UtxoError::DuplicateOutput(outpoint) => {
                write!(f, "output {outpoint} already exists unspent")
            }
            UtxoError::Store(err) => write!(f, "{err}"),
            UtxoError::Corrupt(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for UtxoError {}

impl From<StoreError> for UtxoError {
    fn from(err: StoreError) -> Self {
        UtxoError::Store(err)
    }
}

/// Entries consumed by each transaction of a block, in input order. The
/// coinbase has none.
#[derive(Clone, Debug, Default)]
pub struct ResolvedInputs {
    pub spent: Vec<Vec<UtxoEntry>>,
}

impl ResolvedInputs {
    pub fn input_value(&self, tx_index: usize) -> Option<i64> {
        self.spent
            .get(tx_index)?
            .iter()
            .try_fold(0i64, |acc, entry| acc.checked_add(entry.value))
    }
}

pub struct UtxoSet<S> {
    store: Arc<S>,
}

impl<S> UtxoSet<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> UtxoSet<S> {
    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, UtxoError> {
        match self.store.get(Column::Utxo, &outpoint.to_key())? {
            Some(bytes) => UtxoEntry::decode(&bytes)
                .map(Some)
                .map_err(|err| UtxoError::Corrupt(format!("utxo {outpoint}: {err}"))),
            None => Ok(None),
        }
    }

    pub fn put(&self, batch: &mut WriteBatch, outpoint: &OutPoint, entry: &UtxoEntry) {
        batch.put(Column::Utxo, outpoint.to_key(), entry.encode());
    }

    pub fn delete(&self, batch: &mut WriteBatch, outpoint: &OutPoint) {
        batch.delete(Column::Utxo, outpoint.to_key());
    }

    /// Looks up every input of `block` against the set as it would stand
    /// after the block's earlier transactions were applied. Nothing is
    /// written.
    pub fn resolve(
        &self,
        block: &Block,
        txids: &[Hash256],
        height: i32,
        coinbase_maturity: i32,
    ) -> Result<ResolvedInputs, UtxoError> {
        // Some(entry) = created in this block, None = spent in this block.
        let mut overlay: HashMap<OutPoint, Option<UtxoEntry>> = HashMap::new();
        let mut spent = Vec::with_capacity(block.transactions.len());

        for (tx, txid) in block.transactions.iter().zip(txids) {
            let is_coinbase = tx.is_coinbase();
            let mut tx_spent = Vec::new();
            if !is_coinbase {
                tx_spent.reserve(tx.vin.len());
                for input in &tx.vin {
                    let prevout = &input.prevout;
                    let entry = match overlay.get_mut(prevout) {
                        Some(slot) => slot
                            .take()
                            .ok_or_else(|| UtxoError::AlreadySpent(prevout.clone()))?,
                        None => {
                            let entry = self
                                .get(prevout)?
                                .ok_or_else(|| UtxoError::Missing(prevout.clone()))?;
                            overlay.insert(prevout.clone(), None);
                            entry
                        }
                    };
                    if entry.is_coinbase
                        && height - (entry.height as i32) < coinbase_maturity
                    {
                        return Err(UtxoError::Immature {
                            outpoint: prevout.clone(),
                            created: entry.height,
                            spend_height: height,
                        });
                    }
                    tx_spent.push(entry);
                }
            }

            for (index, output) in tx.vout.iter().enumerate() {
                if is_unspendable(&output.script_pubkey) {
                    continue;
                }
                let outpoint = OutPoint::new(*txid, index as u32);
                let exists = match overlay.get(&outpoint) {
                    Some(slot) => slot.is_some(),
                    None => self.get(&outpoint)?.is_some(),
                };
                if exists {
                    return Err(UtxoError::DuplicateOutput(outpoint));
                }
                overlay.insert(
                    outpoint,
                    Some(UtxoEntry {
                        value: output.value,
                        script_pubkey: output.script_pubkey.clone(),
                        height: height as u32,
                        is_coinbase,
                    }),
                );
            }
            spent.push(tx_spent);
        }

        Ok(ResolvedInputs { spent })
    }

    /// Stages the block's effects into `batch` and returns the record that
    /// reverses them. Per transaction, spends are staged before creations so
    /// the batch's last-write-wins rule yields the sequential result.
    pub fn apply_resolved(
        &self,
        batch: &mut WriteBatch,
        block: &Block,
        txids: &[Hash256],
        height: i32,
        resolved: &ResolvedInputs,
    ) -> Result<BlockUndo, UtxoError> {
        if resolved.spent.len() != block.transactions.len() {
            return Err(UtxoError::Corrupt(
                "resolved inputs do not match block".to_string(),
            ));
        }
        let mut undo = BlockUndo::default();
        for ((tx, txid), tx_spent) in block.transactions.iter().zip(txids).zip(&resolved.spent) {
            let is_coinbase = tx.is_coinbase();
            if !is_coinbase {
                for (input, entry) in tx.vin.iter().zip(tx_spent) {
                    self.delete(batch, &input.prevout);
                    undo.spent.push(SpentOutput {
                        outpoint: input.prevout.clone(),
                        entry: entry.clone(),
                    });
                }
            }
            for (index, output) in tx.vout.iter().enumerate() {
                if is_unspendable(&output.script_pubkey) {
                    continue;
                }
                let outpoint = OutPoint::new(*txid, index as u32);
                self.put(
                    batch,
                    &outpoint,
                    &UtxoEntry {
                        value: output.value,
                        script_pubkey: output.script_pubkey.clone(),
                        height: height as u32,
                        is_coinbase,
                    },
                );
                undo.created.push(outpoint);
            }
        }
        Ok(undo)
    }

    pub fn apply_block(
        &self,
        batch: &mut WriteBatch,
        block: &Block,
        height: i32,
        coinbase_maturity: i32,
    ) -> Result<BlockUndo, UtxoError> {
        let txids = block.txids();
        let resolved = self.resolve(block, &txids, height, coinbase_maturity)?;
        self.apply_resolved(batch, block, &txids, height, &resolved)
    }

    /// Stages the exact inverse of `apply_resolved`, transaction by
    /// transaction from the last one.
    pub fn undo_block(
        &self,
        batch: &mut WriteBatch,
        block: &Block,
        undo: &BlockUndo,
    ) -> Result<(), UtxoError> {
        let mut spent_end = undo.spent.len();
        let mut created_end = undo.created.len();
        for tx in block.transactions.iter().rev() {
            let created_count = tx
                .vout
                .iter()
                .filter(|output| !is_unspendable(&output.script_pubkey))
                .count();
            let spent_count = if tx.is_coinbase() { 0 } else { tx.vin.len() };
            let created_start = created_end
                .checked_sub(created_count)
                .ok_or_else(|| UtxoError::Corrupt("undo record too short".to_string()))?;
            let spent_start = spent_end
                .checked_sub(spent_count)
                .ok_or_else(|| UtxoError::Corrupt("undo record too short".to_string()))?;

            for outpoint in &undo.created[created_start..created_end] {
                self.delete(batch, outpoint);
            }
            for spent in &undo.spent[spent_start..spent_end] {
                self.put(batch, &spent.outpoint, &spent.entry);
            }
            created_end = created_start;
            spent_end = spent_start;
        }
        if created_end != 0 || spent_end != 0 {
            return Err(UtxoError::Corrupt("undo record too long".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerd_primitives::{BlockHeader, Transaction, TxIn, TxOut};
    use ledgerd_storage::memory::MemoryStore;

    fn coinbase(tag: u8, value: i64) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![0x51, tag],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn spend(prevout: OutPoint, value: i64) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout,
                script_sig: vec![0x51],
                sequence: u32::MAX,
            }],
            vout: vec![
                TxOut {
                    value,
                    script_pubkey: vec![0x52],
                },
                TxOut {
                    value: 0,
                    script_pubkey: vec![0x6a, 0x01, 0x00],
                },
            ],
            lock_time: 0,
        }
    }

    fn block(transactions: Vec<Transaction>) -> Block {
        Block {
            header: BlockHeader {
                version: 1,
                prev_block: [0u8; 32],
                merkle_root: [0u8; 32],
                time: 0,
                bits: 0x207fffff,
                nonce: 0,
            },
            transactions,
        }
    }

    fn snapshot(store: &MemoryStore) -> Vec<(Vec<u8>, Vec<u8>)> {
        store.scan_prefix(Column::Utxo, &[]).expect("scan")
    }

    #[test]
    fn in_block_chain_and_exact_undo() {
        let store = Arc::new(MemoryStore::new());
        let utxos = UtxoSet::new(Arc::clone(&store));

        let first = block(vec![coinbase(1, 50)]);
        let mut batch = WriteBatch::new();
        utxos.apply_block(&mut batch, &first, 1, 0).expect("apply");
        store.write_batch(&batch).expect("commit");
        let before = snapshot(&store);

        let funding = OutPoint::new(first.transactions[0].txid(), 0);
        let tx_a = spend(funding, 40);
        let tx_b = spend(OutPoint::new(tx_a.txid(), 0), 30);
        let second = block(vec![coinbase(2, 50), tx_a, tx_b.clone()]);

        let mut batch = WriteBatch::new();
        let undo = utxos.apply_block(&mut batch, &second, 2, 0).expect("apply");
        store.write_batch(&batch).expect("commit");

        assert_eq!(undo.spent.len(), 2);
        assert_eq!(undo.created.len(), 3);
        assert!(utxos
            .get(&OutPoint::new(tx_b.txid(), 0))
            .expect("get")
            .is_some());
        assert!(utxos
            .get(&OutPoint::new(tx_b.txid(), 1))
            .expect("get")
            .is_none());

        let mut batch = WriteBatch::new();
        utxos.undo_block(&mut batch, &second, &undo).expect("undo");
        store.write_batch(&batch).expect("commit");
        assert_eq!(snapshot(&store), before);
    }

    #[test]
    fn rejects_double_spend_and_immature() {
        let store = Arc::new(MemoryStore::new());
        let utxos = UtxoSet::new(Arc::clone(&store));
        let first = block(vec![coinbase(1, 50)]);
        let mut batch = WriteBatch::new();
        utxos.apply_block(&mut batch, &first, 1, 0).expect("apply");
        store.write_batch(&batch).expect("commit");

        let funding = OutPoint::new(first.transactions[0].txid(), 0);
        let twice = block(vec![
            coinbase(2, 50),
            spend(funding.clone(), 10),
            spend(funding.clone(), 20),
        ]);
        let txids = twice.txids();
        assert!(matches!(
            utxos.resolve(&twice, &txids, 2, 0),
            Err(UtxoError::AlreadySpent(_))
        ));

        let early = block(vec![coinbase(3, 50), spend(funding.clone(), 10)]);
        let txids = early.txids();
        assert!(matches!(
            utxos.resolve(&early, &txids, 100, 100),
            Err(UtxoError::Immature { .. })
        ));
        utxos.resolve(&early, &txids, 101, 100).expect("mature");

        let missing = block(vec![coinbase(4, 50), spend(OutPoint::new([9u8; 32], 0), 1)]);
        let txids = missing.txids();
        assert!(matches!(
            utxos.resolve(&missing, &txids, 2, 0),
            Err(UtxoError::Missing(_))
        ));
    }
}
