//! Address activity index: which transactions touch a payee.
//!
//! Keys are `destination || height (BE) || position (BE) || txid` with an
//! empty value, so a prefix scan yields activity in chain order.

use std::collections::BTreeSet;
use std::sync::Arc;

use ledgerd_consensus::Hash256;
use ledgerd_primitives::Block;
use ledgerd_script::standard::{extract_destination, Destination};
use ledgerd_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::StorageError;
use crate::undo::BlockUndo;

const ADDRESS_KEY_LEN: usize = Destination::KEY_LEN + 4 + 4 + 32;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct AddressActivity {
    pub txid: Hash256,
    pub height: u32,
    /// Position of the transaction within its block.
    pub position: u32,
}

pub fn address_key(dest: &Destination, activity: &AddressActivity) -> [u8; ADDRESS_KEY_LEN] {
    let mut key = [0u8; ADDRESS_KEY_LEN];
    let mut cursor = Destination::KEY_LEN;
    key[..cursor].copy_from_slice(&dest.to_key());
    key[cursor..cursor + 4].copy_from_slice(&activity.height.to_be_bytes());
    cursor += 4;
    key[cursor..cursor + 4].copy_from_slice(&activity.position.to_be_bytes());
    cursor += 4;
    key[cursor..].copy_from_slice(&activity.txid);
    key
}

fn decode_activity(key: &[u8]) -> Option<AddressActivity> {
    if key.len() != ADDRESS_KEY_LEN {
        return None;
    }
    let rest = &key[Destination::KEY_LEN..];
    Some(AddressActivity {
        height: u32::from_be_bytes(rest[0..4].try_into().ok()?),
        position: u32::from_be_bytes(rest[4..8].try_into().ok()?),
        txid: rest[8..40].try_into().ok()?,
    })
}

/// Every (destination, activity) pair a connected block produces, from its
/// outputs and from the outputs its inputs spent. A transaction paying and
/// spending the same address yields one record.
pub fn block_activity(
    block: &Block,
    txids: &[Hash256],
    height: i32,
    undo: &BlockUndo,
) -> Result<BTreeSet<(Destination, AddressActivity)>, StorageError> {
    let height = u32::try_from(height)
        .map_err(|_| StorageError::Corrupt("negative block height".to_string()))?;
    let mut records = BTreeSet::new();
    let mut spent = undo.spent.iter();
    for (position, (tx, txid)) in block.transactions.iter().zip(txids).enumerate() {
        let activity = AddressActivity {
            txid: *txid,
            height,
            position: position as u32,
        };
        if !tx.is_coinbase() {
            for _ in &tx.vin {
                let prev = spent
                    .next()
                    .ok_or_else(|| StorageError::Corrupt("undo shorter than block inputs".to_string()))?;
                if let Some(dest) = extract_destination(&prev.entry.script_pubkey) {
                    records.insert((dest, activity));
                }
            }
        }
        for output in &tx.vout {
            if let Some(dest) = extract_destination(&output.script_pubkey) {
                records.insert((dest, activity));
            }
        }
    }
    if spent.next().is_some() {
        return Err(StorageError::Corrupt(
            "undo longer than block inputs".to_string(),
        ));
    }
    Ok(records)
}

pub struct AddressIndex<S> {
    store: Arc<S>,
}

impl<S: KeyValueStore> AddressIndex<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn insert(&self, batch: &mut WriteBatch, dest: &Destination, activity: &AddressActivity) {
        batch.put(Column::AddressIndex, address_key(dest, activity), [0u8; 0]);
    }

    pub fn delete(&self, batch: &mut WriteBatch, dest: &Destination, activity: &AddressActivity) {
        batch.delete(Column::AddressIndex, address_key(dest, activity));
    }

    /// Activity for `dest` in ascending (height, position) order.
    pub fn scan(&self, dest: &Destination) -> Result<Vec<AddressActivity>, StorageError> {
        let mut out = Vec::new();
        let mut corrupt = false;
        self.store
            .for_each_prefix(Column::AddressIndex, &dest.to_key(), &mut |key, _| {
                match decode_activity(key) {
                    Some(activity) => out.push(activity),
                    None => corrupt = true,
                }
                Ok(())
            })?;
        if corrupt {
            return Err(StorageError::Corrupt("invalid address index key".to_string()));
        }
        Ok(out)
    }

    pub fn connect_block(
        &self,
        batch: &mut WriteBatch,
        block: &Block,
        txids: &[Hash256],
        height: i32,
        undo: &BlockUndo,
    ) -> Result<(), StorageError> {
        for (dest, activity) in block_activity(block, txids, height, undo)? {
            self.insert(batch, &dest, &activity);
        }
        Ok(())
    }

    pub fn disconnect_block(
        &self,
        batch: &mut WriteBatch,
        block: &Block,
        txids: &[Hash256],
        height: i32,
        undo: &BlockUndo,
    ) -> Result<(), StorageError> {
        for (dest, activity) in &block_activity(block, txids, height, undo)? {
            self.delete(batch, dest, activity);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerd_primitives::outpoint::OutPoint;
    use ledgerd_primitives::transaction::{Transaction, TxIn, TxOut};
    use ledgerd_primitives::BlockHeader;
    use ledgerd_script::standard::p2pkh_script;
    use ledgerd_storage::memory::MemoryStore;

    use crate::undo::SpentOutput;
    use crate::utxo::UtxoEntry;

    fn tx(prevout: OutPoint, script_pubkey: Vec<u8>) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout,
                script_sig: vec![0x51],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 10,
                script_pubkey,
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn spend_and_receive_are_recorded_once() {
        let alice = p2pkh_script(&[0xaa; 20]);
        let bob = p2pkh_script(&[0xbb; 20]);
        let coinbase = tx(OutPoint::null(), alice.clone());
        let pay_self = tx(OutPoint::new([9u8; 32], 0), alice.clone());
        let pay_bob = tx(OutPoint::new([8u8; 32], 0), bob);
        let block = Block {
            header: BlockHeader {
                version: 4,
                prev_block: [0u8; 32],
                merkle_root: [0u8; 32],
                time: 0,
                bits: 0x207fffff,
                nonce: 0,
            },
            transactions: vec![coinbase, pay_self, pay_bob],
        };
        let txids = block.txids();
        let spent_entry = UtxoEntry {
            value: 10,
            script_pubkey: alice,
            height: 1,
            is_coinbase: false,
        };
        let undo = BlockUndo {
            spent: vec![
                SpentOutput {
                    outpoint: OutPoint::new([9u8; 32], 0),
                    entry: spent_entry.clone(),
                },
                SpentOutput {
                    outpoint: OutPoint::new([8u8; 32], 0),
                    entry: spent_entry,
                },
            ],
            created: Vec::new(),
        };

        let store = Arc::new(MemoryStore::new());
        let index = AddressIndex::new(Arc::clone(&store));
        let mut batch = WriteBatch::new();
        index
            .connect_block(&mut batch, &block, &txids, 5, &undo)
            .expect("connect");
        store.write_batch(&batch).expect("write");

        let alice_activity = index
            .scan(&Destination::PubKeyHash([0xaa; 20]))
            .expect("scan");
        let positions: Vec<u32> = alice_activity.iter().map(|a| a.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        assert!(alice_activity.iter().all(|a| a.height == 5));
        let bob_activity = index
            .scan(&Destination::PubKeyHash([0xbb; 20]))
            .expect("scan");
        assert_eq!(bob_activity.len(), 1);
        assert_eq!(bob_activity[0].txid, txids[2]);

        let mut batch = WriteBatch::new();
        index
            .disconnect_block(&mut batch, &block, &txids, 5, &undo)
            .expect("disconnect");
        store.write_batch(&batch).expect("write");
        assert!(index
            .scan(&Destination::PubKeyHash([0xaa; 20]))
            .expect("scan")
            .is_empty());
    }

    #[test]
    fn short_undo_is_corrupt() {
        let block = Block {
            header: BlockHeader {
                version: 4,
                prev_block: [0u8; 32],
                merkle_root: [0u8; 32],
                time: 0,
                bits: 0x207fffff,
                nonce: 0,
            },
            transactions: vec![
                tx(OutPoint::null(), vec![0x51]),
                tx(OutPoint::new([1u8; 32], 0), vec![0x51]),
            ],
        };
        let txids = block.txids();
        assert!(block_activity(&block, &txids, 1, &BlockUndo::default()).is_err());
    }
}
