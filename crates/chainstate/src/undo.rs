use std::sync::Arc;

use ledgerd_consensus::Hash256;
use ledgerd_primitives::encoding::{
    varint_len, Decodable, DecodeError, Decoder, Encodable, Encoder,
};
use ledgerd_primitives::outpoint::{OutPoint, OUTPOINT_SIZE};
use ledgerd_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::StorageError;
use crate::utxo::UtxoEntry;

const BLOCK_UNDO_VERSION: u8 = 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpentOutput {
    pub outpoint: OutPoint,
    pub entry: UtxoEntry,
}

/// What connecting one block removed from and added to the UTXO set, in
/// block order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockUndo {
    pub spent: Vec<SpentOutput>,
    pub created: Vec<OutPoint>,
}

impl Encodable for SpentOutput {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.outpoint.consensus_encode(encoder);
        encoder.write_var_bytes(&self.entry.encode());
    }

    fn encoded_len(&self) -> usize {
        let entry_len = self.entry.encoded_len();
        OUTPOINT_SIZE + varint_len(entry_len as u64) + entry_len
    }
}

impl Decodable for SpentOutput {
    const MIN_LEN: usize = OUTPOINT_SIZE + 1;

    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let outpoint = OutPoint::consensus_decode(decoder)?;
        let entry = UtxoEntry::decode(&decoder.read_var_bytes()?)
            .map_err(|_| DecodeError::InvalidData("invalid utxo entry in undo"))?;
        Ok(Self { outpoint, entry })
    }
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(BLOCK_UNDO_VERSION);
        self.spent.consensus_encode(&mut encoder);
        self.created.consensus_encode(&mut encoder);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        if decoder.read_u8()? != BLOCK_UNDO_VERSION {
            return Err(DecodeError::InvalidData("unsupported block undo version"));
        }
        let undo = Self {
            spent: Vec::consensus_decode(&mut decoder)?,
            created: Vec::consensus_decode(&mut decoder)?,
        };
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(undo)
    }
}

/// Undo records keyed by the hash of the block they reverse.
pub struct UndoStore<S> {
    store: Arc<S>,
}

impl<S: KeyValueStore> UndoStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn get(&self, hash: &Hash256) -> Result<Option<BlockUndo>, StorageError> {
        match self.store.get(Column::BlockUndo, hash)? {
            Some(bytes) => BlockUndo::decode(&bytes)
                .map(Some)
                .map_err(|err| StorageError::Corrupt(format!("block undo: {err}"))),
            None => Ok(None),
        }
    }

    pub fn put(&self, batch: &mut WriteBatch, hash: &Hash256, undo: &BlockUndo) {
        batch.put(Column::BlockUndo, hash, undo.encode());
    }

    pub fn delete(&self, batch: &mut WriteBatch, hash: &Hash256) {
        batch.delete(Column::BlockUndo, hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undo_encoding_rejects_trailing_and_version() {
        let undo = BlockUndo {
            spent: vec![SpentOutput {
                outpoint: OutPoint::new([5u8; 32], 1),
                entry: UtxoEntry {
                    value: 1_000,
                    script_pubkey: vec![0x51],
                    height: 12,
                    is_coinbase: true,
                },
            }],
            created: vec![OutPoint::new([6u8; 32], 0)],
        };
        let mut bytes = undo.encode();
        assert_eq!(BlockUndo::decode(&bytes).expect("decode"), undo);

        bytes.push(0);
        assert_eq!(BlockUndo::decode(&bytes), Err(DecodeError::TrailingBytes));
        bytes[0] = 9;
        assert!(BlockUndo::decode(&bytes).is_err());
    }
}
