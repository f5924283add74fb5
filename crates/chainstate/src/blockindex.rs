//! Block index entries and the chain metadata stored next to them.

use std::sync::Arc;

use ledgerd_consensus::Hash256;
use ledgerd_pow::difficulty::{block_proof, CompactError, HeaderInfo};
use ledgerd_primitives::encoding::{DecodeError, Decoder, Encoder};
use ledgerd_primitives::BlockHeader;
use ledgerd_storage::{Column, KeyValueStore, WriteBatch};
use primitive_types::U256;

use crate::error::{ErrorKind, StorageError};
use crate::flatfiles::{FileLocation, FILE_LOCATION_LEN};

const BLOCK_INDEX_ENTRY_VERSION: u8 = 1;

const META_TIP_KEY: &[u8] = b"tip";
const META_UTXO_TIP_KEY: &[u8] = b"utxo_tip";
const META_NEXT_SEQUENCE_KEY: &[u8] = b"next_sequence";

pub const STATUS_HAVE_DATA: u8 = 1 << 0;
pub const STATUS_VALID: u8 = 1 << 1;
pub const STATUS_FAILED: u8 = 1 << 2;
pub const STATUS_FAILED_CHILD: u8 = 1 << 3;
const STATUS_FAILED_MASK: u8 = STATUS_FAILED | STATUS_FAILED_CHILD;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockIndexEntry {
    pub header: BlockHeader,
    pub height: i32,
    /// Cumulative work, big-endian.
    pub chainwork: [u8; 32],
    /// Arrival order; the lower value wins among equal-work tips.
    pub sequence: u64,
    pub status: u8,
    pub failure: Option<ErrorKind>,
    pub location: Option<FileLocation>,
    pub tx_count: u32,
}

impl BlockIndexEntry {
    pub fn genesis(header: BlockHeader) -> Result<Self, CompactError> {
        let work = block_proof(header.bits)?;
        Ok(Self::with_work(header, 0, work, 0))
    }

    /// Entry for a block extending `parent`.
    pub fn child_of(
        parent: &BlockIndexEntry,
        header: BlockHeader,
        sequence: u64,
    ) -> Result<Self, CompactError> {
        let work = parent
            .chainwork_value()
            .saturating_add(block_proof(header.bits)?);
        Ok(Self::with_work(header, parent.height + 1, work, sequence))
    }

    fn with_work(header: BlockHeader, height: i32, work: U256, sequence: u64) -> Self {
        Self {
            header,
            height,
            chainwork: work.to_big_endian(),
            sequence,
            status: 0,
            failure: None,
            location: None,
            tx_count: 0,
        }
    }

    pub fn has_data(&self) -> bool {
        (self.status & STATUS_HAVE_DATA) != 0
    }

    pub fn is_valid(&self) -> bool {
        (self.status & STATUS_VALID) != 0
    }

    pub fn is_failed(&self) -> bool {
        (self.status & STATUS_FAILED_MASK) != 0
    }

    pub fn mark_failed(&mut self, kind: ErrorKind, child: bool) {
        self.status |= if child {
            STATUS_FAILED_CHILD
        } else {
            STATUS_FAILED
        };
        self.failure = Some(kind);
    }

    pub fn chainwork_value(&self) -> U256 {
        U256::from_big_endian(&self.chainwork)
    }

    pub fn header_info(&self) -> HeaderInfo {
        HeaderInfo {
            height: i64::from(self.height),
            time: i64::from(self.header.time),
            bits: self.header.bits,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(160);
        encoder.write_u8(BLOCK_INDEX_ENTRY_VERSION);
        encoder.write_bytes(&self.header.consensus_encode());
        encoder.write_i32_le(self.height);
        encoder.write_bytes(&self.chainwork);
        encoder.write_u64_le(self.sequence);
        encoder.write_u8(self.status);
        encoder.write_u8(self.failure.map(ErrorKind::code).unwrap_or(0));
        match self.location {
            Some(location) => {
                encoder.write_u8(1);
                encoder.write_bytes(&location.encode());
            }
            None => encoder.write_u8(0),
        }
        encoder.write_u32_le(self.tx_count);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        if decoder.read_u8()? != BLOCK_INDEX_ENTRY_VERSION {
            return Err(DecodeError::InvalidData("unsupported block index version"));
        }
        let header = BlockHeader::consensus_decode(&decoder.read_fixed::<80>()?)?;
        let height = decoder.read_i32_le()?;
        let chainwork = decoder.read_fixed::<32>()?;
        let sequence = decoder.read_u64_le()?;
        let status = decoder.read_u8()?;
        let failure = match decoder.read_u8()? {
            0 => None,
            code => Some(
                ErrorKind::from_code(code)
                    .ok_or(DecodeError::InvalidData("unknown failure kind"))?,
            ),
        };
        let location = match decoder.read_u8()? {
            0 => None,
            _ => Some(
                FileLocation::decode(&decoder.read_fixed::<FILE_LOCATION_LEN>()?)
                    .ok_or(DecodeError::InvalidData("invalid block location"))?,
            ),
        };
        let tx_count = decoder.read_u32_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            header,
            height,
            chainwork,
            sequence,
            status,
            failure,
            location,
            tx_count,
        })
    }
}

/// Typed access to the block index, height index and chain metadata columns.
pub struct ChainIndex<S> {
    store: Arc<S>,
}

impl<S: KeyValueStore> ChainIndex<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn get(&self, hash: &Hash256) -> Result<Option<BlockIndexEntry>, StorageError> {
        let bytes = match self.store.get(Column::BlockIndex, hash)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        BlockIndexEntry::decode(&bytes)
            .map(Some)
            .map_err(|err| StorageError::Corrupt(format!("block index entry: {err}")))
    }

    pub fn put(&self, batch: &mut WriteBatch, hash: &Hash256, entry: &BlockIndexEntry) {
        batch.put(Column::BlockIndex, hash, entry.encode());
    }

    pub fn load_all(&self) -> Result<Vec<(Hash256, BlockIndexEntry)>, StorageError> {
        let mut entries = Vec::new();
        let mut corrupt = None;
        self.store
            .for_each_prefix(Column::BlockIndex, &[], &mut |key, value| {
                match (
                    <Hash256>::try_from(key),
                    BlockIndexEntry::decode(value),
                ) {
                    (Ok(hash), Ok(entry)) => entries.push((hash, entry)),
                    _ => corrupt = Some(key.to_vec()),
                }
                Ok(())
            })?;
        if let Some(key) = corrupt {
            return Err(StorageError::Corrupt(format!(
                "block index entry under {} byte key",
                key.len()
            )));
        }
        Ok(entries)
    }

    pub fn height_hash(&self, height: i32) -> Result<Option<Hash256>, StorageError> {
        match self.store.get(Column::HeightIndex, &height_key(height))? {
            Some(bytes) => decode_hash(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn set_height_hash(&self, batch: &mut WriteBatch, height: i32, hash: &Hash256) {
        batch.put(Column::HeightIndex, height_key(height), *hash);
    }

    pub fn clear_height_hash(&self, batch: &mut WriteBatch, height: i32) {
        batch.delete(Column::HeightIndex, height_key(height));
    }

    /// Canonical tip pointer; only moves once a reorganization has completed.
    pub fn tip(&self) -> Result<Option<Hash256>, StorageError> {
        self.meta_hash(META_TIP_KEY)
    }

    pub fn set_tip(&self, batch: &mut WriteBatch, hash: &Hash256) {
        batch.put(Column::Meta, META_TIP_KEY, *hash);
    }

    /// Block the UTXO set currently reflects; moves with every connect and
    /// disconnect.
    pub fn utxo_tip(&self) -> Result<Option<Hash256>, StorageError> {
        self.meta_hash(META_UTXO_TIP_KEY)
    }

    pub fn set_utxo_tip(&self, batch: &mut WriteBatch, hash: &Hash256) {
        batch.put(Column::Meta, META_UTXO_TIP_KEY, *hash);
    }

    pub fn next_sequence(&self) -> Result<u64, StorageError> {
        match self.store.get(Column::Meta, META_NEXT_SEQUENCE_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::Corrupt("next sequence".to_string()))?;
                Ok(u64::from_le_bytes(raw))
            }
            None => Ok(0),
        }
    }

    pub fn set_next_sequence(&self, batch: &mut WriteBatch, sequence: u64) {
        batch.put(Column::Meta, META_NEXT_SEQUENCE_KEY, sequence.to_le_bytes());
    }

    fn meta_hash(&self, key: &[u8]) -> Result<Option<Hash256>, StorageError> {
        match self.store.get(Column::Meta, key)? {
            Some(bytes) => decode_hash(&bytes).map(Some),
            None => Ok(None),
        }
    }
}

fn height_key(height: i32) -> [u8; 4] {
    (height as u32).to_be_bytes()
}

fn decode_hash(bytes: &[u8]) -> Result<Hash256, StorageError> {
    bytes
        .try_into()
        .map_err(|_| StorageError::Corrupt(format!("expected 32-byte hash, got {}", bytes.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> BlockIndexEntry {
        let header = BlockHeader {
            version: 1,
            prev_block: [3u8; 32],
            merkle_root: [4u8; 32],
            time: 1_700_000_000,
            bits: 0x207fffff,
            nonce: 9,
        };
        let mut entry = BlockIndexEntry::genesis(header).expect("entry");
        entry.status = STATUS_HAVE_DATA | STATUS_VALID;
        entry.location = Some(FileLocation {
            file_id: 2,
            offset: 88,
            len: 215,
        });
        entry.tx_count = 3;
        entry
    }

    #[test]
    fn entry_encoding_preserves_fields() {
        let entry = sample_entry();
        assert_eq!(
            BlockIndexEntry::decode(&entry.encode()).expect("decode"),
            entry
        );

        let mut failed = entry.clone();
        failed.location = None;
        failed.mark_failed(ErrorKind::DoubleSpend, true);
        let decoded = BlockIndexEntry::decode(&failed.encode()).expect("decode");
        assert!(decoded.is_failed());
        assert_eq!(decoded.failure, Some(ErrorKind::DoubleSpend));
    }

    #[test]
    fn child_accumulates_work() {
        let parent = sample_entry();
        let child = BlockIndexEntry::child_of(&parent, parent.header.clone(), 5).expect("child");
        assert_eq!(child.height, 1);
        assert_eq!(child.sequence, 5);
        assert_eq!(child.chainwork_value(), U256::from(4u64));
    }
}
