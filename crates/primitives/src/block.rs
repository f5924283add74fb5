//! Block header and block types.

use ledgerd_consensus::Hash256;

use crate::encoding::{varint_len, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::merkle::merkle_root;
use crate::transaction::Transaction;

pub const HEADER_SIZE: usize = 80;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn consensus_encode(&self) -> [u8; HEADER_SIZE] {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE);
        Encodable::consensus_encode(self, &mut encoder);
        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&encoder.into_inner());
        out
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        crate::encoding::decode(bytes)
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_block);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }

    fn encoded_len(&self) -> usize {
        HEADER_SIZE
    }
}

impl Decodable for BlockHeader {
    const MIN_LEN: usize = HEADER_SIZE;

    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash_le()?,
            merkle_root: decoder.read_hash_le()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }
}

/// Byte range of one transaction inside a serialized block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxSpan {
    pub offset: u32,
    pub len: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        crate::encoding::encode(self)
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        crate::encoding::decode(bytes)
    }

    pub fn serialized_size(&self) -> usize {
        self.encoded_len()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(Transaction::txid).collect()
    }

    /// Merkle root over the block's transactions and whether the tree is
    /// mutated by a duplicated sibling.
    pub fn compute_merkle_root(&self) -> (Hash256, bool) {
        merkle_root(&self.txids())
    }

    /// Position of every transaction within `consensus_encode` output.
    pub fn tx_spans(&self) -> Vec<TxSpan> {
        let mut offset = HEADER_SIZE + varint_len(self.transactions.len() as u64);
        let mut spans = Vec::with_capacity(self.transactions.len());
        for tx in &self.transactions {
            let len = tx.serialized_size();
            spans.push(TxSpan {
                offset: offset as u32,
                len: len as u32,
            });
            offset += len;
        }
        spans
    }
}

impl Encodable for Block {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        Encodable::consensus_encode(&self.header, encoder);
        self.transactions.consensus_encode(encoder);
    }

    fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.transactions.encoded_len()
    }
}

impl Decodable for Block {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            header: <BlockHeader as Decodable>::consensus_decode(decoder)?,
            transactions: Vec::consensus_decode(decoder)?,
        })
    }
}
