//! Transaction outpoint type.

use std::fmt;

use ledgerd_consensus::params::hash256_to_hex;
use ledgerd_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};

/// Serialized length of an outpoint: txid plus output index.
pub const OUTPOINT_SIZE: usize = 36;

#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash256, index: u32) -> Self {
        Self { hash, index }
    }

    pub fn null() -> Self {
        Self {
            hash: [0u8; 32],
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.index == u32::MAX && self.hash == [0u8; 32]
    }

    /// Fixed-width key form used by the UTXO column: txid, then the output
    /// index big-endian so a transaction's outputs sort in order.
    pub fn to_key(&self) -> [u8; OUTPOINT_SIZE] {
        let mut key = [0u8; OUTPOINT_SIZE];
        let (txid, index) = key.split_at_mut(32);
        txid.copy_from_slice(&self.hash);
        index.copy_from_slice(&self.index.to_be_bytes());
        key
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hash256_to_hex(&self.hash), self.index)
    }
}

impl Encodable for OutPoint {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_hash_le(&self.hash);
        encoder.write_u32_le(self.index);
    }

    fn encoded_len(&self) -> usize {
        OUTPOINT_SIZE
    }
}

impl Decodable for OutPoint {
    const MIN_LEN: usize = OUTPOINT_SIZE;

    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            hash: decoder.read_hash_le()?,
            index: decoder.read_u32_le()?,
        })
    }
}
