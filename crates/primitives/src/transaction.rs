//! Transparent transaction type and its consensus encoding.

use ledgerd_consensus::Hash256;

use crate::encoding::{var_bytes_len, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::{OutPoint, OUTPOINT_SIZE};

/// Sequence value that opts an input out of lock-time enforcement.
pub const SEQUENCE_FINAL: u32 = u32::MAX;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }

    fn encoded_len(&self) -> usize {
        OUTPOINT_SIZE + var_bytes_len(&self.script_sig) + 4
    }
}

impl Decodable for TxIn {
    const MIN_LEN: usize = OUTPOINT_SIZE + 1 + 4;

    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }

    fn encoded_len(&self) -> usize {
        8 + var_bytes_len(&self.script_pubkey)
    }
}

impl Decodable for TxOut {
    const MIN_LEN: usize = 8 + 1;

    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// A coinbase has exactly one input, and that input spends the null outpoint.
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        crate::encoding::encode(self)
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        crate::encoding::decode(bytes)
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    pub fn serialized_size(&self) -> usize {
        self.encoded_len()
    }

    /// Sum of output values, or `None` on overflow.
    pub fn value_out(&self) -> Option<i64> {
        self.vout
            .iter()
            .try_fold(0i64, |acc, output| acc.checked_add(output.value))
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        self.vin.consensus_encode(encoder);
        self.vout.consensus_encode(encoder);
        encoder.write_u32_le(self.lock_time);
    }

    fn encoded_len(&self) -> usize {
        4 + self.vin.encoded_len() + self.vout.encoded_len() + 4
    }
}

impl Decodable for Transaction {
    const MIN_LEN: usize = 4 + 1 + 1 + 4;

    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            vin: Vec::consensus_decode(decoder)?,
            vout: Vec::consensus_decode(decoder)?,
            lock_time: decoder.read_u32_le()?,
        })
    }
}
