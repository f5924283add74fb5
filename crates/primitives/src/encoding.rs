//! Consensus byte encoding: little-endian integers and CompactSize prefixes.

use ledgerd_consensus::Hash256;

/// Largest CompactSize accepted when decoding a length or count.
const MAX_COMPACT_SIZE: u64 = 0x0200_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof,
    NonCanonicalVarInt,
    SizeTooLarge,
    InvalidData(&'static str),
    TrailingBytes,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnexpectedEof => write!(f, "input ended early"),
            DecodeError::NonCanonicalVarInt => write!(f, "CompactSize not minimally encoded"),
            DecodeError::SizeTooLarge => write!(f, "CompactSize above {MAX_COMPACT_SIZE}"),
            DecodeError::InvalidData(message) => write!(f, "{message}"),
            DecodeError::TrailingBytes => write!(f, "bytes left over after decoding"),
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

pub struct Decoder<'a> {
    rest: &'a [u8],
}

macro_rules! le_integers {
    ($($ty:ty => $write:ident, $read:ident;)*) => {
        impl Encoder {
            $(
                pub fn $write(&mut self, value: $ty) {
                    self.buf.extend_from_slice(&value.to_le_bytes());
                }
            )*
        }

        impl Decoder<'_> {
            $(
                pub fn $read(&mut self) -> Result<$ty, DecodeError> {
                    self.read_fixed().map(<$ty>::from_le_bytes)
                }
            )*
        }
    };
}

le_integers! {
    u32 => write_u32_le, read_u32_le;
    i32 => write_i32_le, read_i32_le;
    u64 => write_u64_le, read_u64_le;
    i64 => write_i64_le, read_i64_le;
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_varint(&mut self, value: u64) {
        match value {
            0..=0xfc => self.buf.push(value as u8),
            0xfd..=0xffff => {
                self.buf.push(0xfd);
                self.buf.extend_from_slice(&(value as u16).to_le_bytes());
            }
            0x1_0000..=0xffff_ffff => {
                self.buf.push(0xfe);
                self.buf.extend_from_slice(&(value as u32).to_le_bytes());
            }
            _ => {
                self.buf.push(0xff);
                self.buf.extend_from_slice(&value.to_le_bytes());
            }
        }
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    /// Hashes are stored in internal (little-endian) byte order.
    pub fn write_hash_le(&mut self, hash: &Hash256) {
        self.buf.extend_from_slice(hash);
    }
}

/// Encoded length of a CompactSize prefix.
pub fn varint_len(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { rest: input }
    }

    pub fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.rest.len() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let (head, tail) = self.rest.split_at(len);
        self.rest = tail;
        Ok(head)
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_hash_le(&mut self) -> Result<Hash256, DecodeError> {
        self.read_fixed()
    }

    /// Reads a CompactSize, rejecting non-minimal encodings and values above
    /// `MAX_COMPACT_SIZE`.
    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let (value, minimum) = match self.read_u8()? {
            prefix @ 0..=0xfc => (u64::from(prefix), 0),
            0xfd => (u64::from(u16::from_le_bytes(self.read_fixed()?)), 0xfd),
            0xfe => (u64::from(self.read_u32_le()?), 0x1_0000),
            0xff => (self.read_u64_le()?, 0x1_0000_0000),
        };
        if value < minimum {
            return Err(DecodeError::NonCanonicalVarInt);
        }
        if value > MAX_COMPACT_SIZE {
            return Err(DecodeError::SizeTooLarge);
        }
        Ok(value)
    }

    /// Reads an element count, rejecting counts that cannot fit in the
    /// remaining input when each element takes at least `min_item_len` bytes.
    pub fn read_count(&mut self, min_item_len: usize) -> Result<usize, DecodeError> {
        let count = self.read_len()?;
        if count.saturating_mul(min_item_len.max(1)) > self.rest.len() {
            return Err(DecodeError::UnexpectedEof);
        }
        Ok(count)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_len()?;
        Ok(self.take(len)?.to_vec())
    }

    fn read_len(&mut self) -> Result<usize, DecodeError> {
        usize::try_from(self.read_varint()?).map_err(|_| DecodeError::SizeTooLarge)
    }
}

pub trait Encodable {
    fn consensus_encode(&self, encoder: &mut Encoder);

    /// Exact number of bytes `consensus_encode` writes.
    fn encoded_len(&self) -> usize;
}

pub trait Decodable: Sized {
    /// Fewest bytes one encoded value can occupy; bounds list counts.
    const MIN_LEN: usize = 1;

    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError>;
}

/// Lists are a CompactSize count followed by the elements.
impl<T: Encodable> Encodable for Vec<T> {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_varint(self.len() as u64);
        for item in self {
            item.consensus_encode(encoder);
        }
    }

    fn encoded_len(&self) -> usize {
        varint_len(self.len() as u64) + self.iter().map(Encodable::encoded_len).sum::<usize>()
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let count = decoder.read_count(T::MIN_LEN)?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::consensus_decode(decoder)?);
        }
        Ok(items)
    }
}

/// Encoded length of a length-prefixed byte string.
pub fn var_bytes_len(bytes: &[u8]) -> usize {
    varint_len(bytes.len() as u64) + bytes.len()
}

pub fn encode<T: Encodable>(value: &T) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(value.encoded_len());
    value.consensus_encode(&mut encoder);
    encoder.into_inner()
}

/// Decodes exactly one `T` from `bytes`.
pub fn decode<T: Decodable>(bytes: &[u8]) -> Result<T, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let value = T::consensus_decode(&mut decoder)?;
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(value)
}
