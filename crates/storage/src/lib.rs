//! Column-oriented key/value storage for chain state.
//!
//! Every mutation goes through a [`WriteBatch`] so that a connected block, its
//! undo data and its index entries land together or not at all.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

/// Deletes issued per batch when a column is cleared.
pub const CLEAR_CHUNK: usize = 10_000;

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
    Poisoned(&'static str),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "backend: {message}"),
            StoreError::Poisoned(what) => write!(f, "{what} lock poisoned"),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    /// Header, height, work and status of every known block.
    BlockIndex,
    /// Canonical height to hash.
    HeightIndex,
    Meta,
    Utxo,
    BlockUndo,
    TxIndex,
    AddressIndex,
}

impl Column {
    pub const ALL: [Column; 7] = [
        Column::BlockIndex,
        Column::HeightIndex,
        Column::Meta,
        Column::Utxo,
        Column::BlockUndo,
        Column::TxIndex,
        Column::AddressIndex,
    ];

    /// Position in `ALL`; backends use it to address per-column handles.
    pub const fn index(self) -> usize {
        match self {
            Column::BlockIndex => 0,
            Column::HeightIndex => 1,
            Column::Meta => 2,
            Column::Utxo => 3,
            Column::BlockUndo => 4,
            Column::TxIndex => 5,
            Column::AddressIndex => 6,
        }
    }

    pub const fn bit(self) -> u32 {
        1 << self.index()
    }

    /// True for columns that are a pure function of the canonical chain and
    /// can be rebuilt from stored blocks.
    pub const fn is_derived(self) -> bool {
        !matches!(self, Column::BlockIndex | Column::Meta)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Column::BlockIndex => "block_index",
            Column::HeightIndex => "height_index",
            Column::Meta => "meta",
            Column::Utxo => "utxo",
            Column::BlockUndo => "block_undo",
            Column::TxIndex => "tx_index",
            Column::AddressIndex => "address_index",
        }
    }
}

/// Byte string stored inline up to `N` bytes. Most keys (hash plus a small
/// suffix) and most values fit without a heap allocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InlineBytes<const N: usize>(SmallVec<[u8; N]>);

pub type WriteKey = InlineBytes<72>;
pub type WriteValue = InlineBytes<48>;

impl<const N: usize> InlineBytes<N> {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl<const N: usize> AsRef<[u8]> for InlineBytes<N> {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<const N: usize> From<Vec<u8>> for InlineBytes<N> {
    fn from(value: Vec<u8>) -> Self {
        Self(SmallVec::from_vec(value))
    }
}

impl<const N: usize> From<&[u8]> for InlineBytes<N> {
    fn from(value: &[u8]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

impl<const N: usize, const M: usize> From<[u8; M]> for InlineBytes<N> {
    fn from(value: [u8; M]) -> Self {
        Self(SmallVec::from_slice(&value))
    }
}

impl<const N: usize, const M: usize> From<&[u8; M]> for InlineBytes<N> {
    fn from(value: &[u8; M]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

#[derive(Clone, Debug)]
pub enum WriteOp {
    Put {
        column: Column,
        key: WriteKey,
        value: WriteValue,
    },
    Delete {
        column: Column,
        key: WriteKey,
    },
}

impl WriteOp {
    pub fn column(&self) -> Column {
        match self {
            WriteOp::Put { column, .. } | WriteOp::Delete { column, .. } => *column,
        }
    }
}

/// Ordered mutations committed all-or-nothing by `KeyValueStore::write_batch`.
///
/// Operations apply in insertion order, so a put followed by a delete of the
/// same key leaves the key absent.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ops: Vec::with_capacity(capacity),
        }
    }

    pub fn put(&mut self, column: Column, key: impl Into<WriteKey>, value: impl Into<WriteValue>) {
        self.ops.push(WriteOp::Put {
            column,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<WriteKey>) {
        self.ops.push(WriteOp::Delete {
            column,
            key: key.into(),
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Bitmask of `Column::bit` values touched by this batch.
    pub fn touched(&self) -> u32 {
        self.ops.iter().fold(0, |acc, op| acc | op.column().bit())
    }
}

pub type ScanResult = Vec<(Vec<u8>, Vec<u8>)>;
pub type PrefixVisitor<'a> = dyn FnMut(&[u8], &[u8]) -> Result<(), StoreError> + 'a;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Entries whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError>;

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError>;

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;

    /// Removes every entry of `column`, returning how many were removed.
    ///
    /// Deletes are committed in chunks of `CLEAR_CHUNK`, so an interrupted
    /// clear can leave a partially emptied column behind.
    fn clear_column(&self, column: Column) -> Result<usize, StoreError> {
        let mut keys = Vec::new();
        self.for_each_prefix(column, &[], &mut |key, _| {
            keys.push(key.to_vec());
            Ok(())
        })?;
        for chunk in keys.chunks(CLEAR_CHUNK) {
            let mut batch = WriteBatch::with_capacity(chunk.len());
            for key in chunk {
                batch.delete(column, key.as_slice());
            }
            self.write_batch(&batch)?;
        }
        Ok(keys.len())
    }

    /// Makes every committed batch durable.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        (**self).scan_prefix(column, prefix)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        (**self).for_each_prefix(column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        (**self).write_batch(batch)
    }

    fn clear_column(&self, column: Column) -> Result<usize, StoreError> {
        (**self).clear_column(column)
    }

    fn flush(&self) -> Result<(), StoreError> {
        (**self).flush()
    }
}
