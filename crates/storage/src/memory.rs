use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

type Entries = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

/// Volatile backend used by tests and `--backend memory`.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<Entries>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Entries>, StoreError> {
        self.entries
            .read()
            .map_err(|_| StoreError::Poisoned("memory store"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Entries>, StoreError> {
        self.entries
            .write()
            .map_err(|_| StoreError::Poisoned("memory store"))
    }

    /// Number of entries in `column`.
    pub fn count(&self, column: Column) -> Result<usize, StoreError> {
        let entries = self.read()?;
        Ok(in_column(&entries, column, &[]).count())
    }
}

fn in_column<'a>(
    entries: &'a Entries,
    column: Column,
    prefix: &'a [u8],
) -> impl Iterator<Item = (&'a [u8], &'a [u8])> + 'a {
    entries
        .range((Bound::Included((column, prefix.to_vec())), Bound::Unbounded))
        .take_while(move |((entry_column, key), _)| {
            *entry_column == column && key.starts_with(prefix)
        })
        .map(|((_, key), value)| (key.as_slice(), value.as_slice()))
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self.read()?;
        Ok(entries.get(&(column, key.to_vec())).cloned())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let entries = self.read()?;
        Ok(in_column(&entries, column, prefix)
            .map(|(key, value)| (key.to_vec(), value.to_vec()))
            .collect())
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let entries = self.read()?;
        for (key, value) in in_column(&entries, column, prefix) {
            visitor(key, value)?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut entries = self.write()?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    entries.insert((*column, key.as_slice().to_vec()), value.as_slice().to_vec());
                }
                WriteOp::Delete { column, key } => {
                    entries.remove(&(*column, key.as_slice().to_vec()));
                }
            }
        }
        Ok(())
    }

    fn clear_column(&self, column: Column) -> Result<usize, StoreError> {
        let mut entries = self.write()?;
        let before = entries.len();
        entries.retain(|(entry_column, _), _| *entry_column != column);
        Ok(before - entries.len())
    }
}
