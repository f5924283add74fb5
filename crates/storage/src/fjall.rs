//! LSM backend: one fjall partition per [`Column`], batches committed
//! atomically across partitions.

use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use fjall::{Batch, Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

const SLOW_COMMIT: Duration = Duration::from_millis(500);
const SLOW_COMMIT_REPORT_EVERY: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Default)]
pub struct FjallOptions {
    /// Block cache size.
    pub cache_bytes: Option<u64>,
    /// Per-partition memtable size before a flush to disk.
    pub memtable_bytes: Option<u32>,
    /// Background journal fsync interval.
    pub fsync_ms: Option<u16>,
}

pub struct FjallStore {
    keyspace: Keyspace,
    partitions: Vec<PartitionHandle>,
    last_slow_report: Mutex<Option<Instant>>,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_options(path, FjallOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: FjallOptions,
    ) -> Result<Self, StoreError> {
        let mut config = Config::new(path);
        if let Some(bytes) = options.cache_bytes {
            config = config.cache_size(bytes);
        }
        if let Some(ms) = options.fsync_ms {
            config = config.fsync_ms(Some(ms));
        }
        let keyspace = config.open().map_err(backend)?;

        let mut partition_options = PartitionCreateOptions::default();
        if let Some(bytes) = options.memtable_bytes {
            partition_options = partition_options.max_memtable_size(bytes);
        }
        let partitions = Column::ALL
            .iter()
            .map(|column| keyspace.open_partition(column.as_str(), partition_options.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;

        Ok(Self {
            keyspace,
            partitions,
            last_slow_report: Mutex::new(None),
        })
    }

    fn partition(&self, column: Column) -> &PartitionHandle {
        // `partitions` is built from `Column::ALL`, which `Column::index` follows.
        &self.partitions[column.index()]
    }

    fn report_slow_commit(&self, batch: &WriteBatch, elapsed: Duration) {
        let Ok(mut last) = self.last_slow_report.lock() else {
            return;
        };
        if last.is_some_and(|at| at.elapsed() < SLOW_COMMIT_REPORT_EVERY) {
            return;
        }
        *last = Some(Instant::now());
        ledgerd_log::log_warn!(
            "Slow store commit: {}ms for {} ops (columns {:#x}, journals {})",
            elapsed.as_millis(),
            batch.len(),
            batch.touched(),
            self.keyspace.journal_count(),
        );
    }
}

impl KeyValueStore for FjallStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.partition(column).get(key).map_err(backend)?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let mut rows = Vec::new();
        self.for_each_prefix(column, prefix, &mut |key, value| {
            rows.push((key.to_vec(), value.to_vec()));
            Ok(())
        })?;
        Ok(rows)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        for entry in self.partition(column).prefix(prefix) {
            let (key, value) = entry.map_err(backend)?;
            visitor(key.as_ref(), value.as_ref())?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut commit = Batch::with_capacity(self.keyspace.clone(), batch.len())
            .durability(Some(PersistMode::Buffer));
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    commit.insert(self.partition(*column), key.as_slice(), value.as_slice());
                }
                WriteOp::Delete { column, key } => {
                    commit.remove(self.partition(*column), key.as_slice());
                }
            }
        }
        let started = Instant::now();
        commit.commit().map_err(backend)?;
        let elapsed = started.elapsed();
        if elapsed >= SLOW_COMMIT {
            self.report_slow_commit(batch, elapsed);
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.keyspace.persist(PersistMode::SyncAll).map_err(backend)
    }
}

fn backend(err: fjall::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}
