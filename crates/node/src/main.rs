pub mod config;
mod host;
pub mod import;
mod stats;

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use ledgerd_chainstate::{CancelToken, ChainEngine, ChainError};
use ledgerd_consensus::params::{chain_params, Network};
use ledgerd_log as logging;
use ledgerd_log::{log_error, log_info, log_warn};
use ledgerd_script::CommitmentVerifier;
use ledgerd_storage::fjall::{FjallOptions, FjallStore};
use ledgerd_storage::memory::MemoryStore;
use ledgerd_storage::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch};
use tokio::sync::watch;

use crate::config::{usage, Backend, CliAction, Config};
use crate::host::{wait_for_shutdown, ProcessHost, Shutdown};
use crate::stats::{log_status, snapshot_status};

const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";
const HALT_POLL: Duration = Duration::from_secs(1);

pub enum Store {
    Memory(MemoryStore),
    Fjall(FjallStore),
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        match self {
            Store::Memory(store) => store.scan_prefix(column, prefix),
            Store::Fjall(store) => store.scan_prefix(column, prefix),
        }
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.for_each_prefix(column, prefix, visitor),
            Store::Fjall(store) => store.for_each_prefix(column, prefix, visitor),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            Store::Fjall(store) => store.write_batch(batch),
        }
    }

    fn clear_column(&self, column: Column) -> Result<usize, StoreError> {
        match self {
            Store::Memory(store) => store.clear_column(column),
            Store::Fjall(store) => store.clear_column(column),
        }
    }

    fn flush(&self) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.flush(),
            Store::Fjall(store) => store.flush(),
        }
    }
}

struct DataDirLock {
    _file: File,
}

/// Flushes the engine when the node leaves `run_node` on any path.
struct EngineGuard {
    engine: Arc<ChainEngine<Store>>,
}

impl Drop for EngineGuard {
    fn drop(&mut self) {
        match self.engine.flush() {
            Ok(()) => log_info!("Chain state flushed"),
            Err(err) => log_error!("failed to flush chain state: {err}"),
        }
    }
}

fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let pid = std::process::id();
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={pid}");
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            let suffix = if holder.is_empty() {
                String::new()
            } else {
                format!(" ({holder})")
            };
            Err(format!(
                "data dir {} is already locked (another ledgerd instance may be running); lock file {}{suffix}",
                data_dir.display(),
                lock_path.display()
            ))
        }
        Err(err) => Err(format!(
            "failed to lock data dir {} (lock file {}): {err}",
            data_dir.display(),
            lock_path.display()
        )),
    }
}

fn open_store(config: &Config, db_path: &Path) -> Result<Store, String> {
    match config.backend {
        Backend::Memory => {
            log_warn!("Using the memory backend; chain state is lost on exit");
            Ok(Store::Memory(MemoryStore::new()))
        }
        Backend::Fjall => {
            let options = FjallOptions {
                cache_bytes: Some(config.db_cache_mb.saturating_mul(1024 * 1024)),
                memtable_bytes: None,
                fsync_ms: config.db_fsync_ms,
            };
            FjallStore::open_with_options(db_path, options)
                .map(Store::Fjall)
                .map_err(|err| format!("failed to open store {}: {err}", db_path.display()))
        }
    }
}

pub async fn run_entry() -> Result<(), String> {
    match config::parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("ledgerd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_with_config(Instant::now(), config).await,
    }
}

async fn run_with_config(start_time: Instant, config: Config) -> Result<(), String> {
    let log_guard = logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
        file: config.log_file.clone(),
    })
    .map_err(|err| format!("failed to open log file: {err}"))?;

    let host = ProcessHost::from_mode(config.host);
    log_info!(
        "ledgerd {} starting (network={}, backend={}, host={}, data_dir={})",
        env!("CARGO_PKG_VERSION"),
        config.network.as_str(),
        config.backend.as_str(),
        host.as_str(),
        config.data_dir.display()
    );

    let result = run_node(start_time, &config, host).await;
    if let Err(err) = &result {
        log_error!("{err}");
    }
    log_info!("Shutdown complete");
    drop(log_guard);
    result
}

async fn run_node(start_time: Instant, config: &Config, host: ProcessHost) -> Result<(), String> {
    let (shutdown, shutdown_rx) = Shutdown::new(CancelToken::new());
    let shutdown = Arc::new(shutdown);
    host.start(Arc::clone(&shutdown));
    if shutdown.is_requested() {
        return Ok(());
    }

    let network_dir = config.network_dir();
    fs::create_dir_all(&network_dir)
        .map_err(|err| format!("failed to create {}: {err}", network_dir.display()))?;
    let _data_dir_lock = lock_data_dir(&network_dir)?;
    let store = Arc::new(open_store(config, &network_dir.join("db"))?);

    let mut chain_config = config.chain_config();
    if config.drop_requested() {
        chain_config.indexes.tx_index &= !config.drop_tx_index;
        chain_config.indexes.address_index &= !config.drop_address_index;
    }
    let blocks_dir = network_dir.join("blocks");
    let cancel = shutdown.token().clone();
    let open_started = Instant::now();
    let engine = tokio::task::spawn_blocking(move || {
        ChainEngine::open(
            store,
            &blocks_dir,
            chain_config,
            Arc::new(CommitmentVerifier),
            cancel,
        )
    })
    .await
    .map_err(|err| format!("engine open task failed: {err}"))?
    .map_err(|err| format!("failed to open chain state: {err}"))?;
    let engine = Arc::new(engine);
    let _engine_guard = EngineGuard {
        engine: Arc::clone(&engine),
    };
    log_info!(
        "Chain state opened in {}ms",
        open_started.elapsed().as_millis()
    );

    if shutdown.is_requested() {
        return Ok(());
    }
    if config.drop_requested() {
        return run_drop_commands(&engine, config);
    }

    let status_task = (config.status_interval_secs > 0).then(|| {
        tokio::spawn(status_loop(
            Arc::clone(&engine),
            config.network,
            config.backend,
            start_time,
            Duration::from_secs(config.status_interval_secs),
            shutdown_rx.clone(),
        ))
    });

    let mut import_task = None;
    if !config.import_paths.is_empty() {
        let task_engine = Arc::clone(&engine);
        let paths = config.import_paths.clone();
        let magic = chain_params(config.network).message_start;
        let cancel = shutdown.token().clone();
        let task_shutdown = Arc::clone(&shutdown);
        let stop_after = config.stop_after_import;
        import_task = Some(tokio::task::spawn_blocking(move || {
            let result = import::import_files(&task_engine, &paths, magic, &cancel);
            if result.is_err() {
                task_shutdown.request("import failed");
            } else if stop_after {
                task_shutdown.request("import complete");
            }
            result
        }));
    } else if config.stop_after_import {
        shutdown.request("nothing to import");
    }

    wait_until_stopped(&engine, &shutdown, shutdown_rx).await;

    let mut outcome = Ok(());
    if let Some(task) = import_task {
        match task.await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => outcome = Err(err),
            Err(err) => outcome = Err(format!("import task failed: {err}")),
        }
    }
    if let Some(task) = status_task {
        let _ = task.await;
    }
    if engine.is_halted() && outcome.is_ok() {
        outcome = Err(ChainError::Halted.to_string());
    }
    outcome
}

async fn wait_until_stopped(
    engine: &ChainEngine<Store>,
    shutdown: &Shutdown,
    receiver: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = wait_for_shutdown(receiver.clone()) => return,
            _ = tokio::time::sleep(HALT_POLL) => {
                if engine.is_halted() {
                    shutdown.request("chain engine halted");
                }
            }
        }
    }
}

async fn status_loop(
    engine: Arc<ChainEngine<Store>>,
    network: Network,
    backend: Backend,
    start_time: Instant,
    interval: Duration,
    mut receiver: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match snapshot_status(&engine, network, backend, start_time) {
                    Ok(snapshot) => log_status(&snapshot),
                    Err(err) => log_warn!("status unavailable: {err}"),
                }
            }
            changed = receiver.changed() => {
                if changed.is_err() || *receiver.borrow() {
                    return;
                }
            }
        }
    }
}

/// The address index goes first since the transaction index cannot be removed
/// while it exists. With both flags set both indexes are dropped in one run,
/// rather than stopping after the address index.
fn run_drop_commands<S: KeyValueStore>(engine: &ChainEngine<S>, config: &Config) -> Result<(), String> {
    if config.drop_address_index {
        engine
            .drop_address_index()
            .map_err(|err| format!("failed to drop address index: {err}"))?;
        log_info!("Address index dropped");
    }
    if config.drop_tx_index {
        engine
            .drop_transaction_index()
            .map_err(|err| format!("failed to drop transaction index: {err}"))?;
        log_info!("Transaction index dropped");
    }
    Ok(())
}
