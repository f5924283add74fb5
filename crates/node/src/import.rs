//! Block import from files of framed blocks: network magic, little-endian
//! length, serialized block.

use std::fs::File;
use std::io::{BufReader, ErrorKind as IoErrorKind, Read};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use crossbeam_channel::{bounded, Sender};
use ledgerd_chainstate::{BlockStatus, CancelToken, ChainEngine, ChainError, ErrorKind};
use ledgerd_consensus::constants::MAX_BLOCK_SIZE;
use ledgerd_consensus::params::hash256_to_hex;
use ledgerd_primitives::Block;
use ledgerd_storage::KeyValueStore;

const IMPORT_QUEUE: usize = 64;
const PROGRESS_EVERY: u64 = 1_000;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ImportSummary {
    pub blocks: u64,
    pub connected: u64,
    pub side_chain: u64,
    pub already_known: u64,
    /// Waiting for a parent that was not in the file (yet).
    pub held: u64,
    pub rejected: u64,
}

enum ImportItem {
    Block { path: PathBuf, offset: u64, block: Block },
    Failed(String),
}

/// Appends one frame to `out`.
pub fn encode_frame(magic: [u8; 4], block: &Block, out: &mut Vec<u8>) {
    let bytes = block.consensus_encode();
    out.extend_from_slice(&magic);
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&bytes);
}

/// Reads frames from `paths` in order and submits them one at a time.
///
/// Rejected blocks are logged and skipped; storage failures and a halted
/// engine abort the import.
pub fn import_files<S: KeyValueStore>(
    engine: &ChainEngine<S>,
    paths: &[PathBuf],
    magic: [u8; 4],
    cancel: &CancelToken,
) -> Result<ImportSummary, String> {
    let (sender, receiver) = bounded::<ImportItem>(IMPORT_QUEUE);
    let reader_paths = paths.to_vec();
    let reader_cancel = cancel.clone();
    let reader = thread::Builder::new()
        .name("block-import".to_string())
        .spawn(move || read_files(&reader_paths, magic, &sender, &reader_cancel))
        .map_err(|err| format!("failed to start import reader: {err}"))?;

    let started = Instant::now();
    let mut summary = ImportSummary::default();
    let mut outcome = Ok(());
    for item in receiver.iter() {
        let (path, offset, block) = match item {
            ImportItem::Block {
                path,
                offset,
                block,
            } => (path, offset, block),
            ImportItem::Failed(err) => {
                outcome = Err(err);
                break;
            }
        };
        summary.blocks += 1;
        match engine.submit_block(block) {
            Ok(submitted) => match submitted.status {
                BlockStatus::Active => summary.connected += 1,
                BlockStatus::SideChain => summary.side_chain += 1,
                BlockStatus::AlreadyKnown => summary.already_known += 1,
            },
            Err(err) => match err.kind() {
                ErrorKind::UnknownParent => summary.held += 1,
                ErrorKind::Interrupted => break,
                _ if err.is_fatal() => {
                    outcome = Err(format!(
                        "import stopped at {} offset {offset}: {err}",
                        path.display()
                    ));
                    break;
                }
                _ => {
                    summary.rejected += 1;
                    log_rejection(&path, offset, &err);
                }
            },
        }
        if summary.blocks % PROGRESS_EVERY == 0 {
            ledgerd_log::log_info!(
                "Import: {} blocks read, {} connected ({}s)",
                summary.blocks,
                summary.connected,
                started.elapsed().as_secs()
            );
        }
    }
    drop(receiver);
    if reader.join().is_err() {
        return Err("import reader panicked".to_string());
    }
    outcome?;

    ledgerd_log::log_info!(
        "Import finished: {} blocks, {} connected, {} side chain, {} known, {} held, {} rejected",
        summary.blocks,
        summary.connected,
        summary.side_chain,
        summary.already_known,
        summary.held,
        summary.rejected
    );
    Ok(summary)
}

fn log_rejection(path: &Path, offset: u64, err: &ChainError) {
    let message = match err.reject_reason() {
        Some(reason) => format!(
            "Import: rejected block {} ({} offset {offset}): {}",
            hash256_to_hex(&reason.hash),
            path.display(),
            reason.error
        ),
        None => format!("Import: block at {} offset {offset} refused: {err}", path.display()),
    };
    // Blocks refused for lack of context may still connect later in the file.
    if err.root_kind().is_permanent() {
        ledgerd_log::log_warn!("{message}");
    } else {
        ledgerd_log::log_info!("{message}");
    }
}

fn read_files(paths: &[PathBuf], magic: [u8; 4], sender: &Sender<ImportItem>, cancel: &CancelToken) {
    for path in paths {
        if cancel.is_cancelled() {
            return;
        }
        ledgerd_log::log_info!("Import: reading {}", path.display());
        if let Err(err) = read_file(path, magic, sender, cancel) {
            let _ = sender.send(ImportItem::Failed(err));
            return;
        }
    }
}

fn read_file(
    path: &Path,
    magic: [u8; 4],
    sender: &Sender<ImportItem>,
    cancel: &CancelToken,
) -> Result<(), String> {
    let file = File::open(path).map_err(|err| format!("failed to open {}: {err}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut offset: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let mut prefix = [0u8; 8];
        match reader.read_exact(&mut prefix) {
            Ok(()) => {}
            Err(err) if err.kind() == IoErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => {
                return Err(format!(
                    "read failed for {} at offset {offset}: {err}",
                    path.display()
                ));
            }
        }
        // Preallocated files end in zero padding.
        if prefix[..4] == [0u8; 4] {
            return Ok(());
        }
        if prefix[..4] != magic {
            return Err(format!(
                "bad frame magic in {} at offset {offset}",
                path.display()
            ));
        }
        let len = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);
        if len == 0 || len > MAX_BLOCK_SIZE {
            return Err(format!(
                "frame length {len} out of range in {} at offset {offset}",
                path.display()
            ));
        }
        let mut bytes = vec![0u8; len as usize];
        reader.read_exact(&mut bytes).map_err(|err| {
            format!(
                "truncated frame in {} at offset {offset} (len {len}): {err}",
                path.display()
            )
        })?;
        let block = Block::consensus_decode(&bytes).map_err(|err| {
            format!(
                "undecodable block in {} at offset {offset}: {err}",
                path.display()
            )
        })?;
        let item = ImportItem::Block {
            path: path.to_path_buf(),
            offset,
            block,
        };
        if sender.send(item).is_err() {
            return Ok(());
        }
        offset += 8 + u64::from(len);
    }
}
