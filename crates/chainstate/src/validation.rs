//! Block validation pipeline, cheapest checks first.

use std::collections::HashSet;
use std::sync::Arc;

use ledgerd_consensus::constants::{
    LOCKTIME_THRESHOLD, MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE, MAX_COINBASE_SCRIPT_LEN,
    MEDIAN_TIME_SPAN, MIN_BLOCK_VERSION, MIN_COINBASE_SCRIPT_LEN,
};
use ledgerd_consensus::money::{money_range, Amount, MAX_MONEY};
use ledgerd_consensus::params::hash256_to_hex;
use ledgerd_consensus::{block_subsidy, ConsensusParams, Hash256};
use ledgerd_pow::difficulty::{get_next_work_required, median_time_past, HeaderInfo};
use ledgerd_pow::validation::{check_pow, PowError};
use ledgerd_primitives::transaction::SEQUENCE_FINAL;
use ledgerd_primitives::{Block, BlockHeader, Transaction};
use ledgerd_script::ops::{legacy_sigops, push_int};
use ledgerd_script::{ScriptError, ScriptVerifier};
use ledgerd_storage::KeyValueStore;
use rayon::prelude::*;

use crate::cancel::CancelToken;
use crate::error::{ChainError, ErrorKind, StorageError};
use crate::utxo::{ResolvedInputs, UtxoError, UtxoSet};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ValidationError {
    NoTransactions,
    BlockTooLarge,
    FirstTxNotCoinbase,
    MultipleCoinbase,
    MerkleMismatch,
    /// The transaction list hashes to the header's root only because of a
    /// duplicated sibling.
    MerkleMutated,
    DuplicateTx,
    TooManySigops,
    BadTransaction(&'static str),
    CoinbaseScriptSize,
    Pow(PowError),
    BadBits {
        expected: u32,
        actual: u32,
    },
    BadVersion,
    UnexpectedGenesis,
    TimeTooOld,
    TimeTooNew,
    NonFinalTx(Hash256),
    CoinbaseHeightMismatch,
    CheckpointMismatch,
    Script {
        txid: Hash256,
        input: usize,
        error: ScriptError,
    },
    InputsBelowOutputs,
    CoinbaseOverpays {
        paid: Amount,
        allowed: Amount,
    },
    DuplicateOutput,
    ValueOutOfRange,
    MissingInput,
    SpentInput,
    ImmatureSpend {
        created: u32,
        spend_height: i32,
    },
    /// Resubmission of a block already recorded as invalid, or of a block
    /// built on one.
    KnownInvalid(ErrorKind),
}

impl ValidationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ValidationError::NoTransactions
            | ValidationError::BlockTooLarge
            | ValidationError::FirstTxNotCoinbase
            | ValidationError::MultipleCoinbase
            | ValidationError::MerkleMismatch
            | ValidationError::MerkleMutated
            | ValidationError::DuplicateTx
            | ValidationError::TooManySigops
            | ValidationError::BadTransaction(_)
            | ValidationError::CoinbaseScriptSize => ErrorKind::MalformedBlock,
            ValidationError::MissingInput
            | ValidationError::SpentInput
            | ValidationError::ImmatureSpend { .. } => ErrorKind::DoubleSpend,
            ValidationError::KnownInvalid(kind) => *kind,
            _ => ErrorKind::ConsensusViolation,
        }
    }

    /// The same block may pass later; it is not recorded as invalid.
    pub fn is_transient(&self) -> bool {
        matches!(self, ValidationError::TimeTooNew)
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::NoTransactions => write!(f, "block has no transactions"),
            ValidationError::BlockTooLarge => write!(f, "block size too large"),
            ValidationError::FirstTxNotCoinbase => write!(f, "first transaction is not coinbase"),
            ValidationError::MultipleCoinbase => write!(f, "more than one coinbase"),
            ValidationError::MerkleMismatch => write!(f, "merkle root mismatch"),
            ValidationError::MerkleMutated => write!(f, "merkle tree is mutated"),
            ValidationError::DuplicateTx => write!(f, "duplicate transaction"),
            ValidationError::TooManySigops => write!(f, "block sigops limit exceeded"),
            ValidationError::BadTransaction(message) => write!(f, "bad transaction: {message}"),
            ValidationError::CoinbaseScriptSize => write!(f, "coinbase script size out of range"),
            ValidationError::Pow(err) => write!(f, "{err}"),
            ValidationError::BadBits { expected, actual } => write!(
                f,
                "incorrect difficulty bits {actual:#010x}, expected {expected:#010x}"
            ),
            ValidationError::BadVersion => write!(f, "block version too low"),
            ValidationError::UnexpectedGenesis => write!(f, "genesis block does not match network"),
            ValidationError::TimeTooOld => write!(f, "block time not after median time past"),
            ValidationError::TimeTooNew => write!(f, "block time too far in the future"),
            ValidationError::NonFinalTx(txid) => {
                write!(f, "transaction {} is not final", hash256_to_hex(txid))
            }
            ValidationError::CoinbaseHeightMismatch => {
                write!(f, "coinbase does not start with block height")
            }
            ValidationError::CheckpointMismatch => write!(f, "block conflicts with checkpoint"),
            ValidationError::Script { txid, input, error } => write!(
                f,
                "script verification failed for tx {} input {input}: {error}",
                hash256_to_hex(txid)
            ),
            ValidationError::InputsBelowOutputs => write!(f, "outputs exceed inputs"),
            ValidationError::CoinbaseOverpays { paid, allowed } => {
                write!(f, "coinbase pays {paid}, allowed {allowed}")
            }
            ValidationError::DuplicateOutput => write!(f, "transaction overwrites unspent output"),
            ValidationError::ValueOutOfRange => write!(f, "value out of range"),
            ValidationError::MissingInput => write!(f, "input missing or already spent"),
            ValidationError::SpentInput => write!(f, "input spent twice in block"),
            ValidationError::ImmatureSpend {
                created,
                spend_height,
            } => write!(
                f,
                "coinbase from height {created} spent at height {spend_height}"
            ),
            ValidationError::KnownInvalid(kind) => write!(f, "block previously rejected ({kind})"),
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<PowError> for ValidationError {
    fn from(err: PowError) -> Self {
        ValidationError::Pow(err)
    }
}

/// Chain position a block is validated against.
pub struct BlockContext<'a> {
    pub height: i32,
    /// Headers ending at the parent, oldest first.
    pub ancestors: &'a [HeaderInfo],
    pub params: &'a ConsensusParams,
    /// Local clock, unix seconds.
    pub now: i64,
    pub max_future_block_time: i64,
}

/// How many ancestors a block at `height` needs for difficulty and
/// median-time checks.
pub fn ancestor_window(height: i32, params: &ConsensusParams) -> usize {
    let interval = params.difficulty_adjustment_interval();
    if params.pow_allow_min_difficulty_blocks || i64::from(height) % interval == 0 {
        (interval as usize).max(MEDIAN_TIME_SPAN)
    } else {
        MEDIAN_TIME_SPAN
    }
}

pub fn check_block_structure(block: &Block, txids: &[Hash256]) -> Result<(), ValidationError> {
    if block.transactions.is_empty() {
        return Err(ValidationError::NoTransactions);
    }

    let (root, mutated) = ledgerd_primitives::merkle::merkle_root(txids);
    if mutated {
        return Err(ValidationError::MerkleMutated);
    }
    if root != block.header.merkle_root {
        return Err(ValidationError::MerkleMismatch);
    }

    if block.transactions.len() > MAX_BLOCK_SIZE as usize
        || block.serialized_size() > MAX_BLOCK_SIZE as usize
    {
        return Err(ValidationError::BlockTooLarge);
    }

    if !block.transactions[0].is_coinbase() {
        return Err(ValidationError::FirstTxNotCoinbase);
    }
    if block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Err(ValidationError::MultipleCoinbase);
    }

    for tx in &block.transactions {
        check_transaction(tx)?;
    }

    let mut seen = HashSet::with_capacity(txids.len());
    if !txids.iter().all(|txid| seen.insert(*txid)) {
        return Err(ValidationError::DuplicateTx);
    }

    if block_sigops(block) > MAX_BLOCK_SIGOPS {
        return Err(ValidationError::TooManySigops);
    }
    Ok(())
}

/// Context-free transaction rules.
pub fn check_transaction(tx: &Transaction) -> Result<(), ValidationError> {
    if tx.vin.is_empty() {
        return Err(ValidationError::BadTransaction("no inputs"));
    }
    if tx.vout.is_empty() {
        return Err(ValidationError::BadTransaction("no outputs"));
    }
    if tx.serialized_size() > MAX_BLOCK_SIZE as usize {
        return Err(ValidationError::BadTransaction("oversize"));
    }

    let mut total: Amount = 0;
    for output in &tx.vout {
        if !money_range(output.value) {
            return Err(ValidationError::ValueOutOfRange);
        }
        total = total
            .checked_add(output.value)
            .filter(|sum| *sum <= MAX_MONEY)
            .ok_or(ValidationError::ValueOutOfRange)?;
    }

    let mut prevouts = HashSet::with_capacity(tx.vin.len());
    if !tx.vin.iter().all(|input| prevouts.insert(&input.prevout)) {
        return Err(ValidationError::BadTransaction("duplicate inputs"));
    }

    if tx.is_coinbase() {
        let len = tx.vin[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_LEN..=MAX_COINBASE_SCRIPT_LEN).contains(&len) {
            return Err(ValidationError::CoinbaseScriptSize);
        }
    } else if tx.vin.iter().any(|input| input.prevout.is_null()) {
        return Err(ValidationError::BadTransaction("null prevout"));
    }
    Ok(())
}

pub fn check_proof_of_work(
    header: &BlockHeader,
    hash: &Hash256,
    params: &ConsensusParams,
) -> Result<(), ValidationError> {
    check_pow(hash, header.bits, params).map_err(ValidationError::from)
}

/// Header rules that depend on the parent chain.
pub fn check_header_context(
    header: &BlockHeader,
    hash: &Hash256,
    ctx: &BlockContext<'_>,
) -> Result<(), ValidationError> {
    if header.version < MIN_BLOCK_VERSION {
        return Err(ValidationError::BadVersion);
    }
    if ctx.height == 0 && *hash != ctx.params.hash_genesis_block {
        return Err(ValidationError::UnexpectedGenesis);
    }

    let time = i64::from(header.time);
    let expected = get_next_work_required(ctx.ancestors, time, ctx.params).map_err(|_| {
        ValidationError::BadBits {
            expected: 0,
            actual: header.bits,
        }
    })?;
    if header.bits != expected {
        return Err(ValidationError::BadBits {
            expected,
            actual: header.bits,
        });
    }

    if let Some(median) = median_time_past(ctx.ancestors) {
        if time <= median {
            return Err(ValidationError::TimeTooOld);
        }
    }
    if time > ctx.now + ctx.max_future_block_time {
        return Err(ValidationError::TimeTooNew);
    }

    if let Some(checkpoint) = ctx.params.checkpoint_at(ctx.height) {
        if checkpoint.hash != *hash {
            return Err(ValidationError::CheckpointMismatch);
        }
    }
    Ok(())
}

/// Transaction finality and the coinbase height commitment.
pub fn check_block_context(
    block: &Block,
    txids: &[Hash256],
    ctx: &BlockContext<'_>,
) -> Result<(), ValidationError> {
    let block_time = i64::from(block.header.time);
    for (tx, txid) in block.transactions.iter().zip(txids) {
        if !is_final_tx(tx, ctx.height, block_time) {
            return Err(ValidationError::NonFinalTx(*txid));
        }
    }

    if ctx.height >= ctx.params.coinbase_height_activation {
        let expected = push_int(i64::from(ctx.height));
        if !block.transactions[0].vin[0].script_sig.starts_with(&expected) {
            return Err(ValidationError::CoinbaseHeightMismatch);
        }
    }
    Ok(())
}

fn is_final_tx(tx: &Transaction, height: i32, block_time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let lock_time = i64::from(tx.lock_time);
    let compare = if tx.lock_time < LOCKTIME_THRESHOLD {
        i64::from(height)
    } else {
        block_time
    };
    if lock_time < compare {
        return true;
    }
    tx.vin.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}

fn block_sigops(block: &Block) -> u32 {
    block
        .transactions
        .iter()
        .map(|tx| {
            let input_ops: u32 = tx
                .vin
                .iter()
                .map(|input| legacy_sigops(&input.script_sig))
                .sum();
            let output_ops: u32 = tx
                .vout
                .iter()
                .map(|output| legacy_sigops(&output.script_pubkey))
                .sum();
            input_ops + output_ops
        })
        .sum()
}

/// Value rules once every input is resolved. Returns the total fees.
pub fn check_values(
    block: &Block,
    height: i32,
    resolved: &ResolvedInputs,
    params: &ConsensusParams,
) -> Result<Amount, ValidationError> {
    let mut fees: Amount = 0;
    for (index, tx) in block.transactions.iter().enumerate().skip(1) {
        for entry in resolved.spent.get(index).into_iter().flatten() {
            if !money_range(entry.value) {
                return Err(ValidationError::ValueOutOfRange);
            }
        }
        let value_in = resolved
            .input_value(index)
            .filter(|value| money_range(*value))
            .ok_or(ValidationError::ValueOutOfRange)?;
        let value_out = tx.value_out().ok_or(ValidationError::ValueOutOfRange)?;
        if value_in < value_out {
            return Err(ValidationError::InputsBelowOutputs);
        }
        fees = fees
            .checked_add(value_in - value_out)
            .filter(|sum| money_range(*sum))
            .ok_or(ValidationError::ValueOutOfRange)?;
    }

    let allowed = block_subsidy(height, params) + fees;
    let paid = block.transactions[0]
        .value_out()
        .ok_or(ValidationError::ValueOutOfRange)?;
    if paid > allowed {
        return Err(ValidationError::CoinbaseOverpays { paid, allowed });
    }
    Ok(fees)
}

/// Per-attempt state that survives a successful validation; discarded on
/// failure.
#[derive(Clone, Debug)]
pub struct ValidatedBlock {
    pub txids: Vec<Hash256>,
    pub resolved: ResolvedInputs,
    pub fees: Amount,
}

struct ScriptCheck<'a> {
    tx_index: usize,
    input_index: usize,
    script_pubkey: &'a [u8],
}

enum ScriptFailure {
    Interrupted,
    Invalid {
        tx_index: usize,
        input_index: usize,
        error: ScriptError,
    },
}

/// Runs the full rule set against the UTXO set without writing anything.
pub struct BlockValidator {
    verifier: Arc<dyn ScriptVerifier>,
    check_scripts: bool,
    pool: Option<rayon::ThreadPool>,
}

impl BlockValidator {
    pub fn new(
        verifier: Arc<dyn ScriptVerifier>,
        check_scripts: bool,
        script_threads: usize,
    ) -> Result<Self, ChainError> {
        let pool = if script_threads > 0 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(script_threads)
                    .thread_name(|index| format!("script-{index}"))
                    .build()
                    .map_err(|err| {
                        ChainError::StorageFailure(StorageError::Corrupt(format!(
                            "script pool: {err}"
                        )))
                    })?,
            )
        } else {
            None
        };
        Ok(Self {
            verifier,
            check_scripts,
            pool,
        })
    }

    pub fn validate<S: KeyValueStore>(
        &self,
        block: &Block,
        hash: &Hash256,
        ctx: &BlockContext<'_>,
        utxos: &UtxoSet<S>,
        cancel: &CancelToken,
    ) -> Result<ValidatedBlock, ChainError> {
        let reject = |err: ValidationError| ChainError::rejected(*hash, err);
        let txids = block.txids();

        check_block_structure(block, &txids).map_err(reject)?;
        check_proof_of_work(&block.header, hash, ctx.params).map_err(reject)?;
        check_header_context(&block.header, hash, ctx).map_err(reject)?;
        check_block_context(block, &txids, ctx).map_err(reject)?;
        cancel.check()?;

        let resolved = utxos
            .resolve(block, &txids, ctx.height, ctx.params.coinbase_maturity)
            .map_err(|err| match err {
                UtxoError::Missing(_) => reject(ValidationError::MissingInput),
                UtxoError::AlreadySpent(_) => reject(ValidationError::SpentInput),
                UtxoError::Immature {
                    created,
                    spend_height,
                    ..
                } => reject(ValidationError::ImmatureSpend {
                    created,
                    spend_height,
                }),
                UtxoError::DuplicateOutput(_) => reject(ValidationError::DuplicateOutput),
                UtxoError::Store(err) => ChainError::from(err),
                UtxoError::Corrupt(message) => ChainError::corrupt(message),
            })?;
        cancel.check()?;

        if self.check_scripts {
            self.verify_scripts(block, &txids, &resolved, cancel)
                .map_err(|failure| match failure {
                    ScriptFailure::Interrupted => ChainError::Interrupted,
                    ScriptFailure::Invalid {
                        tx_index,
                        input_index,
                        error,
                    } => reject(ValidationError::Script {
                        txid: txids[tx_index],
                        input: input_index,
                        error,
                    }),
                })?;
        }

        let fees = check_values(block, ctx.height, &resolved, ctx.params).map_err(reject)?;
        Ok(ValidatedBlock {
            txids,
            resolved,
            fees,
        })
    }

    /// Checks every input in parallel; the failure reported is the first in
    /// block order.
    fn verify_scripts(
        &self,
        block: &Block,
        txids: &[Hash256],
        resolved: &ResolvedInputs,
        cancel: &CancelToken,
    ) -> Result<(), ScriptFailure> {
        let mut checks = Vec::new();
        for (tx_index, spent) in resolved.spent.iter().enumerate() {
            for (input_index, entry) in spent.iter().enumerate() {
                checks.push(ScriptCheck {
                    tx_index,
                    input_index,
                    script_pubkey: &entry.script_pubkey,
                });
            }
        }
        if checks.is_empty() {
            return Ok(());
        }

        let run = || {
            checks.par_iter().find_map_first(|check| {
                if cancel.is_cancelled() {
                    return Some(ScriptFailure::Interrupted);
                }
                let tx = &block.transactions[check.tx_index];
                self.verifier
                    .verify_input(check.script_pubkey, tx, check.input_index)
                    .err()
                    .map(|error| ScriptFailure::Invalid {
                        tx_index: check.tx_index,
                        input_index: check.input_index,
                        error,
                    })
            })
        };
        let failure = match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        };
        match failure {
            Some(ScriptFailure::Invalid {
                tx_index,
                input_index,
                error,
            }) => {
                ledgerd_log::log_warn!(
                    "script validation failed for tx {} input {}: {}",
                    hash256_to_hex(&txids[tx_index]),
                    input_index,
                    error
                );
                Err(ScriptFailure::Invalid {
                    tx_index,
                    input_index,
                    error,
                })
            }
            Some(other) => Err(other),
            None => Ok(()),
        }
    }
}
