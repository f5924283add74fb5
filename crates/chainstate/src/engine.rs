//! The chain engine: one serialized writer, many concurrent readers.
//!
//! Lock order is `writer` then `view`. Readers take only the `view` read
//! lock and see the store as of the last committed block, since every commit
//! happens under the `view` write lock.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use ledgerd_consensus::params::hash256_to_hex;
use ledgerd_consensus::Hash256;
use ledgerd_pow::validation::PowError;
use ledgerd_primitives::outpoint::OutPoint;
use ledgerd_primitives::{genesis_block, Block, BlockHeader, Transaction};
use ledgerd_script::standard::Destination;
use ledgerd_script::ScriptVerifier;
use ledgerd_storage::{KeyValueStore, WriteBatch};

use crate::address_index::AddressActivity;
use crate::blockindex::BlockIndexEntry;
use crate::blockstore::BlockRef;
use crate::cancel::CancelToken;
use crate::config::ChainConfig;
use crate::error::{ChainError, ErrorKind};
use crate::flatfiles::{FlatFileStore, DEFAULT_MAX_FILE_SIZE};
use crate::indexes::{IndexFlags, IndexKind, IndexState};
use crate::orphans::OrphanPool;
use crate::reorg::{plan_reorg, reorganize, ReorgError};
use crate::selector::{ChainSelector, TipRecord, TipState};
use crate::state::{utxo_failure, ChainState};
use crate::tree::{ActiveChain, BlockTree, ChainView};
use crate::txindex::TxLocation;
use crate::utxo::UtxoEntry;
use crate::validation::{
    ancestor_window, check_block_context, check_block_structure, check_header_context,
    check_proof_of_work, BlockContext, BlockValidator, ValidationError,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockStatus {
    /// On the canonical chain after submission.
    Active,
    /// Stored and valid so far, but on a chain with less work.
    SideChain,
    AlreadyKnown,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SubmitOutcome {
    pub hash: Hash256,
    pub status: BlockStatus,
    pub tip: BlockRef,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransactionRecord {
    pub tx: Transaction,
    pub location: TxLocation,
    pub height: i32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChainStatus {
    pub tip: BlockRef,
    pub orphans: usize,
    pub tips: usize,
    pub indexes: IndexFlags,
    pub halted: bool,
}

struct WriterState {
    selector: ChainSelector,
    orphans: OrphanPool,
    next_sequence: u64,
}

pub struct ChainEngine<S> {
    state: ChainState<S>,
    view: RwLock<ChainView>,
    writer: Mutex<WriterState>,
    halted: AtomicBool,
    cancel: CancelToken,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

impl<S: KeyValueStore> ChainEngine<S> {
    /// Opens the chain in `store`, with raw blocks under `blocks_dir`.
    ///
    /// An empty store is initialized with the network's genesis block. An
    /// interrupted reorganization is finished, then configured indexes are
    /// built if missing and the best known chain is activated.
    pub fn open(
        store: Arc<S>,
        blocks_dir: &Path,
        config: ChainConfig,
        verifier: Arc<dyn ScriptVerifier>,
        cancel: CancelToken,
    ) -> Result<Self, ChainError> {
        let files = FlatFileStore::new(
            blocks_dir,
            config.params.message_start,
            DEFAULT_MAX_FILE_SIZE,
        )?;
        let validator =
            BlockValidator::new(verifier, config.check_scripts, config.script_threads)?;
        let state = ChainState::new(
            store,
            files,
            validator,
            config.params.clone(),
            config.max_future_block_time,
        );

        let index = state.blocks().index();
        let tree = BlockTree::from_entries(index.load_all()?);
        let mut next_sequence = index.next_sequence()?;
        let indexes = state.indexes();
        let mut view = ChainView {
            tree,
            active: ActiveChain::new(),
            indexes: IndexFlags {
                tx_index: indexes.state(IndexKind::Transaction)? == IndexState::Maintained,
                address_index: indexes.state(IndexKind::Address)? == IndexState::Maintained,
            },
        };

        match index.utxo_tip()? {
            None => {
                init_genesis(&state, &mut view, &mut next_sequence, &cancel)?;
            }
            Some(utxo_tip) => {
                view.active = ActiveChain::from_tip(&view.tree, &utxo_tip)
                    .ok_or_else(|| ChainError::corrupt("utxo tip is not in the block index"))?;
                let Some(tip) = index.tip()? else {
                    let mut batch = WriteBatch::new();
                    state.blocks().set_tip(&mut batch, &utxo_tip);
                    state.commit_batch(batch)?;
                    return Self::finish_open(state, view, config, next_sequence, cancel);
                };
                if tip != utxo_tip {
                    ledgerd_log::log_warn!(
                        "Chain state is at {} but the tip is {}; resuming reorganization",
                        hash256_to_hex(&utxo_tip),
                        hash256_to_hex(&tip)
                    );
                    let plan = plan_reorg(&view, &tip)?;
                    reorganize(&state, &mut view, &plan, &cancel, unix_now())
                        .map_err(|err| err.error)?;
                }
            }
        }

        Self::finish_open(state, view, config, next_sequence, cancel)
    }

    /// Brings the indexes in line with `config`, then activates the best
    /// known chain.
    fn finish_open(
        state: ChainState<S>,
        mut view: ChainView,
        config: ChainConfig,
        next_sequence: u64,
        cancel: CancelToken,
    ) -> Result<Self, ChainError> {
        let (flags, rebuild) = state.indexes().reconcile(config.indexes)?;
        view.indexes = flags;
        for kind in rebuild {
            let ChainView { tree, active, .. } = &view;
            state.indexes().catch_up(
                kind,
                active.iter(),
                |hash| {
                    let block = state.blocks().get(hash)?;
                    let undo = state.undo().get(hash)?.ok_or_else(|| {
                        ChainError::corrupt(format!("missing undo for {}", hash256_to_hex(hash)))
                    })?;
                    let height = tree
                        .get(hash)
                        .map(|entry| entry.height)
                        .ok_or(ChainError::NotFound(*hash))?;
                    Ok((block, undo, height))
                },
                &cancel,
            )?;
            view.indexes.set(kind, true);
        }

        let selector = ChainSelector::from_tree(&view.tree, view.active.tip().copied());
        let engine = Self {
            state,
            view: RwLock::new(view),
            writer: Mutex::new(WriterState {
                selector,
                orphans: OrphanPool::new(config.orphan_limit, config.orphan_ttl),
                next_sequence,
            }),
            halted: AtomicBool::new(false),
            cancel,
        };

        {
            let mut writer = engine.lock_writer()?;
            engine.activate_best_chain(&mut writer, None)?;
        }
        let tip = engine.current_tip()?;
        ledgerd_log::log_info!(
            "Chain tip {} height {}",
            hash256_to_hex(&tip.hash),
            tip.height
        );
        Ok(engine)
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Validates and stores `block`, then switches to the best chain.
    ///
    /// A block with an unknown parent is held and `UnknownParent` returned;
    /// it is processed once the parent arrives.
    pub fn submit_block(&self, block: Block) -> Result<SubmitOutcome, ChainError> {
        self.check_halted()?;
        self.cancel.check()?;
        let hash = block.hash();
        let mut writer = self.lock_writer()?;

        let result = self.accept_block(&mut writer, hash, block);
        match &result {
            Ok(outcome) if outcome.status != BlockStatus::AlreadyKnown => {
                self.process_orphans(&mut writer, hash)?;
            }
            Err(err) if err.is_fatal() => self.halt(err),
            _ => {}
        }
        drop(writer);

        let outcome = result?;
        let view = self.read_view()?;
        let status = match outcome.status {
            BlockStatus::AlreadyKnown => BlockStatus::AlreadyKnown,
            _ if view.is_active(&hash) => BlockStatus::Active,
            _ => BlockStatus::SideChain,
        };
        Ok(SubmitOutcome {
            hash,
            status,
            tip: tip_ref(&view)?,
        })
    }

    pub fn current_tip(&self) -> Result<BlockRef, ChainError> {
        let view = self.read_view()?;
        tip_ref(&view)
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Block, ChainError> {
        self.state.blocks().get(hash)
    }

    pub fn get_header(&self, hash: &Hash256) -> Result<BlockHeader, ChainError> {
        self.state.blocks().get_header(hash)
    }

    /// Hash of the canonical block at `height`.
    pub fn block_hash_at(&self, height: i32) -> Result<Option<Hash256>, ChainError> {
        let view = self.read_view()?;
        Ok(view.active.at(height).copied())
    }

    pub fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, ChainError> {
        let _view = self.read_view()?;
        self.state.utxos().get(outpoint).map_err(utxo_failure)
    }

    pub fn lookup_transaction(&self, txid: &Hash256) -> Result<Option<TransactionRecord>, ChainError> {
        let view = self.read_view()?;
        if !view.indexes.is_enabled(IndexKind::Transaction) {
            return Err(ChainError::IndexNotEnabled(IndexKind::Transaction));
        }
        let Some(location) = self.state.indexes().lookup_tx(txid)? else {
            return Ok(None);
        };
        let entry = view
            .tree
            .get(&location.block_hash)
            .ok_or(ChainError::NotFound(location.block_hash))?;
        let tx = self.state.blocks().read_transaction(entry, location.span())?;
        Ok(Some(TransactionRecord {
            tx,
            location,
            height: entry.height,
        }))
    }

    pub fn lookup_address_activity(
        &self,
        dest: &Destination,
    ) -> Result<Vec<AddressActivity>, ChainError> {
        let view = self.read_view()?;
        if !view.indexes.is_enabled(IndexKind::Address) {
            return Err(ChainError::IndexNotEnabled(IndexKind::Address));
        }
        Ok(self.state.indexes().lookup_address(dest)?)
    }

    /// Removes the address index. Always allowed.
    pub fn drop_address_index(&self) -> Result<(), ChainError> {
        self.drop_index(IndexKind::Address)
    }

    /// Removes the transaction index; refused while the address index exists.
    pub fn drop_transaction_index(&self) -> Result<(), ChainError> {
        self.drop_index(IndexKind::Transaction)
    }

    pub fn flush(&self) -> Result<(), ChainError> {
        self.state.blocks().sync()?;
        self.state.store().flush()?;
        Ok(())
    }

    pub fn status(&self) -> Result<ChainStatus, ChainError> {
        let writer = self.lock_writer()?;
        let view = self.read_view()?;
        Ok(ChainStatus {
            tip: tip_ref(&view)?,
            orphans: writer.orphans.len(),
            tips: writer.selector.len(),
            indexes: view.indexes,
            halted: self.is_halted(),
        })
    }

    /// Known tips, most work first.
    pub fn chain_tips(&self) -> Result<Vec<(Hash256, TipRecord)>, ChainError> {
        let writer = self.lock_writer()?;
        let mut tips: Vec<(Hash256, TipRecord)> = writer
            .selector
            .iter()
            .map(|(hash, record)| (*hash, *record))
            .collect();
        tips.sort_by(|a, b| {
            b.1.chainwork
                .cmp(&a.1.chainwork)
                .then(a.1.sequence.cmp(&b.1.sequence))
        });
        Ok(tips)
    }

    fn drop_index(&self, kind: IndexKind) -> Result<(), ChainError> {
        self.check_halted()?;
        let _writer = self.lock_writer()?;
        let mut view = self.write_view()?;
        self.state.indexes().drop_index(kind)?;
        view.indexes.set(kind, false);
        Ok(())
    }

    /// Runs the cheap checks, stores the block and activates the best chain.
    fn accept_block(
        &self,
        writer: &mut WriterState,
        hash: Hash256,
        block: Block,
    ) -> Result<SubmitOutcome, ChainError> {
        let reject = |err: ValidationError| ChainError::rejected(hash, err);
        let consensus = &self.state.params().consensus;

        let parent = {
            let view = self.read_view()?;
            if let Some(entry) = view.tree.get(&hash) {
                if entry.is_failed() {
                    let kind = entry.failure.unwrap_or(ErrorKind::ConsensusViolation);
                    return Err(reject(ValidationError::KnownInvalid(kind)));
                }
                if entry.has_data() {
                    return Ok(SubmitOutcome {
                        hash,
                        status: BlockStatus::AlreadyKnown,
                        tip: tip_ref(&view)?,
                    });
                }
            }
            view.tree.get(&block.header.prev_block).cloned()
        };
        let parent_hash = block.header.prev_block;
        if writer.orphans.contains(&hash) {
            return Err(ChainError::UnknownParent {
                hash,
                parent: parent_hash,
            });
        }

        let txids = block.txids();
        check_block_structure(&block, &txids).map_err(reject)?;
        check_proof_of_work(&block.header, &hash, consensus).map_err(reject)?;

        let Some(parent) = parent else {
            let evicted = writer.orphans.insert(hash, block, Instant::now());
            if evicted > 0 {
                ledgerd_log::log_info!("Evicted {} orphan blocks", evicted);
            }
            ledgerd_log::log_debug!(
                "Holding orphan {} (parent {})",
                hash256_to_hex(&hash),
                hash256_to_hex(&parent_hash)
            );
            return Err(ChainError::UnknownParent {
                hash,
                parent: parent_hash,
            });
        };

        let mut entry =
            BlockIndexEntry::child_of(&parent, block.header.clone(), writer.next_sequence)
                .map_err(|err| reject(ValidationError::Pow(PowError::Compact(err))))?;

        if parent.is_failed() {
            let kind = parent.failure.unwrap_or(ErrorKind::ConsensusViolation);
            entry.mark_failed(kind, true);
            self.store_failed_entry(hash, entry)?;
            return Err(reject(ValidationError::KnownInvalid(kind)));
        }

        let context_check = {
            let view = self.read_view()?;
            let ancestors = view
                .tree
                .ancestors_info(&parent_hash, ancestor_window(entry.height, consensus));
            let ctx = BlockContext {
                height: entry.height,
                ancestors: &ancestors,
                params: consensus,
                now: unix_now(),
                max_future_block_time: self.state.max_future_block_time(),
            };
            check_header_context(&block.header, &hash, &ctx)
                .and_then(|()| check_block_context(&block, &txids, &ctx))
        };
        if let Err(err) = context_check {
            if !err.is_transient() {
                entry.mark_failed(err.kind(), false);
                self.store_failed_entry(hash, entry)?;
            }
            return Err(reject(err));
        }

        self.state.blocks().put(&block, &mut entry)?;
        writer.next_sequence = entry.sequence + 1;
        let record = TipRecord::from_entry(&entry, TipState::Candidate);
        self.write_view()?.tree.insert(hash, entry);
        writer.selector.insert(hash, &parent_hash, record);
        ledgerd_log::log_debug!(
            "Stored block {} height {}",
            hash256_to_hex(&hash),
            record.height
        );

        self.activate_best_chain(writer, Some(&hash))?;
        let view = self.read_view()?;
        Ok(SubmitOutcome {
            hash,
            status: if view.is_active(&hash) {
                BlockStatus::Active
            } else {
                BlockStatus::SideChain
            },
            tip: tip_ref(&view)?,
        })
    }

    /// Reorganizes onto the best tip until no tip has more work than the
    /// active one. Tips that fail are invalidated and the next best is
    /// tried. Returns the failure that invalidated `submitted`, if any.
    fn activate_best_chain(
        &self,
        writer: &mut WriterState,
        submitted: Option<&Hash256>,
    ) -> Result<(), ChainError> {
        let mut submitted_error = None;
        while let Some(target) = writer.selector.pick_activation() {
            let mut view = self.write_view()?;
            let plan = plan_reorg(&view, &target)?;
            match reorganize(&self.state, &mut view, &plan, &self.cancel, unix_now()) {
                Ok(()) => {
                    writer.selector.mark_validated(&target);
                    writer.selector.activate(target, plan.is_extension());
                    if !plan.is_extension() {
                        ledgerd_log::log_info!(
                            "New tip {} height {} after reorganization",
                            hash256_to_hex(&target),
                            view.active.height()
                        );
                    }
                }
                Err(ReorgError { failed, error }) => {
                    if error.is_fatal() {
                        self.halt(&error);
                        return Err(error);
                    }
                    let Some(bad) = failed else {
                        return Err(error);
                    };
                    let invalidated = self.invalidate(writer, &mut view, &bad, &error)?;
                    let error = if plan.is_extension() {
                        error
                    } else {
                        ChainError::ReorgFailure {
                            cause: Box::new(error),
                            rolled_back: true,
                        }
                    };
                    if submitted.is_some_and(|hash| invalidated.contains(hash))
                        && submitted_error.is_none()
                    {
                        submitted_error = Some(error);
                    }
                }
            }
        }
        match submitted_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Marks `bad` and everything built on it invalid, and makes its parent a
    /// candidate again. Returns the invalidated hashes.
    fn invalidate(
        &self,
        writer: &mut WriterState,
        view: &mut ChainView,
        bad: &Hash256,
        error: &ChainError,
    ) -> Result<Vec<Hash256>, ChainError> {
        let transient = error
            .reject_reason()
            .is_some_and(|reason| reason.error.is_transient());
        let kind = error.root_kind();
        let mut invalidated = vec![*bad];
        invalidated.extend(view.tree.descendants(bad));

        let mut batch = WriteBatch::new();
        for hash in &invalidated {
            writer.selector.mark_failed(hash);
            if transient {
                continue;
            }
            if let Some(entry) = view.tree.get_mut(hash) {
                entry.mark_failed(kind, hash != bad);
                self.state.blocks().index().put(&mut batch, hash, entry);
            }
        }
        self.state.commit_batch(batch)?;

        if let Some(parent) = view.tree.parent(bad) {
            let live_child = view.tree.children(&parent).iter().any(|child| {
                view.tree
                    .get(child)
                    .is_some_and(|entry| entry.has_data() && !entry.is_failed())
            });
            if !live_child && !view.is_active(&parent) {
                if let Some(entry) = view.tree.get(&parent) {
                    let state = if entry.is_valid() {
                        TipState::Validated
                    } else {
                        TipState::Candidate
                    };
                    writer
                        .selector
                        .restore(parent, TipRecord::from_entry(entry, state));
                }
            }
        }
        ledgerd_log::log_warn!(
            "Invalid block {} ({} descendants): {}",
            hash256_to_hex(bad),
            invalidated.len() - 1,
            error
        );
        Ok(invalidated)
    }

    /// Feeds held orphans whose parent is now stored back through
    /// `accept_block`, breadth first.
    fn process_orphans(&self, writer: &mut WriterState, parent: Hash256) -> Result<(), ChainError> {
        let mut queue = VecDeque::from([parent]);
        while let Some(parent) = queue.pop_front() {
            for (hash, block) in writer.orphans.take_children(&parent, Instant::now()) {
                match self.accept_block(writer, hash, block) {
                    Ok(_) => queue.push_back(hash),
                    Err(err) if err.is_fatal() => {
                        self.halt(&err);
                        return Err(err);
                    }
                    Err(err) => {
                        ledgerd_log::log_debug!(
                            "Orphan {} rejected: {}",
                            hash256_to_hex(&hash),
                            err
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn store_failed_entry(&self, hash: Hash256, entry: BlockIndexEntry) -> Result<(), ChainError> {
        self.state.blocks().put_entry(&hash, &entry)?;
        self.write_view()?.tree.insert(hash, entry);
        Ok(())
    }

    /// Stops accepting work after an unrecoverable error: flush what is
    /// durable and signal shutdown.
    fn halt(&self, err: &ChainError) {
        if self.halted.swap(true, Ordering::SeqCst) {
            return;
        }
        ledgerd_log::log_error!("Chain engine halted: {err}");
        if let Err(flush_err) = self.flush() {
            ledgerd_log::log_error!("Flush after halt failed: {flush_err}");
        }
        self.cancel.cancel();
    }

    fn check_halted(&self) -> Result<(), ChainError> {
        if self.is_halted() {
            Err(ChainError::Halted)
        } else {
            Ok(())
        }
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, WriterState>, ChainError> {
        self.writer.lock().map_err(|_| ChainError::Halted)
    }

    fn read_view(&self) -> Result<RwLockReadGuard<'_, ChainView>, ChainError> {
        self.view.read().map_err(|_| ChainError::Halted)
    }

    fn write_view(&self) -> Result<RwLockWriteGuard<'_, ChainView>, ChainError> {
        self.view.write().map_err(|_| ChainError::Halted)
    }
}

fn tip_ref(view: &ChainView) -> Result<BlockRef, ChainError> {
    let hash = *view
        .active
        .tip()
        .ok_or_else(|| ChainError::corrupt("no active tip"))?;
    let entry = view.tree.get(&hash).ok_or(ChainError::NotFound(hash))?;
    Ok(BlockRef::from_entry(hash, entry))
}

/// Stores and connects the network's genesis block on a fresh store, or
/// connects it if a previous run stopped before that.
fn init_genesis<S: KeyValueStore>(
    state: &ChainState<S>,
    view: &mut ChainView,
    next_sequence: &mut u64,
    cancel: &CancelToken,
) -> Result<(), ChainError> {
    let genesis = genesis_block(&state.params().consensus);
    let hash = genesis.hash();
    if !view.tree.get(&hash).is_some_and(|entry| entry.has_data()) {
        let mut entry = BlockIndexEntry::genesis(genesis.header.clone())
            .map_err(|err| ChainError::corrupt(format!("genesis bits: {err}")))?;
        entry.sequence = *next_sequence;
        state.blocks().put(&genesis, &mut entry)?;
        *next_sequence = entry.sequence + 1;
        view.tree.insert(hash, entry);
    }
    state.connect_tip(view, &hash, cancel, unix_now())?;
    let mut batch = WriteBatch::new();
    state.blocks().set_tip(&mut batch, &hash);
    state.commit_batch(batch)?;
    ledgerd_log::log_info!("Initialized chain at genesis {}", hash256_to_hex(&hash));
    Ok(())
}
