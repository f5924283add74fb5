mod common;

use std::sync::Arc;

use common::*;
use ledgerd_chainstate::blockindex::ChainIndex;
use ledgerd_chainstate::selector::TipState;
use ledgerd_chainstate::validation::ValidationError;
use ledgerd_chainstate::{BlockStatus, ChainEngine, ChainError, ErrorKind};
use ledgerd_consensus::params::{chain_params, Network};
use ledgerd_consensus::ConsensusParams;
use ledgerd_primitives::Block;
use ledgerd_storage::memory::MemoryStore;
use ledgerd_storage::{Column, KeyValueStore, WriteBatch};

const ALICE: Wallet = Wallet(0xa1);
const BOB: Wallet = Wallet(0xb0);
const MINER: Wallet = Wallet(0x33);

struct Fork {
    base: Vec<Block>,
    a: Vec<Block>,
    b: Vec<Block>,
}

/// Three shared blocks, then two branches that both spend the first coinbase:
/// branch A pays it back to alice in two blocks, branch B pays bob in three.
fn build_fork(params: &ConsensusParams, overpay_b5: bool) -> Fork {
    let mut base = Vec::new();
    let mut prev = params.hash_genesis_block;
    for height in 1..=3 {
        let block = empty_block(params, prev, height, 1, ALICE);
        prev = block.hash();
        base.push(block);
    }
    let funding = coinbase_outpoint(&base[0]);

    let a4 = mine(
        params,
        prev,
        4,
        vec![
            coinbase(4, 0xa, MINER, SUBSIDY),
            spend(funding.clone(), ALICE, ALICE, SUBSIDY),
        ],
    );
    let a5 = empty_block(params, a4.hash(), 5, 0xa, MINER);

    let b4 = mine(
        params,
        prev,
        4,
        vec![
            coinbase(4, 0xb, MINER, SUBSIDY),
            spend(funding, ALICE, BOB, SUBSIDY),
        ],
    );
    let b5_value = if overpay_b5 { SUBSIDY + 1 } else { SUBSIDY };
    let b5 = mine(params, b4.hash(), 5, vec![coinbase(5, 0xb, MINER, b5_value)]);
    let b6 = empty_block(params, b5.hash(), 6, 0xb, MINER);

    Fork {
        base,
        a: vec![a4, a5],
        b: vec![b4, b5, b6],
    }
}

fn open(store: &Arc<MemoryStore>, dir: &std::path::Path) -> ChainEngine<MemoryStore> {
    open_engine(store, dir, regtest_config(2, all_indexes())).expect("open engine")
}

fn submit_all(engine: &ChainEngine<MemoryStore>, blocks: &[Block]) {
    for block in blocks {
        submit(engine, block);
    }
}

#[test]
fn heavier_branch_replaces_active_chain() {
    let params = chain_params(Network::Regtest).consensus;
    let fork = build_fork(&params, false);
    let store = Arc::new(MemoryStore::new());
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = open(&store, dir.path());

    submit_all(&engine, &fork.base);
    submit_all(&engine, &fork.a);
    assert_eq!(submit(&engine, &fork.b[0]).status, BlockStatus::SideChain);
    assert_eq!(submit(&engine, &fork.b[1]).status, BlockStatus::SideChain);
    assert_eq!(engine.current_tip().expect("tip").hash, fork.a[1].hash());

    let outcome = submit(&engine, &fork.b[2]);
    assert_eq!(outcome.status, BlockStatus::Active);
    assert_eq!(outcome.tip.hash, fork.b[2].hash());
    assert_eq!(outcome.tip.height, 6);
    for (height, block) in (4..).zip(&fork.b) {
        assert_eq!(engine.block_hash_at(height).expect("height"), Some(block.hash()));
    }
    let heights = ChainIndex::new(Arc::clone(&store));
    assert_eq!(heights.height_hash(4).expect("height index"), Some(fork.b[0].hash()));

    let abandoned = fork.a[0].transactions[1].txid();
    assert!(engine.lookup_transaction(&abandoned).expect("lookup").is_none());
    let payment = fork.b[0].transactions[1].txid();
    let record = engine
        .lookup_transaction(&payment)
        .expect("lookup")
        .expect("indexed payment");
    assert_eq!(record.height, 4);
    assert_eq!(record.location.block_hash, fork.b[0].hash());
    assert_eq!(record.tx, fork.b[0].transactions[1]);

    let bob = engine
        .lookup_address_activity(&BOB.destination())
        .expect("activity");
    assert_eq!(bob.len(), 1);
    assert_eq!(bob[0].txid, payment);
    assert_eq!(bob[0].height, 4);

    let tips = engine.chain_tips().expect("tips");
    let superseded = tips
        .iter()
        .find(|(hash, _)| *hash == fork.a[1].hash())
        .expect("old tip tracked");
    assert_eq!(superseded.1.state, TipState::Superseded);

    let reference_store = Arc::new(MemoryStore::new());
    let reference_dir = tempfile::tempdir().expect("tempdir");
    let reference = open(&reference_store, reference_dir.path());
    submit_all(&reference, &fork.base);
    submit_all(&reference, &fork.b);
    for column_id in Column::ALL.into_iter().filter(|column| column.is_derived()) {
        assert_eq!(
            column(&store, column_id),
            column(&reference_store, column_id),
            "{column_id:?} differs from a chain that never saw branch A"
        );
    }
}

#[test]
fn invalid_block_mid_reorg_restores_old_chain() {
    let params = chain_params(Network::Regtest).consensus;
    let fork = build_fork(&params, true);
    let store = Arc::new(MemoryStore::new());
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = open(&store, dir.path());

    submit_all(&engine, &fork.base);
    submit_all(&engine, &fork.a);
    submit_all(&engine, &fork.b[..2]);
    let derived_before: Vec<_> = Column::ALL
        .into_iter()
        .filter(|column| column.is_derived())
        .map(|column_id| (column_id, column(&store, column_id)))
        .collect();
    assert!(derived_before
        .iter()
        .any(|(column_id, rows)| *column_id == Column::AddressIndex && !rows.is_empty()));

    let err = engine
        .submit_block(fork.b[2].clone())
        .expect_err("reorg through invalid block");
    assert!(matches!(
        err,
        ChainError::ReorgFailure {
            rolled_back: true,
            ..
        }
    ));
    assert_eq!(err.root_kind(), ErrorKind::ConsensusViolation);
    let reason = err.reject_reason().expect("rejected block");
    assert_eq!(reason.hash, fork.b[1].hash());
    assert!(!engine.is_halted());

    assert_eq!(engine.current_tip().expect("tip").hash, fork.a[1].hash());
    for (column_id, rows) in &derived_before {
        assert_eq!(
            &column(&store, *column_id),
            rows,
            "{column_id:?} changed by a rolled back reorg"
        );
    }

    for block in &fork.b[1..] {
        let err = engine.submit_block(block.clone()).expect_err("known invalid");
        assert!(matches!(
            err.reject_reason().map(|reason| &reason.error),
            Some(ValidationError::KnownInvalid(ErrorKind::ConsensusViolation))
        ));
    }
    let tips = engine.chain_tips().expect("tips");
    assert_eq!(tips[0].0, fork.a[1].hash());
    assert_eq!(tips[0].1.state, TipState::Active);
}

#[test]
fn reopen_resumes_interrupted_switch() {
    let params = chain_params(Network::Regtest).consensus;
    let fork = build_fork(&params, false);
    let store = Arc::new(MemoryStore::new());
    let dir = tempfile::tempdir().expect("tempdir");

    let engine = open(&store, dir.path());
    submit_all(&engine, &fork.base);
    submit_all(&engine, &fork.a);
    submit_all(&engine, &fork.b[..2]);
    engine.flush().expect("flush");
    drop(engine);

    let mut batch = WriteBatch::new();
    ChainIndex::new(Arc::clone(&store)).set_tip(&mut batch, &fork.b[1].hash());
    store.write_batch(&batch).expect("write tip");

    let engine = open(&store, dir.path());
    let tip = engine.current_tip().expect("tip");
    assert_eq!(tip.hash, fork.b[1].hash());
    assert_eq!(tip.height, 5);
    let bob = engine
        .lookup_address_activity(&BOB.destination())
        .expect("activity");
    assert_eq!(bob.len(), 1);
    let abandoned = fork.a[0].transactions[1].txid();
    assert!(engine.lookup_transaction(&abandoned).expect("lookup").is_none());
}
