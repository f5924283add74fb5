mod common;

use std::sync::Arc;

use common::*;
use ledgerd_chainstate::validation::ValidationError;
use ledgerd_chainstate::{BlockStatus, ChainError, ErrorKind, IndexConfig};
use ledgerd_consensus::params::{chain_params, Network};
use ledgerd_primitives::outpoint::OutPoint;
use ledgerd_storage::memory::MemoryStore;

#[test]
fn fresh_store_starts_at_genesis() {
    let store = Arc::new(MemoryStore::new());
    let dir = tempfile::tempdir().expect("tempdir");
    let config = regtest_config(100, IndexConfig::default());
    let genesis_hash = config.params.consensus.hash_genesis_block;
    let engine = open_engine(&store, dir.path(), config).expect("open");

    let tip = engine.current_tip().expect("tip");
    assert_eq!(tip.hash, genesis_hash);
    assert_eq!(tip.height, 0);
    let genesis = engine.get_block(&genesis_hash).expect("genesis block");
    assert_eq!(genesis.hash(), genesis_hash);
    assert_eq!(engine.block_hash_at(0).expect("height"), Some(genesis_hash));

    let outcome = engine.submit_block(genesis).expect("resubmit");
    assert_eq!(outcome.status, BlockStatus::AlreadyKnown);
}

#[test]
fn spends_remove_inputs_and_create_outputs() {
    let store = Arc::new(MemoryStore::new());
    let dir = tempfile::tempdir().expect("tempdir");
    let params = chain_params(Network::Regtest).consensus;
    let engine = open_engine(&store, dir.path(), regtest_config(2, IndexConfig::default()))
        .expect("open");
    let alice = Wallet(0xa1);
    let bob = Wallet(0xb0);

    let base = extend(&engine, &params, 3, 1, alice);
    let funding = coinbase_outpoint(&base[0]);
    assert!(engine.get_utxo(&funding).expect("utxo").is_some());

    let pay = spend(funding.clone(), alice, bob, SUBSIDY - 1_000);
    let pay_txid = pay.txid();
    let block = mine(
        &params,
        base[2].hash(),
        4,
        vec![coinbase(4, 1, alice, SUBSIDY + 1_000), pay],
    );
    let outcome = submit(&engine, &block);
    assert_eq!(outcome.status, BlockStatus::Active);
    assert_eq!(outcome.tip.height, 4);

    assert!(engine.get_utxo(&funding).expect("utxo").is_none());
    let created = engine
        .get_utxo(&OutPoint::new(pay_txid, 0))
        .expect("utxo")
        .expect("created output");
    assert_eq!(created.value, SUBSIDY - 1_000);
    assert_eq!(created.height, 4);
    assert!(!created.is_coinbase);
    assert_eq!(created.script_pubkey, bob.script());

    let again = mine(
        &params,
        block.hash(),
        5,
        vec![
            coinbase(5, 1, alice, SUBSIDY),
            spend(funding, alice, bob, 10),
        ],
    );
    let err = engine.submit_block(again).expect_err("double spend");
    assert_eq!(err.root_kind(), ErrorKind::DoubleSpend);
    assert_eq!(engine.current_tip().expect("tip").hash, block.hash());
}

#[test]
fn immature_coinbase_spend_is_rejected_as_double_spend() {
    let store = Arc::new(MemoryStore::new());
    let dir = tempfile::tempdir().expect("tempdir");
    let params = chain_params(Network::Regtest).consensus;
    let engine = open_engine(&store, dir.path(), regtest_config(5, IndexConfig::default()))
        .expect("open");
    let alice = Wallet(0xa1);

    let base = extend(&engine, &params, 4, 1, alice);
    let funding = coinbase_outpoint(&base[0]);

    let early = mine(
        &params,
        base[3].hash(),
        5,
        vec![
            coinbase(5, 1, alice, SUBSIDY),
            spend(funding.clone(), alice, alice, SUBSIDY),
        ],
    );
    let err = engine.submit_block(early).expect_err("immature");
    assert_eq!(err.root_kind(), ErrorKind::DoubleSpend);
    match err.reject_reason().map(|reason| &reason.error) {
        Some(ValidationError::ImmatureSpend {
            created,
            spend_height,
        }) => {
            assert_eq!(*created, 1);
            assert_eq!(*spend_height, 5);
        }
        other => panic!("unexpected rejection {other:?}"),
    }
    assert!(engine.get_utxo(&funding).expect("utxo").is_some());

    let filler = empty_block(&params, base[3].hash(), 5, 2, alice);
    submit(&engine, &filler);
    let mature = mine(
        &params,
        filler.hash(),
        6,
        vec![
            coinbase(6, 1, alice, SUBSIDY),
            spend(funding.clone(), alice, alice, SUBSIDY),
        ],
    );
    assert_eq!(submit(&engine, &mature).status, BlockStatus::Active);
    assert!(engine.get_utxo(&funding).expect("utxo").is_none());
}

#[test]
fn equal_work_keeps_first_seen_tip() {
    let params = chain_params(Network::Regtest).consensus;
    let genesis = params.hash_genesis_block;
    let first = empty_block(&params, genesis, 1, 1, Wallet(1));
    let second = empty_block(&params, genesis, 1, 2, Wallet(2));

    for (a, b) in [(&first, &second), (&second, &first)] {
        let store = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = open_engine(&store, dir.path(), regtest_config(100, IndexConfig::default()))
            .expect("open");
        assert_eq!(submit(&engine, a).status, BlockStatus::Active);
        assert_eq!(submit(&engine, b).status, BlockStatus::SideChain);
        assert_eq!(engine.current_tip().expect("tip").hash, a.hash());
        drop(engine);

        let reopened = open_engine(&store, dir.path(), regtest_config(100, IndexConfig::default()))
            .expect("reopen");
        assert_eq!(reopened.current_tip().expect("tip").hash, a.hash());
        let tips = reopened.chain_tips().expect("tips");
        assert_eq!(tips.len(), 2);
        assert_eq!(tips[0].0, a.hash());
    }
}

#[test]
fn orphans_connect_once_parent_arrives() {
    let store = Arc::new(MemoryStore::new());
    let dir = tempfile::tempdir().expect("tempdir");
    let params = chain_params(Network::Regtest).consensus;
    let engine = open_engine(&store, dir.path(), regtest_config(100, IndexConfig::default()))
        .expect("open");
    let wallet = Wallet(7);

    let b1 = empty_block(&params, params.hash_genesis_block, 1, 1, wallet);
    let b2 = empty_block(&params, b1.hash(), 2, 1, wallet);
    let b3 = empty_block(&params, b2.hash(), 3, 1, wallet);

    for block in [&b3, &b2] {
        let err = engine.submit_block(block.clone()).expect_err("orphan");
        assert!(matches!(err, ChainError::UnknownParent { .. }));
    }
    let err = engine.submit_block(b3.clone()).expect_err("still orphan");
    assert_eq!(err.kind(), ErrorKind::UnknownParent);
    assert_eq!(engine.status().expect("status").orphans, 2);

    submit(&engine, &b1);
    let tip = engine.current_tip().expect("tip");
    assert_eq!(tip.hash, b3.hash());
    assert_eq!(tip.height, 3);
    assert_eq!(engine.status().expect("status").orphans, 0);
}

#[test]
fn invalid_blocks_are_remembered() {
    let store = Arc::new(MemoryStore::new());
    let dir = tempfile::tempdir().expect("tempdir");
    let params = chain_params(Network::Regtest).consensus;
    let engine = open_engine(&store, dir.path(), regtest_config(100, IndexConfig::default()))
        .expect("open");
    let wallet = Wallet(3);

    let greedy = mine(
        &params,
        params.hash_genesis_block,
        1,
        vec![coinbase(1, 1, wallet, SUBSIDY + 1)],
    );
    let err = engine.submit_block(greedy.clone()).expect_err("overpays");
    assert_eq!(err.kind(), ErrorKind::ConsensusViolation);
    assert!(matches!(
        err.reject_reason().map(|reason| &reason.error),
        Some(ValidationError::CoinbaseOverpays { .. })
    ));

    let err = engine.submit_block(greedy.clone()).expect_err("known invalid");
    assert_eq!(err.kind(), ErrorKind::ConsensusViolation);
    assert!(matches!(
        err.reject_reason().map(|reason| &reason.error),
        Some(ValidationError::KnownInvalid(ErrorKind::ConsensusViolation))
    ));

    let child = empty_block(&params, greedy.hash(), 2, 1, wallet);
    let err = engine.submit_block(child).expect_err("invalid parent");
    assert_eq!(err.kind(), ErrorKind::ConsensusViolation);
    assert_eq!(
        engine.current_tip().expect("tip").hash,
        params.hash_genesis_block
    );
    assert!(!engine.is_halted());
}

#[test]
fn malformed_block_is_not_stored() {
    let store = Arc::new(MemoryStore::new());
    let dir = tempfile::tempdir().expect("tempdir");
    let params = chain_params(Network::Regtest).consensus;
    let engine = open_engine(&store, dir.path(), regtest_config(100, IndexConfig::default()))
        .expect("open");

    let mut block = empty_block(&params, params.hash_genesis_block, 1, 1, Wallet(4));
    block.header.merkle_root = [0x55; 32];
    while ledgerd_pow::validation::validate_pow_header(&block.header, &params).is_err() {
        block.header.nonce += 1;
    }
    let hash = block.hash();
    let err = engine.submit_block(block).expect_err("bad merkle root");
    assert_eq!(err.kind(), ErrorKind::MalformedBlock);
    assert!(matches!(
        engine.get_block(&hash),
        Err(ChainError::NotFound(_))
    ));
}

#[test]
fn cancelled_engine_refuses_blocks() {
    let store = Arc::new(MemoryStore::new());
    let dir = tempfile::tempdir().expect("tempdir");
    let params = chain_params(Network::Regtest).consensus;
    let engine = open_engine(&store, dir.path(), regtest_config(100, IndexConfig::default()))
        .expect("open");

    engine.cancel_token().cancel();
    let block = empty_block(&params, params.hash_genesis_block, 1, 1, Wallet(5));
    let err = engine.submit_block(block).expect_err("cancelled");
    assert!(matches!(err, ChainError::Interrupted));
    assert_eq!(engine.current_tip().expect("tip").height, 0);
}
