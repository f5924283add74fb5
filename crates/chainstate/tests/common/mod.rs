#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use ledgerd_chainstate::{ChainConfig, ChainEngine, ChainError, IndexConfig, SubmitOutcome};
use ledgerd_consensus::params::{chain_params, Network};
use ledgerd_consensus::money::COIN;
use ledgerd_consensus::{ConsensusParams, Hash256};
use ledgerd_pow::validation::validate_pow_header;
use ledgerd_primitives::hash::hash160;
use ledgerd_primitives::merkle::merkle_root;
use ledgerd_primitives::outpoint::OutPoint;
use ledgerd_primitives::transaction::{Transaction, TxIn, TxOut, SEQUENCE_FINAL};
use ledgerd_primitives::{Block, BlockHeader};
use ledgerd_script::ops::{push_data, push_int};
use ledgerd_script::standard::{p2pkh_script, Destination};
use ledgerd_script::CommitmentVerifier;
use ledgerd_storage::memory::MemoryStore;
use ledgerd_storage::{Column, KeyValueStore};

pub const SUBSIDY: i64 = 50 * COIN;

pub fn regtest_config(coinbase_maturity: i32, indexes: IndexConfig) -> ChainConfig {
    let mut params = chain_params(Network::Regtest);
    params.consensus.coinbase_maturity = coinbase_maturity;
    ChainConfig::new(params).with_indexes(indexes)
}

pub fn all_indexes() -> IndexConfig {
    IndexConfig {
        tx_index: true,
        address_index: true,
    }
}

pub fn open_engine(
    store: &Arc<MemoryStore>,
    blocks_dir: &Path,
    config: ChainConfig,
) -> Result<ChainEngine<MemoryStore>, ChainError> {
    ChainEngine::open(
        Arc::clone(store),
        blocks_dir,
        config,
        Arc::new(CommitmentVerifier),
        Default::default(),
    )
}

/// A key whose P2PKH outputs the test can spend.
#[derive(Clone, Copy)]
pub struct Wallet(pub u8);

impl Wallet {
    pub fn key(&self) -> [u8; 33] {
        let mut key = [self.0; 33];
        key[0] = 0x02;
        key
    }

    pub fn script(&self) -> Vec<u8> {
        p2pkh_script(&hash160(&self.key()))
    }

    pub fn destination(&self) -> Destination {
        Destination::PubKeyHash(hash160(&self.key()))
    }

    pub fn unlock(&self) -> Vec<u8> {
        let mut script_sig = Vec::new();
        push_data(&mut script_sig, &[0x30; 71]);
        push_data(&mut script_sig, &self.key());
        script_sig
    }
}

pub fn coinbase(height: i32, tag: u8, wallet: Wallet, value: i64) -> Transaction {
    let mut script_sig = push_int(i64::from(height));
    script_sig.extend_from_slice(&[0x01, tag]);
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: wallet.script(),
        }],
        lock_time: 0,
    }
}

pub fn spend(prevout: OutPoint, from: Wallet, to: Wallet, value: i64) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout,
            script_sig: from.unlock(),
            sequence: SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: to.script(),
        }],
        lock_time: 0,
    }
}

/// Builds a block on `prev` with a real merkle root and proof of work.
pub fn mine(
    params: &ConsensusParams,
    prev: Hash256,
    height: i32,
    transactions: Vec<Transaction>,
) -> Block {
    let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
    let (merkle_root, _) = merkle_root(&txids);
    let mut block = Block {
        header: BlockHeader {
            version: 4,
            prev_block: prev,
            merkle_root,
            time: params.genesis.time + height as u32,
            bits: params.genesis.bits,
            nonce: 0,
        },
        transactions,
    };
    while validate_pow_header(&block.header, params).is_err() {
        block.header.nonce += 1;
    }
    block
}

/// A block holding only a coinbase paying the full subsidy to `wallet`.
pub fn empty_block(
    params: &ConsensusParams,
    prev: Hash256,
    height: i32,
    tag: u8,
    wallet: Wallet,
) -> Block {
    mine(params, prev, height, vec![coinbase(height, tag, wallet, SUBSIDY)])
}

pub fn submit(engine: &ChainEngine<MemoryStore>, block: &Block) -> SubmitOutcome {
    engine.submit_block(block.clone()).expect("submit block")
}

/// Extends the active tip with `count` coinbase-only blocks.
pub fn extend(
    engine: &ChainEngine<MemoryStore>,
    params: &ConsensusParams,
    count: usize,
    tag: u8,
    wallet: Wallet,
) -> Vec<Block> {
    let tip = engine.current_tip().expect("tip");
    let mut prev = tip.hash;
    let mut blocks = Vec::with_capacity(count);
    for offset in 1..=count as i32 {
        let block = empty_block(params, prev, tip.height + offset, tag, wallet);
        submit(engine, &block);
        prev = block.hash();
        blocks.push(block);
    }
    blocks
}

pub fn column(store: &MemoryStore, column: Column) -> Vec<(Vec<u8>, Vec<u8>)> {
    store.scan_prefix(column, &[]).expect("scan column")
}

pub fn coinbase_outpoint(block: &Block) -> OutPoint {
    OutPoint::new(block.transactions[0].txid(), 0)
}
