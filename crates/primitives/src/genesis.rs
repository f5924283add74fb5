use ledgerd_consensus::ConsensusParams;

use crate::block::{Block, BlockHeader};
use crate::outpoint::OutPoint;
use crate::transaction::{Transaction, TxIn, TxOut, SEQUENCE_FINAL};

/// Rebuilds the genesis block described by `params.genesis`.
pub fn genesis_block(params: &ConsensusParams) -> Block {
    let genesis = &params.genesis;
    let coinbase = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: genesis.script_sig.to_vec(),
            sequence: SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value: genesis.reward,
            script_pubkey: genesis.output_script.to_vec(),
        }],
        lock_time: 0,
    };
    let merkle_root = coinbase.txid();
    Block {
        header: BlockHeader {
            version: genesis.version,
            prev_block: [0u8; 32],
            merkle_root,
            time: genesis.time,
            bits: genesis.bits,
            nonce: genesis.nonce,
        },
        transactions: vec![coinbase],
    }
}
