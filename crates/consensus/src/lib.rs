//! Consensus constants, network profiles, and the subsidy schedule.

pub mod constants;
pub mod money;
pub mod params;
pub mod subsidy;

pub use params::{chain_params, consensus_params, ChainParams, ConsensusParams, Network};
pub use subsidy::block_subsidy;

/// 32-byte hash in internal (little-endian) byte order.
pub type Hash256 = [u8; 32];
