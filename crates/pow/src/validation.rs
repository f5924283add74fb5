use ledgerd_consensus::{ConsensusParams, Hash256};
use ledgerd_primitives::block::BlockHeader;
use primitive_types::U256;

use crate::difficulty::{compact_to_u256, CompactError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowError {
    Compact(CompactError),
    ZeroTarget,
    /// The claimed target is easier than the network allows.
    AboveLimit { bits: u32 },
    HighHash,
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::Compact(err) => write!(f, "bad difficulty bits: {err}"),
            PowError::ZeroTarget => write!(f, "proof-of-work target is zero"),
            PowError::AboveLimit { bits } => {
                write!(f, "difficulty bits {bits:#010x} above the network limit")
            }
            PowError::HighHash => write!(f, "block hash does not meet its target"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

/// Checks that `hash` satisfies the target encoded in `bits` and that the
/// target lies within the network's proof-of-work limit.
pub fn check_pow(hash: &Hash256, bits: u32, params: &ConsensusParams) -> Result<(), PowError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Err(PowError::ZeroTarget);
    }
    if target > U256::from_little_endian(&params.pow_limit) {
        return Err(PowError::AboveLimit { bits });
    }
    if U256::from_little_endian(hash) > target {
        return Err(PowError::HighHash);
    }
    Ok(())
}

/// `check_pow` for a header whose hash is not known yet.
pub fn validate_pow_header(header: &BlockHeader, params: &ConsensusParams) -> Result<(), PowError> {
    check_pow(&header.hash(), header.bits, params)
}
