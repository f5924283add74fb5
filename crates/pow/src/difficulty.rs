//! Difficulty and compact target utilities.

use ledgerd_consensus::constants::{MEDIAN_TIME_SPAN, RETARGET_CLAMP};
use ledgerd_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    EmptyChain,
    NonContiguous,
    MissingAncestor(i64),
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::EmptyChain => write!(f, "no headers available"),
            DifficultyError::NonContiguous => write!(f, "header list must be contiguous by height"),
            DifficultyError::MissingAncestor(height) => {
                write!(f, "header history does not reach height {height}")
            }
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

/// The fields of an ancestor header that retargeting and time rules consult.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderInfo {
    pub height: i64,
    pub time: i64,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative && word != 0 {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        if word != 0 {
            let overflow =
                size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
            if overflow {
                return Err(CompactError::Overflow);
            }
        }
        U256::from(word) << (8 * (size - 3))
    };

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact = if size <= 3 {
        value.low_u32() << (8 * (3 - size))
    } else {
        (value >> (8 * (size - 3))).low_u32()
    };

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    Ok(compact_to_u256(bits)?.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    u256_to_compact(U256::from_little_endian(target))
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    U256::from_little_endian(hash) <= U256::from_little_endian(target)
}

/// Expected number of hashes needed to find a block at `bits`.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

/// Median timestamp of the last `MEDIAN_TIME_SPAN` headers of `chain`.
pub fn median_time_past(chain: &[HeaderInfo]) -> Option<i64> {
    if chain.is_empty() {
        return None;
    }
    let start = chain.len().saturating_sub(MEDIAN_TIME_SPAN);
    let mut times: Vec<i64> = chain[start..].iter().map(|header| header.time).collect();
    times.sort_unstable();
    Some(times[times.len() / 2])
}

/// Compact target the block after the last entry of `chain` must carry.
///
/// `chain` is contiguous by height and ends at the parent. It must reach back
/// to the start of the current retarget window, or to genesis.
pub fn get_next_work_required(
    chain: &[HeaderInfo],
    next_block_time: i64,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let pow_limit_bits = target_to_compact(&params.pow_limit);
    let Some(last) = chain.last() else {
        return Ok(pow_limit_bits);
    };
    ensure_contiguous(chain)?;

    let interval = params.difficulty_adjustment_interval();
    if (last.height + 1) % interval != 0 {
        if params.pow_allow_min_difficulty_blocks {
            if next_block_time > last.time + params.pow_target_spacing * 2 {
                return Ok(pow_limit_bits);
            }
            // Last block that was not mined under the min-difficulty exception.
            let mut cursor = chain.len() - 1;
            while cursor > 0
                && chain[cursor].height % interval != 0
                && chain[cursor].bits == pow_limit_bits
            {
                cursor -= 1;
            }
            return Ok(chain[cursor].bits);
        }
        return Ok(last.bits);
    }

    if params.pow_no_retargeting {
        return Ok(last.bits);
    }

    let first_height = last.height - (interval - 1);
    let first = header_at(chain, first_height)?;
    calculate_next_work_required(last.bits, last.time, first.time, params)
}

/// Scales `last_bits` by the observed timespan of the closing window.
pub fn calculate_next_work_required(
    last_bits: u32,
    last_time: i64,
    first_time: i64,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    if params.pow_no_retargeting {
        return Ok(last_bits);
    }

    let timespan = params.pow_target_timespan;
    let actual = (last_time - first_time).clamp(timespan / RETARGET_CLAMP, timespan * RETARGET_CLAMP);

    let target = compact_to_u256(last_bits)?;
    let actual_u = U256::from(actual as u64);
    let timespan_u = U256::from(timespan as u64);
    let (product, overflow) = target.overflowing_mul(actual_u);
    let mut next = if overflow {
        (target / timespan_u) * actual_u
    } else {
        product / timespan_u
    };

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if next > pow_limit {
        next = pow_limit;
    }
    Ok(u256_to_compact(next))
}

fn ensure_contiguous(chain: &[HeaderInfo]) -> Result<(), DifficultyError> {
    let base = chain.first().ok_or(DifficultyError::EmptyChain)?.height;
    for (idx, header) in chain.iter().enumerate() {
        if header.height != base + idx as i64 {
            return Err(DifficultyError::NonContiguous);
        }
    }
    Ok(())
}

fn header_at(chain: &[HeaderInfo], height: i64) -> Result<&HeaderInfo, DifficultyError> {
    let base = chain.first().ok_or(DifficultyError::EmptyChain)?.height;
    usize::try_from(height - base)
        .ok()
        .and_then(|idx| chain.get(idx))
        .ok_or(DifficultyError::MissingAncestor(height))
}
