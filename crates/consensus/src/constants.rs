//! Consensus-wide constants shared across validation.

/// The minimum allowed block version (network rule).
pub const MIN_BLOCK_VERSION: i32 = 1;
/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: u32 = 1_000_000;
/// The maximum allowed number of signature check operations in a block (network rule).
pub const MAX_BLOCK_SIGOPS: u32 = MAX_BLOCK_SIZE / 50;
/// Maximum script size (consensus).
pub const MAX_SCRIPT_SIZE: usize = 10_000;
/// Coinbase scriptSig length bounds, inclusive.
pub const MIN_COINBASE_SCRIPT_LEN: usize = 2;
pub const MAX_COINBASE_SCRIPT_LEN: usize = 100;
/// Lock times below this are block heights, at or above it unix timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;
/// Number of ancestors whose median timestamp bounds the next block's time.
pub const MEDIAN_TIME_SPAN: usize = 11;
/// Retarget adjustments are clamped to this factor in either direction.
pub const RETARGET_CLAMP: i64 = 4;
