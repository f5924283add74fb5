//! Engine configuration, built once and passed into `ChainEngine::open`.

use std::time::Duration;

use ledgerd_consensus::ChainParams;

const DEFAULT_ORPHAN_LIMIT: usize = 750;
const DEFAULT_ORPHAN_TTL: Duration = Duration::from_secs(20 * 60);

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IndexConfig {
    pub tx_index: bool,
    pub address_index: bool,
}

#[derive(Clone, Debug)]
pub struct ChainConfig {
    pub params: ChainParams,
    pub indexes: IndexConfig,
    /// Skipping script checks still enforces every other rule.
    pub check_scripts: bool,
    pub orphan_limit: usize,
    pub orphan_ttl: Duration,
    /// Seconds a block timestamp may run ahead of the local clock.
    pub max_future_block_time: i64,
    /// Script verification pool size; 0 uses the global rayon pool.
    pub script_threads: usize,
}

impl ChainConfig {
    pub fn new(params: ChainParams) -> Self {
        let max_future_block_time = params.consensus.max_future_block_time;
        Self {
            params,
            indexes: IndexConfig::default(),
            check_scripts: true,
            orphan_limit: DEFAULT_ORPHAN_LIMIT,
            orphan_ttl: DEFAULT_ORPHAN_TTL,
            max_future_block_time,
            script_threads: 0,
        }
    }

    pub fn with_indexes(mut self, indexes: IndexConfig) -> Self {
        self.indexes = indexes;
        self
    }
}
