use std::time::{Instant, SystemTime, UNIX_EPOCH};

use ledgerd_chainstate::{ChainEngine, ChainError};
use ledgerd_consensus::params::{hash256_to_hex, Network};
use ledgerd_log as logging;
use ledgerd_storage::KeyValueStore;
use serde::{Deserialize, Serialize};

use crate::config::Backend;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub network: String,
    pub backend: String,
    pub tip_hash: String,
    pub tip_height: i32,
    /// Cumulative work of the active chain, hex.
    pub chainwork: String,
    pub orphans: usize,
    pub chain_tips: usize,
    pub tx_index: bool,
    pub address_index: bool,
    pub halted: bool,
    pub uptime_secs: u64,
    pub unix_time_secs: u64,
}

impl StatusSnapshot {
    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string(self).map_err(|err| err.to_string())
    }

    pub fn summary(&self) -> String {
        format!(
            "Status: height {} tip {} work 0x{} orphans {} tips {} txindex {} addressindex {}{}",
            self.tip_height,
            self.tip_hash,
            self.chainwork,
            self.orphans,
            self.chain_tips,
            on_off(self.tx_index),
            on_off(self.address_index),
            if self.halted { " HALTED" } else { "" }
        )
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

pub fn snapshot_status<S: KeyValueStore>(
    engine: &ChainEngine<S>,
    network: Network,
    backend: Backend,
    start_time: Instant,
) -> Result<StatusSnapshot, ChainError> {
    let status = engine.status()?;
    let unix_time_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    Ok(StatusSnapshot {
        network: network.as_str().to_string(),
        backend: backend.as_str().to_string(),
        tip_hash: hash256_to_hex(&status.tip.hash),
        tip_height: status.tip.height,
        chainwork: format!("{:x}", status.tip.chainwork),
        orphans: status.orphans,
        chain_tips: status.tips,
        tx_index: status.indexes.tx_index,
        address_index: status.indexes.address_index,
        halted: status.halted,
        uptime_secs: start_time.elapsed().as_secs(),
        unix_time_secs,
    })
}

/// Logs a snapshot in the configured log format.
pub fn log_status(snapshot: &StatusSnapshot) {
    match logging::Format::current() {
        logging::Format::Json => match snapshot.to_json() {
            Ok(json) => ledgerd_log::log_info!("{json}"),
            Err(err) => ledgerd_log::log_warn!("failed to encode status: {err}"),
        },
        logging::Format::Text => ledgerd_log::log_info!("{}", snapshot.summary()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ledgerd_chainstate::{CancelToken, ChainConfig};
    use ledgerd_consensus::params::chain_params;
    use ledgerd_script::CommitmentVerifier;
    use ledgerd_storage::memory::MemoryStore;

    #[test]
    fn snapshot_reports_genesis_tip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let params = chain_params(Network::Regtest);
        let genesis = params.consensus.hash_genesis_block;
        let engine = ChainEngine::open(
            Arc::new(MemoryStore::new()),
            dir.path(),
            ChainConfig::new(params),
            Arc::new(CommitmentVerifier),
            CancelToken::new(),
        )
        .expect("open engine");

        let snapshot = snapshot_status(&engine, Network::Regtest, Backend::Memory, Instant::now())
            .expect("snapshot");
        assert_eq!(snapshot.tip_height, 0);
        assert_eq!(snapshot.tip_hash, hash256_to_hex(&genesis));
        assert_eq!(snapshot.chainwork, "2");
        assert!(!snapshot.tx_index);
        assert!(snapshot.summary().contains("height 0"));

        let json = snapshot.to_json().expect("json");
        let decoded: StatusSnapshot = serde_json::from_str(&json).expect("decode");
        assert_eq!(decoded, snapshot);
    }
}
