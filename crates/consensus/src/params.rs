//! Consensus parameter definitions and the named network profiles.

use crate::money::{Amount, COIN};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Some(Self::Mainnet),
            "testnet" | "test" => Some(Self::Testnet),
            "regtest" => Some(Self::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }
}

/// Inputs for rebuilding the genesis block of a network.
#[derive(Clone, Debug)]
pub struct GenesisParams {
    pub version: i32,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub reward: Amount,
    /// Coinbase scriptSig.
    pub script_sig: &'static [u8],
    pub output_script: &'static [u8],
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    pub genesis: GenesisParams,
    pub checkpoints: Vec<Checkpoint>,
    pub pow_limit: Hash256,
    pub pow_target_spacing: i64,
    pub pow_target_timespan: i64,
    /// Permits a pow-limit block once the spacing since the parent exceeds
    /// twice the target spacing.
    pub pow_allow_min_difficulty_blocks: bool,
    pub pow_no_retargeting: bool,
    pub coinbase_maturity: i32,
    pub initial_subsidy: Amount,
    pub subsidy_halving_interval: i32,
    /// Height from which the coinbase scriptSig must begin with the block height.
    pub coinbase_height_activation: i32,
    pub max_future_block_time: i64,
}

impl ConsensusParams {
    pub fn difficulty_adjustment_interval(&self) -> i64 {
        self.pow_target_timespan / self.pow_target_spacing
    }

    pub fn checkpoint_at(&self, height: i32) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height == height)
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
    /// Frame marker used by block import files.
    pub message_start: [u8; 4],
    /// Subdirectory of the data dir holding this network's state.
    pub data_subdir: &'static str,
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            consensus: mainnet_consensus_params(),
            message_start: [0xf9, 0xbe, 0xb4, 0xd9],
            data_subdir: "mainnet",
        },
        Network::Testnet => ChainParams {
            network,
            consensus: testnet_consensus_params(),
            message_start: [0x0b, 0x11, 0x09, 0x07],
            data_subdir: "testnet",
        },
        Network::Regtest => ChainParams {
            network,
            consensus: regtest_consensus_params(),
            message_start: [0xfa, 0xbf, 0xb5, 0xda],
            data_subdir: "regtest",
        },
    }
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    chain_params(network).consensus
}

const GENESIS_SCRIPT_SIG: [u8; 77] = decode_hex(
    "04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73",
);
const GENESIS_OUTPUT_SCRIPT: [u8; 67] = decode_hex(
    "4104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac",
);

const MAINNET_GENESIS_HASH: Hash256 =
    hash256_from_display_hex("000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f");
const TESTNET_GENESIS_HASH: Hash256 =
    hash256_from_display_hex("000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943");
const REGTEST_GENESIS_HASH: Hash256 =
    hash256_from_display_hex("0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206");

const MAINNET_POW_LIMIT: Hash256 =
    hash256_from_display_hex("00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff");
const REGTEST_POW_LIMIT: Hash256 =
    hash256_from_display_hex("7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff");

fn mainnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Mainnet,
        hash_genesis_block: MAINNET_GENESIS_HASH,
        genesis: GenesisParams {
            version: 1,
            time: 1_231_006_505,
            bits: 0x1d00ffff,
            nonce: 2_083_236_893,
            reward: 50 * COIN,
            script_sig: &GENESIS_SCRIPT_SIG,
            output_script: &GENESIS_OUTPUT_SCRIPT,
        },
        checkpoints: vec![
            Checkpoint {
                height: 0,
                hash: MAINNET_GENESIS_HASH,
            },
            Checkpoint {
                height: 11_111,
                hash: hash256_from_display_hex(
                    "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d",
                ),
            },
        ],
        pow_limit: MAINNET_POW_LIMIT,
        pow_target_spacing: 10 * 60,
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_allow_min_difficulty_blocks: false,
        pow_no_retargeting: false,
        coinbase_maturity: 100,
        initial_subsidy: 50 * COIN,
        subsidy_halving_interval: 210_000,
        coinbase_height_activation: 227_931,
        max_future_block_time: 2 * 60 * 60,
    }
}

fn testnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Testnet,
        hash_genesis_block: TESTNET_GENESIS_HASH,
        genesis: GenesisParams {
            version: 1,
            time: 1_296_688_602,
            bits: 0x1d00ffff,
            nonce: 414_098_458,
            reward: 50 * COIN,
            script_sig: &GENESIS_SCRIPT_SIG,
            output_script: &GENESIS_OUTPUT_SCRIPT,
        },
        checkpoints: vec![Checkpoint {
            height: 0,
            hash: TESTNET_GENESIS_HASH,
        }],
        pow_limit: MAINNET_POW_LIMIT,
        pow_target_spacing: 10 * 60,
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_allow_min_difficulty_blocks: true,
        pow_no_retargeting: false,
        coinbase_maturity: 100,
        initial_subsidy: 50 * COIN,
        subsidy_halving_interval: 210_000,
        coinbase_height_activation: 21_111,
        max_future_block_time: 2 * 60 * 60,
    }
}

fn regtest_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Regtest,
        hash_genesis_block: REGTEST_GENESIS_HASH,
        genesis: GenesisParams {
            version: 1,
            time: 1_296_688_602,
            bits: 0x207fffff,
            nonce: 2,
            reward: 50 * COIN,
            script_sig: &GENESIS_SCRIPT_SIG,
            output_script: &GENESIS_OUTPUT_SCRIPT,
        },
        checkpoints: vec![Checkpoint {
            height: 0,
            hash: REGTEST_GENESIS_HASH,
        }],
        pow_limit: REGTEST_POW_LIMIT,
        pow_target_spacing: 10 * 60,
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_allow_min_difficulty_blocks: true,
        pow_no_retargeting: true,
        coinbase_maturity: 100,
        initial_subsidy: 50 * COIN,
        subsidy_halving_interval: 150,
        coinbase_height_activation: 500,
        max_future_block_time: 2 * 60 * 60,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hash hex has invalid length"),
            HexError::InvalidHex => write!(f, "hash hex contains a non-hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a hash in display (big-endian) order into internal byte order.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.len() != 64 {
        return Err(HexError::InvalidLength);
    }

    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        let pair = hex.get(start..start + 2).ok_or(HexError::InvalidHex)?;
        *byte_out = u8::from_str_radix(pair, 16).map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

/// Renders a hash in display (big-endian) order.
pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Compile-time variant of `hash256_from_hex` for profile constants.
pub const fn hash256_from_display_hex(hex: &str) -> Hash256 {
    let raw: [u8; 32] = decode_hex(hex);
    let mut out = [0u8; 32];
    let mut i = 0;
    while i < 32 {
        out[i] = raw[31 - i];
        i += 1;
    }
    out
}

const fn decode_hex<const N: usize>(hex: &str) -> [u8; N] {
    let bytes = hex.as_bytes();
    assert!(bytes.len() == N * 2, "hex literal has the wrong length");
    let mut out = [0u8; N];
    let mut i = 0;
    while i < N {
        out[i] = (hex_nibble(bytes[i * 2]) << 4) | hex_nibble(bytes[i * 2 + 1]);
        i += 1;
    }
    out
}

const fn hex_nibble(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => panic!("invalid hex digit"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip_uses_display_order() {
        let hex = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
        let hash = hash256_from_hex(hex).expect("hash");
        assert_eq!(hash[31], 0x00);
        assert_eq!(hash[0], 0x6f);
        assert_eq!(hash256_to_hex(&hash), hex);
        assert_eq!(hash, MAINNET_GENESIS_HASH);
    }

    #[test]
    fn rejects_bad_hex() {
        assert_eq!(hash256_from_hex("abcd"), Err(HexError::InvalidLength));
        let bad = "zz".repeat(32);
        assert_eq!(hash256_from_hex(&bad), Err(HexError::InvalidHex));
    }

    #[test]
    fn profiles_are_distinct() {
        let main = consensus_params(Network::Mainnet);
        let reg = consensus_params(Network::Regtest);
        assert_ne!(main.hash_genesis_block, reg.hash_genesis_block);
        assert!(reg.pow_no_retargeting);
        assert_eq!(main.difficulty_adjustment_interval(), 2016);
        assert_eq!(
            main.checkpoint_at(0).map(|checkpoint| checkpoint.hash),
            Some(main.hash_genesis_block)
        );
        assert_eq!(Network::parse("REGTEST"), Some(Network::Regtest));
        assert_eq!(Network::parse("nope"), None);
    }
}
