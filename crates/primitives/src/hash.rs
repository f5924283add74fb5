use ledgerd_consensus::Hash256;
use ripemd::{Digest as RipemdDigest, Ripemd160};
use sha2::Sha256;

pub fn sha256(data: &[u8]) -> Hash256 {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub fn sha256d(data: &[u8]) -> Hash256 {
    sha256(&sha256(data))
}

/// RIPEMD-160 of SHA-256, the digest behind key and script hashes.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let digest = Ripemd160::digest(sha256(data));
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// Hash of two concatenated child nodes of a merkle tree.
pub fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left);
    data[32..].copy_from_slice(right);
    sha256d(&data)
}
