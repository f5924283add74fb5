//! Output script templates and the payees they commit to.

use ledgerd_primitives::hash::hash160;

use crate::ops::{OP_0, OP_CHECKSIG, OP_DUP, OP_EQUAL, OP_EQUALVERIFY, OP_HASH160, OP_RETURN};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptType {
    P2Pk,
    P2Pkh,
    P2Sh,
    P2Wpkh,
    P2Wsh,
    NullData,
    Unknown,
}

/// Matches `script` against the standard templates. The returned bytes are
/// what the template commits to: the key or script hash, the witness
/// program, or the public key of a pay-to-pubkey output. Empty otherwise.
pub fn match_template(script: &[u8]) -> (ScriptType, &[u8]) {
    match script {
        [OP_DUP, OP_HASH160, 0x14, hash @ .., OP_EQUALVERIFY, OP_CHECKSIG] if hash.len() == 20 => {
            (ScriptType::P2Pkh, hash)
        }
        [OP_HASH160, 0x14, hash @ .., OP_EQUAL] if hash.len() == 20 => (ScriptType::P2Sh, hash),
        [OP_0, 0x14, program @ ..] if program.len() == 20 => (ScriptType::P2Wpkh, program),
        [OP_0, 0x20, program @ ..] if program.len() == 32 => (ScriptType::P2Wsh, program),
        [push @ (33 | 65), key @ .., OP_CHECKSIG] if key.len() == usize::from(*push) => {
            (ScriptType::P2Pk, key)
        }
        [OP_RETURN, ..] => (ScriptType::NullData, &[]),
        _ => (ScriptType::Unknown, &[]),
    }
}

pub fn classify_script_pubkey(script: &[u8]) -> ScriptType {
    match_template(script).0
}

/// Outputs whose script begins with `OP_RETURN` can never be spent.
pub fn is_unspendable(script: &[u8]) -> bool {
    script.first() == Some(&OP_RETURN)
}

/// An indexable payee: a 20-byte hash qualified by the kind of commitment.
///
/// Pay-to-pubkey outputs resolve to the hash of their key, so they share an
/// address with pay-to-pubkey-hash outputs for the same key.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Destination {
    PubKeyHash([u8; 20]),
    ScriptHash([u8; 20]),
}

impl Destination {
    pub const KEY_LEN: usize = 21;

    /// Kind byte followed by the hash; the address index key prefix.
    pub fn to_key(&self) -> [u8; Self::KEY_LEN] {
        let (kind, hash) = match self {
            Destination::PubKeyHash(hash) => (0u8, hash),
            Destination::ScriptHash(hash) => (1u8, hash),
        };
        let mut key = [kind; Self::KEY_LEN];
        key[1..].copy_from_slice(hash);
        key
    }

    pub fn from_key(key: &[u8]) -> Option<Self> {
        let (&kind, hash) = key.split_first()?;
        let hash: [u8; 20] = hash.try_into().ok()?;
        match kind {
            0 => Some(Destination::PubKeyHash(hash)),
            1 => Some(Destination::ScriptHash(hash)),
            _ => None,
        }
    }
}

pub fn extract_destination(script: &[u8]) -> Option<Destination> {
    match match_template(script) {
        (ScriptType::P2Pkh, hash) => hash.try_into().ok().map(Destination::PubKeyHash),
        (ScriptType::P2Sh, hash) => hash.try_into().ok().map(Destination::ScriptHash),
        (ScriptType::P2Pk, key) => Some(Destination::PubKeyHash(hash160(key))),
        _ => None,
    }
}

/// Pay-to-pubkey-hash output script for a 20-byte key hash.
pub fn p2pkh_script(hash: &[u8; 20]) -> Vec<u8> {
    [&[OP_DUP, OP_HASH160, 0x14][..], hash, &[OP_EQUALVERIFY, OP_CHECKSIG]].concat()
}

/// Pay-to-script-hash output script for a 20-byte script hash.
pub fn p2sh_script(hash: &[u8; 20]) -> Vec<u8> {
    [&[OP_HASH160, 0x14][..], hash, &[OP_EQUAL]].concat()
}
