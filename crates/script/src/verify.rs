//! Spend authorization checks.

use ledgerd_consensus::constants::MAX_SCRIPT_SIZE;
use ledgerd_primitives::hash::hash160;
use ledgerd_primitives::transaction::Transaction;

use crate::ops::pushed_data;
use crate::standard::{match_template, ScriptType};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ScriptError {
    ScriptSize,
    SigPushOnly,
    MissingPush,
    CommitmentMismatch,
    Unspendable,
    InputIndex,
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::ScriptSize => write!(f, "script exceeds maximum size"),
            ScriptError::SigPushOnly => write!(f, "scriptSig is not push-only"),
            ScriptError::MissingPush => write!(f, "scriptSig pushes nothing"),
            ScriptError::CommitmentMismatch => {
                write!(f, "scriptSig does not match the committed hash")
            }
            ScriptError::Unspendable => write!(f, "output is provably unspendable"),
            ScriptError::InputIndex => write!(f, "input index out of range"),
        }
    }
}

impl std::error::Error for ScriptError {}

/// Decides whether an input is authorized to spend the output it references.
///
/// The engine only depends on this trait; the rule set behind it is chosen by
/// whoever builds the engine.
pub trait ScriptVerifier: Send + Sync {
    fn verify_input(
        &self,
        script_pubkey: &[u8],
        tx: &Transaction,
        input_index: usize,
    ) -> Result<(), ScriptError>;
}

/// Checks the parts of a spend that do not need signature cryptography: the
/// scriptSig is push-only and its last push matches the hash the output
/// commits to (the key for P2PKH, the redeem script for P2SH).
///
/// Signatures are NOT verified. Any bytes in the signature position pass, so
/// this verifier does not authorize spends; plug in a full interpreter through
/// `ScriptVerifier` for that.
#[derive(Clone, Copy, Debug, Default)]
pub struct CommitmentVerifier;

impl ScriptVerifier for CommitmentVerifier {
    fn verify_input(
        &self,
        script_pubkey: &[u8],
        tx: &Transaction,
        input_index: usize,
    ) -> Result<(), ScriptError> {
        let input = tx.vin.get(input_index).ok_or(ScriptError::InputIndex)?;
        let script_sig = input.script_sig.as_slice();
        if script_sig.len() > MAX_SCRIPT_SIZE || script_pubkey.len() > MAX_SCRIPT_SIZE {
            return Err(ScriptError::ScriptSize);
        }
        let pushes = pushed_data(script_sig).ok_or(ScriptError::SigPushOnly)?;

        match match_template(script_pubkey) {
            (ScriptType::P2Pkh, key_hash) => {
                let key = pushes.last().ok_or(ScriptError::MissingPush)?;
                check_commitment(key, key_hash)
            }
            (ScriptType::P2Sh, script_hash) => {
                let redeem_script = pushes.last().ok_or(ScriptError::MissingPush)?;
                check_commitment(redeem_script, script_hash)
            }
            (ScriptType::P2Pk, _) => {
                if pushes.is_empty() {
                    return Err(ScriptError::MissingPush);
                }
                Ok(())
            }
            (ScriptType::NullData, _) => Err(ScriptError::Unspendable),
            (ScriptType::P2Wpkh | ScriptType::P2Wsh | ScriptType::Unknown, _) => Ok(()),
        }
    }
}

fn check_commitment(preimage: &[u8], committed: &[u8]) -> Result<(), ScriptError> {
    if hash160(preimage).as_slice() == committed {
        Ok(())
    } else {
        Err(ScriptError::CommitmentMismatch)
    }
}
