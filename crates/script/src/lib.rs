//! Script parsing, standard output classification, and spend verification.

pub mod ops;
pub mod standard;
pub mod verify;

pub use standard::{classify_script_pubkey, extract_destination, Destination, ScriptType};
pub use verify::{CommitmentVerifier, ScriptError, ScriptVerifier};
