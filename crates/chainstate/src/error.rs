//! Error taxonomy surfaced by the chain engine.

use std::fmt;

use ledgerd_consensus::params::hash256_to_hex;
use ledgerd_consensus::Hash256;
use ledgerd_storage::StoreError;

use crate::flatfiles::FlatFileError;
use crate::indexes::IndexKind;
use crate::validation::ValidationError;

/// Coarse class of a `ChainError`, used to pick the caller's reaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    MalformedBlock,
    ConsensusViolation,
    UnknownParent,
    DoubleSpend,
    DependencyViolation,
    StorageFailure,
    ReorgFailure,
    IndexNotEnabled,
    NotFound,
    Interrupted,
    Halted,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MalformedBlock => "malformed-block",
            ErrorKind::ConsensusViolation => "consensus-violation",
            ErrorKind::UnknownParent => "unknown-parent",
            ErrorKind::DoubleSpend => "double-spend",
            ErrorKind::DependencyViolation => "dependency-violation",
            ErrorKind::StorageFailure => "storage-failure",
            ErrorKind::ReorgFailure => "reorg-failure",
            ErrorKind::IndexNotEnabled => "index-not-enabled",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::Halted => "halted",
        }
    }

    /// The block can never become valid, whatever else arrives.
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            ErrorKind::MalformedBlock | ErrorKind::ConsensusViolation
        )
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            ErrorKind::MalformedBlock => 1,
            ErrorKind::ConsensusViolation => 2,
            ErrorKind::UnknownParent => 3,
            ErrorKind::DoubleSpend => 4,
            ErrorKind::DependencyViolation => 5,
            ErrorKind::StorageFailure => 6,
            ErrorKind::ReorgFailure => 7,
            ErrorKind::IndexNotEnabled => 8,
            ErrorKind::NotFound => 9,
            ErrorKind::Interrupted => 10,
            ErrorKind::Halted => 11,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => ErrorKind::MalformedBlock,
            2 => ErrorKind::ConsensusViolation,
            3 => ErrorKind::UnknownParent,
            4 => ErrorKind::DoubleSpend,
            5 => ErrorKind::DependencyViolation,
            6 => ErrorKind::StorageFailure,
            7 => ErrorKind::ReorgFailure,
            8 => ErrorKind::IndexNotEnabled,
            9 => ErrorKind::NotFound,
            10 => ErrorKind::Interrupted,
            11 => ErrorKind::Halted,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum StorageError {
    Store(StoreError),
    FlatFile(FlatFileError),
    Corrupt(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Store(err) => write!(f, "store: {err}"),
            StorageError::FlatFile(err) => write!(f, "block files: {err}"),
            StorageError::Corrupt(message) => write!(f, "corrupt state: {message}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StoreError> for StorageError {
    fn from(err: StoreError) -> Self {
        StorageError::Store(err)
    }
}

impl From<FlatFileError> for StorageError {
    fn from(err: FlatFileError) -> Self {
        StorageError::FlatFile(err)
    }
}

/// Why a specific block was refused.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RejectReason {
    pub hash: Hash256,
    pub error: ValidationError,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block {} rejected: {}", hash256_to_hex(&self.hash), self.error)
    }
}

#[derive(Debug)]
pub enum ChainError {
    MalformedBlock(RejectReason),
    ConsensusViolation(RejectReason),
    UnknownParent { hash: Hash256, parent: Hash256 },
    DoubleSpend(RejectReason),
    DependencyViolation(&'static str),
    StorageFailure(StorageError),
    /// A reorganization failed. With `rolled_back` the previous chain was
    /// restored; without it the engine has halted.
    ReorgFailure {
        cause: Box<ChainError>,
        rolled_back: bool,
    },
    IndexNotEnabled(IndexKind),
    NotFound(Hash256),
    Interrupted,
    Halted,
}

impl ChainError {
    pub fn rejected(hash: Hash256, error: ValidationError) -> Self {
        let reason = RejectReason { hash, error };
        match reason.error.kind() {
            ErrorKind::MalformedBlock => ChainError::MalformedBlock(reason),
            ErrorKind::DoubleSpend => ChainError::DoubleSpend(reason),
            _ => ChainError::ConsensusViolation(reason),
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        ChainError::StorageFailure(StorageError::Corrupt(message.into()))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ChainError::MalformedBlock(_) => ErrorKind::MalformedBlock,
            ChainError::ConsensusViolation(_) => ErrorKind::ConsensusViolation,
            ChainError::UnknownParent { .. } => ErrorKind::UnknownParent,
            ChainError::DoubleSpend(_) => ErrorKind::DoubleSpend,
            ChainError::DependencyViolation(_) => ErrorKind::DependencyViolation,
            ChainError::StorageFailure(_) => ErrorKind::StorageFailure,
            ChainError::ReorgFailure { .. } => ErrorKind::ReorgFailure,
            ChainError::IndexNotEnabled(_) => ErrorKind::IndexNotEnabled,
            ChainError::NotFound(_) => ErrorKind::NotFound,
            ChainError::Interrupted => ErrorKind::Interrupted,
            ChainError::Halted => ErrorKind::Halted,
        }
    }

    /// The rejection of a block, looking through a rolled-back reorg.
    pub fn reject_reason(&self) -> Option<&RejectReason> {
        match self {
            ChainError::MalformedBlock(reason)
            | ChainError::ConsensusViolation(reason)
            | ChainError::DoubleSpend(reason) => Some(reason),
            ChainError::ReorgFailure { cause, .. } => cause.reject_reason(),
            _ => None,
        }
    }

    /// Kind of the underlying failure, looking through a rolled-back reorg.
    pub fn root_kind(&self) -> ErrorKind {
        match self {
            ChainError::ReorgFailure { cause, .. } => cause.root_kind(),
            other => other.kind(),
        }
    }

    /// The engine cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            ChainError::ReorgFailure { rolled_back, .. } => !rolled_back,
            ChainError::StorageFailure(_) | ChainError::Halted => true,
            _ => false,
        }
    }
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::MalformedBlock(reason) => write!(f, "malformed block: {reason}"),
            ChainError::ConsensusViolation(reason) => write!(f, "consensus violation: {reason}"),
            ChainError::UnknownParent { hash, parent } => write!(
                f,
                "block {} has unknown parent {}",
                hash256_to_hex(hash),
                hash256_to_hex(parent)
            ),
            ChainError::DoubleSpend(reason) => write!(f, "double spend: {reason}"),
            ChainError::DependencyViolation(message) => {
                write!(f, "dependency violation: {message}")
            }
            ChainError::StorageFailure(err) => write!(f, "storage failure: {err}"),
            ChainError::ReorgFailure { cause, rolled_back } => {
                if *rolled_back {
                    write!(f, "reorganization rolled back: {cause}")
                } else {
                    write!(f, "reorganization rollback failed: {cause}")
                }
            }
            ChainError::IndexNotEnabled(kind) => write!(f, "{} is not enabled", kind.as_str()),
            ChainError::NotFound(hash) => write!(f, "block {} not found", hash256_to_hex(hash)),
            ChainError::Interrupted => write!(f, "interrupted"),
            ChainError::Halted => write!(f, "chain engine halted"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<StorageError> for ChainError {
    fn from(err: StorageError) -> Self {
        ChainError::StorageFailure(err)
    }
}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ChainError::StorageFailure(StorageError::Store(err))
    }
}

impl From<FlatFileError> for ChainError {
    fn from(err: FlatFileError) -> Self {
        ChainError::StorageFailure(StorageError::FlatFile(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_roundtrip() {
        for kind in [
            ErrorKind::MalformedBlock,
            ErrorKind::ConsensusViolation,
            ErrorKind::DoubleSpend,
            ErrorKind::Halted,
        ] {
            assert_eq!(ErrorKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ErrorKind::from_code(0), None);
    }

    #[test]
    fn rejection_class_follows_validation_error() {
        let err = ChainError::rejected([1u8; 32], ValidationError::MerkleMismatch);
        assert_eq!(err.kind(), ErrorKind::MalformedBlock);
        let err = ChainError::rejected([1u8; 32], ValidationError::InputsBelowOutputs);
        assert_eq!(err.kind(), ErrorKind::ConsensusViolation);

        let wrapped = ChainError::ReorgFailure {
            cause: Box::new(ChainError::rejected([1u8; 32], ValidationError::TimeTooOld)),
            rolled_back: true,
        };
        assert_eq!(wrapped.kind(), ErrorKind::ReorgFailure);
        assert_eq!(wrapped.root_kind(), ErrorKind::ConsensusViolation);
        assert!(!wrapped.is_fatal());
    }
}
