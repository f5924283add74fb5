//! Chain validation, UTXO set and index maintenance.

pub mod address_index;
pub mod blockindex;
pub mod blockstore;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod flatfiles;
pub mod indexes;
pub mod orphans;
pub mod reorg;
pub mod selector;
pub mod state;
pub mod tree;
pub mod txindex;
pub mod undo;
pub mod utxo;
pub mod validation;

pub use blockstore::BlockRef;
pub use cancel::CancelToken;
pub use config::{ChainConfig, IndexConfig};
pub use engine::{BlockStatus, ChainEngine, ChainStatus, SubmitOutcome, TransactionRecord};
pub use error::{ChainError, ErrorKind, StorageError};
pub use indexes::IndexKind;
pub use validation::ValidationError;
