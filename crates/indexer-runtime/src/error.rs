//! Indexer Runtime Errors

use ledger_bridge::LedgerError;
use ledger_types::Ordinal;
use thiserror::Error;

/// Failures of the sled-backed store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Corrupt row: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Transaction aborted: {0}")]
    Transaction(String),
}

/// Failures of a single materialization job
#[derive(Error, Debug)]
pub enum MaterializeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Snapshot {ordinal}/{hash} is not indexed")]
    NotIndexed { ordinal: Ordinal, hash: String },

    #[error("Snapshot {ordinal} payload hash {actual} does not match indexed hash {expected}")]
    HashMismatch {
        ordinal: Ordinal,
        expected: String,
        actual: String,
    },

    #[error("Snapshot {ordinal}/{hash} is orphaned")]
    Orphaned { ordinal: Ordinal, hash: String },
}

/// Failures of a poller tick; the poller logs them and tries again next tick
#[derive(Error, Debug)]
pub enum PollError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
