//! Ledger Bridge - Reads from and writes to the metagraph ledger
//!
//! Handles communication with the ledger node:
//! - Polling checkpoints, snapshots and the on-chain commit index
//! - Submitting signed fiber transitions at a safe sequence number
//! - Registering our webhook endpoint with the node

pub mod client;
pub mod retry;
pub mod sequencer;
pub mod subscriber;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

pub use client::{HttpLedgerClient, LedgerClient, LedgerError};
pub use retry::RetryPolicy;
pub use sequencer::{
    SequenceConfig, SequenceCoordinator, SequenceCursor, SequenceError, SubmittedTransition,
};
pub use subscriber::WebhookRegistrar;
