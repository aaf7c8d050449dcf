//! Indexer Runtime - Snapshot ingestion and confirmation pipeline
//!
//! This crate holds everything between the ledger's webhook and the indexed
//! database:
//! - Durable snapshot rows and fiber records on sled
//! - Idempotent snapshot ingestion shared by the webhook and fallback paths
//! - A bounded materializer pool with a recovery sweep
//! - Confirmation and fallback pollers
//! - A deduplicated, classified rejection ledger

pub mod confirmation;
pub mod error;
pub mod fallback;
pub mod health;
pub mod ingest;
pub mod materializer;
pub mod pool;
pub mod rejections;
pub mod shutdown;
pub mod store;

#[cfg(test)]
mod tests;

pub use confirmation::{ConfirmationConfig, ConfirmationPoller, ConfirmationReport};
pub use error::{MaterializeError, PollError, StoreError};
pub use fallback::{FallbackConfig, FallbackPoller, FallbackReport};
pub use health::{DivergenceMonitor, DivergenceReport, DivergenceState, HealthHandle, PollerHealth};
pub use ingest::{IngestOutcome, RejectionOutcome, SnapshotIngestor};
pub use materializer::Materializer;
pub use pool::{MaterializationQueue, MaterializerPool, MaterializerPoolConfig, MaterializerStats};
pub use rejections::{Classification, RejectedTransaction, RejectionFilter, RejectionLedger};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use store::{
    FiberRecord, IndexedSnapshot, IndexerStore, IngestSource, InsertOutcome, MaterializationCounts,
    Resolution, SnapshotStatus, StatusCounts,
};
