//! Snapshot Ingestion - Records announced snapshots and rejections
//!
//! Both the webhook endpoint and the fallback poller go through
//! [`SnapshotIngestor`], so a snapshot is indexed the same way whichever
//! path saw it first.

use crate::error::StoreError;
use crate::pool::MaterializationQueue;
use crate::rejections::{Classification, RejectedTransaction, RejectionLedger};
use crate::store::{IndexedSnapshot, IndexerStore, IngestSource, InsertOutcome};
use ledger_types::{Ordinal, RejectionNotification, SnapshotNotification, SnapshotStats};
use serde::Serialize;

/// Result of ingesting one snapshot announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub ordinal: Ordinal,
    pub already_indexed: bool,
    /// Other hashes indexed at the same ordinal
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub competing_hashes: Vec<String>,
    /// Whether a materialization job was accepted
    pub queued: bool,
}

/// Result of ingesting one rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionOutcome {
    pub recorded: bool,
    pub classification: Classification,
}

/// Shared entry point for snapshot and rejection ingestion
#[derive(Clone)]
pub struct SnapshotIngestor {
    store: IndexerStore,
    rejections: RejectionLedger,
    queue: MaterializationQueue,
}

impl SnapshotIngestor {
    pub fn new(store: IndexerStore, rejections: RejectionLedger, queue: MaterializationQueue) -> Self {
        Self {
            store,
            rejections,
            queue,
        }
    }

    pub fn store(&self) -> &IndexerStore {
        &self.store
    }

    pub fn rejections(&self) -> &RejectionLedger {
        &self.rejections
    }

    pub fn queue(&self) -> &MaterializationQueue {
        &self.queue
    }

    /// Index a snapshot delivered by webhook
    pub fn ingest_notification(
        &self,
        notification: SnapshotNotification,
    ) -> Result<IngestOutcome, StoreError> {
        self.ingest(
            notification.ordinal,
            &notification.hash,
            IngestSource::Webhook,
            notification.timestamp,
            notification.stats,
        )
    }

    /// Index a snapshot, enqueueing materialization when it is new
    ///
    /// A duplicate is a no-op: no row is written and no job is enqueued.
    pub fn ingest(
        &self,
        ordinal: Ordinal,
        hash: &str,
        source: IngestSource,
        ledger_timestamp: Option<String>,
        stats: SnapshotStats,
    ) -> Result<IngestOutcome, StoreError> {
        let row = IndexedSnapshot::pending(ordinal, hash, source, ledger_timestamp, stats);
        let outcome = self.store.insert_pending(row)?;

        let competing_hashes = match outcome {
            InsertOutcome::AlreadyIndexed => {
                tracing::debug!("Snapshot {} ({}) already indexed", ordinal, hash);
                return Ok(IngestOutcome {
                    ordinal,
                    already_indexed: true,
                    competing_hashes: Vec::new(),
                    queued: false,
                });
            }
            InsertOutcome::Inserted => Vec::new(),
            InsertOutcome::Competing(others) => {
                tracing::warn!(
                    "Snapshot {} indexed with hash {} next to competing hashes {:?}",
                    ordinal,
                    hash,
                    others
                );
                others
            }
        };

        let queued = self.queue.enqueue(ordinal, hash);
        tracing::info!("Indexed snapshot {} ({}) via {:?}", ordinal, hash, source);

        Ok(IngestOutcome {
            ordinal,
            already_indexed: false,
            competing_hashes,
            queued,
        })
    }

    /// Record a rejection, deduplicated by update hash
    pub fn ingest_rejection(
        &self,
        notification: RejectionNotification,
    ) -> Result<RejectionOutcome, StoreError> {
        let rejection = RejectedTransaction::from_notification(notification);
        let recorded = self.rejections.record(&rejection)?;
        Ok(RejectionOutcome {
            recorded,
            classification: rejection.classify(),
        })
    }
}
