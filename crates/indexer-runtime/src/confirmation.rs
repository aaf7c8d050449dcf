//! Confirmation Poller - Resolves PENDING snapshots against the checkpoint layer
//!
//! Each tick reads the checkpoint frontier and, for every PENDING row at or
//! below it, compares our hash with the one the checkpoint layer recorded.
//! Matching rows are CONFIRMED and the rest ORPHANED. Rows above the
//! frontier, or at heights the checkpoint layer has no record for yet, are
//! left PENDING. An unreachable checkpoint layer changes nothing.

use crate::error::PollError;
use crate::health::{HealthHandle, PollerHealth};
use crate::shutdown::ShutdownSignal;
use crate::store::{IndexedSnapshot, IndexerStore, Resolution};
use ledger_bridge::LedgerClient;
use ledger_types::Ordinal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Default interval between confirmation ticks
pub const DEFAULT_CONFIRMATION_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct ConfirmationConfig {
    pub interval: Duration,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_CONFIRMATION_INTERVAL,
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfirmationReport {
    pub frontier: Ordinal,
    pub confirmed: usize,
    pub orphaned: usize,
    /// PENDING rows at or below the frontier with no checkpoint record yet
    pub awaiting: usize,
    /// Heights whose checkpoint record could not be fetched
    pub lookup_failures: usize,
}

pub struct ConfirmationPoller {
    store: IndexerStore,
    checkpoint: Arc<dyn LedgerClient>,
    config: ConfirmationConfig,
    health: HealthHandle,
}

impl ConfirmationPoller {
    pub fn new(
        store: IndexerStore,
        checkpoint: Arc<dyn LedgerClient>,
        config: ConfirmationConfig,
    ) -> Self {
        Self {
            store,
            checkpoint,
            config,
            health: HealthHandle::new(),
        }
    }

    pub fn health(&self) -> HealthHandle {
        self.health.clone()
    }

    /// Run ticks until shutdown; a tick in progress always completes
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "Confirmation poller started against {} (every {:?})",
            self.checkpoint.label(),
            self.config.interval
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.wait() => break,
            }
            self.tick().await;
        }

        tracing::info!("Confirmation poller stopped");
    }

    /// One tick, with its outcome recorded in the health handle
    pub async fn tick(&self) -> Option<ConfirmationReport> {
        match self.poll_once().await {
            Ok(report) => {
                if report.lookup_failures > 0 {
                    self.health.record_failure(format!(
                        "{} checkpoint lookups failed",
                        report.lookup_failures
                    ));
                } else {
                    self.health.record_success();
                }
                if report.confirmed > 0 || report.orphaned > 0 {
                    tracing::info!(
                        "Confirmation tick at frontier {}: {} confirmed, {} orphaned, {} awaiting",
                        report.frontier,
                        report.confirmed,
                        report.orphaned,
                        report.awaiting
                    );
                }
                Some(report)
            }
            Err(e) => {
                tracing::warn!("Confirmation tick failed: {}", e);
                self.health.record_failure(&e);
                None
            }
        }
    }

    /// Resolve every PENDING row at or below the current frontier
    pub async fn poll_once(&self) -> Result<ConfirmationReport, PollError> {
        let frontier = self.checkpoint.latest_checkpoint().await?;
        let mut report = ConfirmationReport {
            frontier: frontier.ordinal,
            ..Default::default()
        };

        let mut by_ordinal: BTreeMap<Ordinal, Vec<IndexedSnapshot>> = BTreeMap::new();
        for row in self.store.pending_up_to(frontier.ordinal)? {
            by_ordinal.entry(row.ordinal).or_default().push(row);
        }

        for (ordinal, rows) in by_ordinal {
            let record = match self.checkpoint.checkpoint_record(ordinal).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    report.awaiting += rows.len();
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Checkpoint record for {} unavailable: {}", ordinal, e);
                    report.lookup_failures += 1;
                    report.awaiting += rows.len();
                    continue;
                }
            };

            let parent_checkpoint_ordinal = record.checkpoint_ordinal.unwrap_or(frontier.ordinal);
            for row in rows {
                if row.hash == record.hash {
                    let resolution = Resolution::Confirmed {
                        parent_checkpoint_ordinal,
                    };
                    if self.store.resolve(ordinal, &row.hash, resolution)? {
                        report.confirmed += 1;
                        tracing::debug!(
                            "Snapshot {} ({}) confirmed by checkpoint {}",
                            ordinal,
                            row.hash,
                            parent_checkpoint_ordinal
                        );
                    }
                } else if self.store.resolve(ordinal, &row.hash, Resolution::Orphaned)? {
                    report.orphaned += 1;
                    tracing::warn!(
                        "Snapshot {} ({}) orphaned: checkpoint recorded {}",
                        ordinal,
                        row.hash,
                        record.hash
                    );
                }
            }
        }

        Ok(report)
    }

    pub fn health_snapshot(&self) -> PollerHealth {
        self.health.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IngestSource, SnapshotStatus};
    use ledger_bridge::memory::InMemoryLedger;
    use ledger_types::SnapshotStats;

    fn setup() -> (IndexerStore, Arc<InMemoryLedger>, ConfirmationPoller) {
        let store = IndexerStore::temporary().unwrap();
        let checkpoint = Arc::new(InMemoryLedger::new("checkpoint"));
        let poller = ConfirmationPoller::new(
            store.clone(),
            checkpoint.clone(),
            ConfirmationConfig::default(),
        );
        (store, checkpoint, poller)
    }

    fn index(store: &IndexerStore, ordinal: Ordinal, hash: &str) {
        store
            .insert_pending(IndexedSnapshot::pending(
                ordinal,
                hash,
                IngestSource::Webhook,
                None,
                SnapshotStats::default(),
            ))
            .unwrap();
    }

    fn status(store: &IndexerStore, ordinal: Ordinal, hash: &str) -> SnapshotStatus {
        store.get_snapshot(ordinal, hash).unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_matching_hash_confirms() {
        let (store, checkpoint, poller) = setup();
        index(&store, 100, "h100");
        checkpoint.confirm(100, "h100", Some(7));

        let report = poller.tick().await.unwrap();
        assert_eq!(report.confirmed, 1);

        let row = store.get_snapshot(100, "h100").unwrap().unwrap();
        assert_eq!(row.status, SnapshotStatus::Confirmed);
        assert_eq!(row.parent_checkpoint_ordinal, Some(7));
        assert!(row.confirmed_at.is_some());
        assert_eq!(store.last_confirmed_ordinal().unwrap(), Some(100));
    }

    #[tokio::test]
    async fn test_parent_defaults_to_frontier() {
        let (store, checkpoint, poller) = setup();
        index(&store, 10, "h10");
        checkpoint.confirm(10, "h10", None);
        checkpoint.set_frontier(12);

        poller.tick().await.unwrap();
        let row = store.get_snapshot(10, "h10").unwrap().unwrap();
        assert_eq!(row.parent_checkpoint_ordinal, Some(12));
    }

    #[tokio::test]
    async fn test_losing_fork_is_orphaned() {
        let (store, checkpoint, poller) = setup();
        index(&store, 50, "ours");
        index(&store, 50, "winner");
        checkpoint.confirm(50, "winner", None);

        let report = poller.tick().await.unwrap();
        assert_eq!(report.confirmed, 1);
        assert_eq!(report.orphaned, 1);
        assert_eq!(status(&store, 50, "ours"), SnapshotStatus::Orphaned);
        assert_eq!(status(&store, 50, "winner"), SnapshotStatus::Confirmed);
        assert!(store.get_snapshot(50, "ours").unwrap().unwrap().orphaned_at.is_some());
    }

    #[tokio::test]
    async fn test_rows_above_frontier_or_without_record_stay_pending() {
        let (store, checkpoint, poller) = setup();
        index(&store, 5, "h5");
        index(&store, 6, "h6");
        index(&store, 9, "h9");
        checkpoint.confirm(5, "h5", None);
        checkpoint.set_frontier(7);

        let report = poller.tick().await.unwrap();
        assert_eq!(report.confirmed, 1);
        assert_eq!(report.awaiting, 1);
        assert_eq!(status(&store, 6, "h6"), SnapshotStatus::Pending);
        assert_eq!(status(&store, 9, "h9"), SnapshotStatus::Pending);
    }

    #[tokio::test]
    async fn test_unreachable_checkpoint_changes_nothing() {
        let (store, checkpoint, poller) = setup();
        index(&store, 100, "h100");
        checkpoint.confirm(100, "h100", None);
        checkpoint.set_unreachable(true);

        assert!(poller.tick().await.is_none());
        assert_eq!(status(&store, 100, "h100"), SnapshotStatus::Pending);

        let health = poller.health_snapshot();
        assert_eq!(health.consecutive_failures, 1);
        assert!(health.last_error.is_some());

        checkpoint.set_unreachable(false);
        poller.tick().await.unwrap();
        assert_eq!(status(&store, 100, "h100"), SnapshotStatus::Confirmed);
        assert!(poller.health_snapshot().is_healthy());
    }

    #[tokio::test]
    async fn test_terminal_rows_are_never_revisited() {
        let (store, checkpoint, poller) = setup();
        index(&store, 3, "a");
        checkpoint.confirm(3, "b", None);
        poller.tick().await.unwrap();
        assert_eq!(status(&store, 3, "a"), SnapshotStatus::Orphaned);

        checkpoint.confirm(3, "a", None);
        let report = poller.tick().await.unwrap();
        assert_eq!(report.confirmed, 0);
        assert_eq!(status(&store, 3, "a"), SnapshotStatus::Orphaned);
    }
}
