//! Fallback Poller - Backfills snapshots the webhook never delivered
//!
//! Webhook delivery is best effort. Each tick this poller reads the newest
//! snapshot from the primary node, indexes any ordinal above its persisted
//! watermark that has no row, compares the primary's view with peer nodes,
//! and sweeps rows still owed a materialization pass back into the queue.
//!
//! The watermark only rises past ordinals that have a row or that the node
//! does not know, so a gap stays in range until it is filled however far
//! behind the newest snapshot it falls.

use crate::error::PollError;
use crate::health::{DivergenceMonitor, DivergenceReport, HealthHandle};
use crate::ingest::SnapshotIngestor;
use crate::shutdown::ShutdownSignal;
use crate::store::IngestSource;
use chrono::Utc;
use futures::future::join_all;
use ledger_bridge::LedgerClient;
use ledger_types::{Ordinal, SnapshotInfo, SnapshotStats};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Default interval between fallback ticks
pub const DEFAULT_FALLBACK_INTERVAL: Duration = Duration::from_secs(120);

#[derive(Clone, Debug)]
pub struct FallbackConfig {
    pub interval: Duration,
    /// Most snapshots indexed by one tick
    pub max_backfill_per_tick: usize,
    /// How far below the newest snapshot the first scan of a fresh store starts
    pub lookback: u64,
    /// Most unmaterialized rows re-enqueued by one tick
    pub sweep_batch: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_FALLBACK_INTERVAL,
            max_backfill_per_tick: 100,
            lookback: 50,
            sweep_batch: 64,
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FallbackReport {
    pub latest: Ordinal,
    pub backfilled: Vec<Ordinal>,
    pub divergence: Option<DivergenceReport>,
    pub requeued: usize,
}

pub struct FallbackPoller {
    ingestor: SnapshotIngestor,
    primary: Arc<dyn LedgerClient>,
    peers: Vec<Arc<dyn LedgerClient>>,
    config: FallbackConfig,
    health: HealthHandle,
    divergence: DivergenceMonitor,
}

impl FallbackPoller {
    pub fn new(
        ingestor: SnapshotIngestor,
        primary: Arc<dyn LedgerClient>,
        config: FallbackConfig,
    ) -> Self {
        Self {
            ingestor,
            primary,
            peers: Vec::new(),
            config,
            health: HealthHandle::new(),
            divergence: DivergenceMonitor::new(),
        }
    }

    /// Nodes whose view of the chain is compared with the primary's
    pub fn with_peers(mut self, peers: Vec<Arc<dyn LedgerClient>>) -> Self {
        self.peers = peers;
        self
    }

    pub fn health(&self) -> HealthHandle {
        self.health.clone()
    }

    pub fn divergence(&self) -> DivergenceMonitor {
        self.divergence.clone()
    }

    /// Run ticks until shutdown; a tick in progress always completes
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "Fallback poller started against {} with {} peers (every {:?})",
            self.primary.label(),
            self.peers.len(),
            self.config.interval
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.wait() => break,
            }
            self.tick().await;
        }

        tracing::info!("Fallback poller stopped");
    }

    /// One tick, with its outcome recorded in the health handle
    pub async fn tick(&self) -> Option<FallbackReport> {
        match self.poll_once().await {
            Ok(report) => {
                self.health.record_success();
                if !report.backfilled.is_empty() {
                    tracing::info!(
                        "Fallback backfilled {} snapshots up to {}",
                        report.backfilled.len(),
                        report.latest
                    );
                }
                Some(report)
            }
            Err(e) => {
                tracing::warn!("Fallback tick failed: {}", e);
                self.health.record_failure(&e);
                None
            }
        }
    }

    pub async fn poll_once(&self) -> Result<FallbackReport, PollError> {
        let latest = self.primary.latest_snapshot().await?;
        let mut report = FallbackReport {
            latest: latest.ordinal,
            ..Default::default()
        };

        report.backfilled = self.backfill(&latest).await?;
        report.divergence = self.compare_peers().await;
        report.requeued = self
            .ingestor
            .queue()
            .requeue_unmaterialized(self.ingestor.store(), self.config.sweep_batch)?;

        Ok(report)
    }

    /// First ordinal to check: just above the watermark, or on a store the
    /// poller has never scanned, the lower of the first indexed ordinal and
    /// the start of the lookback window
    fn scan_start(&self, latest: Ordinal) -> Result<Ordinal, PollError> {
        let store = self.ingestor.store();
        if let Some(watermark) = store.backfill_watermark()? {
            return Ok(watermark.saturating_add(1));
        }

        let window = latest.saturating_sub(self.config.lookback.saturating_sub(1));
        Ok(match store.first_indexed_ordinal()? {
            Some(first) => window.min(first),
            None => window,
        })
    }

    async fn backfill(&self, latest: &SnapshotInfo) -> Result<Vec<Ordinal>, PollError> {
        let store = self.ingestor.store();
        let mut backfilled = Vec::new();
        let mut settled = None;

        for ordinal in self.scan_start(latest.ordinal)?..=latest.ordinal {
            if backfilled.len() >= self.config.max_backfill_per_tick {
                break;
            }
            if store.has_ordinal(ordinal)? {
                settled = Some(ordinal);
                continue;
            }

            let info = if ordinal == latest.ordinal {
                latest.clone()
            } else {
                match self.primary.snapshot_info(ordinal).await {
                    Ok(Some(info)) => info,
                    Ok(None) => {
                        tracing::debug!("Snapshot {} unknown to {}", ordinal, self.primary.label());
                        settled = Some(ordinal);
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!("Backfill stopped at snapshot {}: {}", ordinal, e);
                        break;
                    }
                }
            };

            let outcome = self.ingestor.ingest(
                info.ordinal,
                &info.hash,
                IngestSource::Fallback,
                info.timestamp,
                SnapshotStats::default(),
            )?;
            if !outcome.already_indexed {
                tracing::info!("Backfilled snapshot {} missed by webhook", info.ordinal);
                backfilled.push(info.ordinal);
            }
            settled = Some(ordinal);
        }

        if let Some(ordinal) = settled {
            store.advance_backfill_watermark(ordinal)?;
        }
        Ok(backfilled)
    }

    /// Compare the hash every reachable node reports at the highest ordinal
    /// they all have
    async fn compare_peers(&self) -> Option<DivergenceReport> {
        if self.peers.is_empty() {
            return None;
        }

        let nodes: Vec<&Arc<dyn LedgerClient>> =
            std::iter::once(&self.primary).chain(self.peers.iter()).collect();

        let latest = join_all(nodes.iter().map(|node| node.latest_snapshot())).await;
        let reachable: Vec<_> = nodes
            .iter()
            .zip(latest)
            .filter_map(|(node, result)| match result {
                Ok(info) => Some((*node, info.ordinal)),
                Err(e) => {
                    tracing::debug!("Peer {} unreachable: {}", node.label(), e);
                    None
                }
            })
            .collect();
        if reachable.len() < 2 {
            return None;
        }

        let common = reachable.iter().map(|(_, ordinal)| *ordinal).min()?;
        let infos = join_all(reachable.iter().map(|(node, _)| node.snapshot_info(common))).await;

        let hashes: BTreeMap<String, String> = reachable
            .iter()
            .zip(infos)
            .filter_map(|((node, _), result)| match result {
                Ok(Some(info)) => Some((node.label().to_string(), info.hash)),
                _ => None,
            })
            .collect();

        let distinct: BTreeSet<&String> = hashes.values().collect();
        if distinct.len() <= 1 {
            self.divergence.clear();
            return None;
        }

        tracing::warn!("Nodes diverge at snapshot {}: {:?}", common, hashes);
        let report = DivergenceReport {
            ordinal: common,
            hashes,
            detected_at: Utc::now(),
        };
        self.divergence.record(report.clone());
        Some(report)
    }
}
