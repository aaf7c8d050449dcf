//! Poller health and fork divergence signals

use chrono::{DateTime, Utc};
use ledger_types::Ordinal;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;

/// Run history of one background poller
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollerHealth {
    pub runs: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u64,
    pub last_error: Option<String>,
}

impl PollerHealth {
    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures == 0
    }
}

/// Shared handle to a poller's health
#[derive(Clone, Default)]
pub struct HealthHandle {
    inner: Arc<RwLock<PollerHealth>>,
}

impl HealthHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        let now = Utc::now();
        let mut health = self.inner.write();
        health.runs += 1;
        health.last_run_at = Some(now);
        health.last_success_at = Some(now);
        health.consecutive_failures = 0;
    }

    pub fn record_failure(&self, error: impl Display) {
        let mut health = self.inner.write();
        health.runs += 1;
        health.last_run_at = Some(Utc::now());
        health.consecutive_failures += 1;
        health.last_error = Some(error.to_string());
    }

    pub fn snapshot(&self) -> PollerHealth {
        self.inner.read().clone()
    }
}

/// Nodes disagreeing on the hash at one ordinal
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DivergenceReport {
    pub ordinal: Ordinal,
    /// Node label -> snapshot hash
    pub hashes: BTreeMap<String, String>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DivergenceState {
    /// Present while the latest comparison disagreed
    pub current: Option<DivergenceReport>,
    pub total_detected: u64,
}

/// Shared record of detected divergence
#[derive(Clone, Default)]
pub struct DivergenceMonitor {
    inner: Arc<RwLock<DivergenceState>>,
}

impl DivergenceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, report: DivergenceReport) {
        let mut state = self.inner.write();
        state.total_detected += 1;
        state.current = Some(report);
    }

    /// Nodes agreed on the latest comparison
    pub fn clear(&self) {
        self.inner.write().current = None;
    }

    pub fn snapshot(&self) -> DivergenceState {
        self.inner.read().clone()
    }
}
