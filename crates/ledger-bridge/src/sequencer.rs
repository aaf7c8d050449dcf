//! Sequence Coordinator - Picks the target sequence number for fiber writes
//!
//! The ledger only accepts a transition at `committed + 1`, and its commit
//! index lags behind accepted writes. Two writes issued back-to-back against
//! the same fiber would otherwise read the same stale sequence number and
//! collide. The coordinator serializes writes per fiber and refuses to hand
//! out a new target until the previous one is visible in the commit index.

use crate::client::{LedgerClient, LedgerError};
use dashmap::DashMap;
use ledger_types::{FiberId, SignedUpdate};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Deadline used when a caller's timeout does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Sequence coordinator configuration
#[derive(Debug, Clone)]
pub struct SequenceConfig {
    /// How long to wait for a submitted target to become visible
    pub wait_timeout: Duration,
    /// Delay between commit index reads while waiting
    pub poll_interval: Duration,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Per-fiber write position held by this coordinator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceCursor {
    pub fiber_id: FiberId,
    /// Target of the last transition this coordinator submitted
    pub last_submitted_target: Option<u64>,
    /// Last sequence number read from the commit index
    pub last_confirmed_observed: Option<u64>,
}

/// Outcome of a submitted transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedTransition {
    pub fiber_id: FiberId,
    /// Sequence number the transition was submitted at
    pub target: u64,
    /// Hash the ledger assigned to the update
    pub update_hash: String,
    /// Commit index value once the target became visible
    pub observed: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SequenceError {
    #[error(
        "Fiber {fiber_id} did not reach sequence {target} within {timeout_ms}ms (last observed {observed:?})"
    )]
    SyncTimeout {
        fiber_id: FiberId,
        target: u64,
        observed: Option<u64>,
        timeout_ms: u64,
    },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Hands out collision-free target sequence numbers per fiber
pub struct SequenceCoordinator {
    ledger: Arc<dyn LedgerClient>,
    cursors: DashMap<FiberId, Arc<Mutex<SequenceCursor>>>,
    config: SequenceConfig,
}

impl SequenceCoordinator {
    /// Create a coordinator reading from `ledger`
    pub fn new(ledger: Arc<dyn LedgerClient>, config: SequenceConfig) -> Self {
        Self {
            ledger,
            cursors: DashMap::new(),
            config,
        }
    }

    fn cursor(&self, fiber_id: &str) -> Arc<Mutex<SequenceCursor>> {
        self.cursors
            .entry(fiber_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SequenceCursor {
                    fiber_id: fiber_id.to_string(),
                    ..Default::default()
                }))
            })
            .clone()
    }

    /// Current sequence number of a fiber from the most authoritative source
    ///
    /// The on-chain commit index wins; the query-layer mirror is only
    /// consulted for fibers the index does not list. Unknown fibers are at 0.
    pub async fn observed_sequence(&self, fiber_id: &str) -> Result<u64, LedgerError> {
        let onchain = self.ledger.onchain_state().await?;
        if let Some(sequence) = onchain.sequence_of(fiber_id) {
            return Ok(sequence);
        }

        match self.ledger.state_machine(fiber_id).await? {
            Some(snapshot) => Ok(snapshot.sequence_number),
            None => Ok(0),
        }
    }

    /// Next safe target sequence number for `fiber_id`
    ///
    /// Blocks until a previously submitted target is visible, up to the
    /// configured timeout.
    pub async fn next_sequence(&self, fiber_id: &str) -> Result<u64, SequenceError> {
        let cursor = self.cursor(fiber_id);
        let mut cursor = cursor.lock().await;
        self.reserve(&mut cursor).await
    }

    /// Wait until the commit index reports `fiber_id` at `target` or later
    ///
    /// `target` counts as submitted from here on: later `next_sequence` calls
    /// for the fiber wait for it even if this wait times out. Dropping the
    /// returned future abandons the wait only; nothing submitted to the
    /// ledger is cancelled.
    pub async fn wait_for_sequence(
        &self,
        fiber_id: &str,
        target: u64,
        timeout: Duration,
    ) -> Result<u64, SequenceError> {
        self.mark_submitted(fiber_id, target).await;

        let observed = self.poll_until(fiber_id, target, timeout).await?;
        let cursor = self.cursor(fiber_id);
        let mut cursor = cursor.lock().await;
        cursor.last_confirmed_observed = Some(
            cursor
                .last_confirmed_observed
                .map_or(observed, |previous| previous.max(observed)),
        );
        Ok(observed)
    }

    /// Compute a target, submit the transition built for it, and wait for it
    /// to become visible before returning
    ///
    /// Calls for the same fiber run one at a time; other fibers are unaffected.
    pub async fn submit_transition<F>(
        &self,
        fiber_id: &str,
        build: F,
    ) -> Result<SubmittedTransition, SequenceError>
    where
        F: FnOnce(u64) -> SignedUpdate,
    {
        let cursor = self.cursor(fiber_id);
        let mut cursor = cursor.lock().await;

        let target = self.reserve(&mut cursor).await?;
        let update = build(target);
        let response = self.ledger.submit_update(&update).await?;
        cursor.last_submitted_target = Some(target);

        tracing::debug!(
            "Submitted fiber {} at sequence {} (update {})",
            fiber_id,
            target,
            response.hash
        );

        let observed = self
            .poll_until(fiber_id, target, self.config.wait_timeout)
            .await?;
        cursor.last_confirmed_observed = Some(observed);

        Ok(SubmittedTransition {
            fiber_id: fiber_id.to_string(),
            target,
            update_hash: response.hash,
            observed,
        })
    }

    /// Record that a transition was submitted outside `submit_transition`
    ///
    /// Never lowers the pending target.
    pub async fn mark_submitted(&self, fiber_id: &str, target: u64) {
        let cursor = self.cursor(fiber_id);
        let mut cursor = cursor.lock().await;
        cursor.last_submitted_target = Some(
            cursor
                .last_submitted_target
                .map_or(target, |previous| previous.max(target)),
        );
    }

    /// Drop the cursor of a fiber, as if this process had just started
    ///
    /// Use after the ledger has rejected the last submitted transition, which
    /// otherwise keeps every later call waiting for a target that never lands.
    pub fn forget(&self, fiber_id: &str) -> bool {
        self.cursors.remove(fiber_id).is_some()
    }

    /// Snapshot of a fiber's cursor, if this coordinator has written to it
    pub async fn cursor_state(&self, fiber_id: &str) -> Option<SequenceCursor> {
        let cursor = self.cursors.get(fiber_id).map(|c| c.value().clone())?;
        let state = cursor.lock().await.clone();
        Some(state)
    }

    async fn reserve(&self, cursor: &mut SequenceCursor) -> Result<u64, SequenceError> {
        let observed = match cursor.last_submitted_target {
            Some(pending) => {
                self.poll_until(&cursor.fiber_id, pending, self.config.wait_timeout)
                    .await?
            }
            None => self.observed_sequence(&cursor.fiber_id).await?,
        };
        cursor.last_confirmed_observed = Some(observed);
        Ok(observed + 1)
    }

    async fn poll_until(
        &self,
        fiber_id: &str,
        target: u64,
        timeout: Duration,
    ) -> Result<u64, SequenceError> {
        // An unbounded timeout still needs a deadline tokio can represent
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE);
        let mut last_observed = None;

        loop {
            match tokio::time::timeout_at(deadline, self.observed_sequence(fiber_id)).await {
                Ok(Ok(sequence)) if sequence >= target => return Ok(sequence),
                Ok(Ok(sequence)) => last_observed = Some(sequence),
                Ok(Err(e)) => {
                    tracing::warn!("Reading sequence of fiber {} failed: {}", fiber_id, e);
                }
                Err(_) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SequenceError::SyncTimeout {
                    fiber_id: fiber_id.to_string(),
                    target,
                    observed: last_observed,
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }
}
