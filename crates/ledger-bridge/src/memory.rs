//! In-memory ledger node for tests
//!
//! Models the parts of the ledger the indexer depends on: a commit index that
//! lags accepted writes by a configurable number of reads, per-fiber sequence
//! validation, snapshot listings, checkpoint records and an on/off switch for
//! simulating an unreachable node.

use crate::client::{LedgerClient, LedgerError};
use async_trait::async_trait;
use ledger_types::{
    Checkpoint, CheckpointRecord, FiberCommit, FiberId, FiberSnapshot, OnChainState, Ordinal,
    Rejection, RejectionError, SignedUpdate, SnapshotInfo, SnapshotPayload, SubmitResponse,
    SubscriptionAck,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Build a minimal transition update for `fiber_id` at `target`
pub fn transition_update(fiber_id: &str, target: u64) -> SignedUpdate {
    SignedUpdate {
        value: json!({
            "TransitionStateMachine": {
                "fiberId": fiber_id,
                "eventName": "tick",
                "payload": {},
                "targetSequenceNumber": target,
            }
        }),
        proofs: Vec::new(),
    }
}

#[derive(Debug, Clone)]
struct PendingWrite {
    fiber_id: FiberId,
    target: u64,
    reads_left: u32,
}

#[derive(Default)]
struct LedgerState {
    committed: HashMap<FiberId, u64>,
    mirror_only: HashMap<FiberId, u64>,
    pending: Vec<PendingWrite>,
    frozen: HashSet<FiberId>,
    lag_reads: u32,
    accepted: Vec<(FiberId, u64)>,
    rejections: Vec<Rejection>,
    unreachable: bool,
    checkpoint: Option<Checkpoint>,
    checkpoint_records: HashMap<Ordinal, CheckpointRecord>,
    snapshots: BTreeMap<Ordinal, SnapshotInfo>,
    payloads: HashMap<Ordinal, SnapshotPayload>,
    subscriptions: Vec<String>,
    state_reads: u64,
}

/// Ledger node kept entirely in memory
pub struct InMemoryLedger {
    label: String,
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Accepted writes stay invisible for this many commit index reads
    pub fn set_lag_reads(&self, reads: u32) {
        self.state.lock().lag_reads = reads;
    }

    /// Set a fiber's committed sequence number directly
    pub fn set_committed(&self, fiber_id: &str, sequence: u64) {
        self.state.lock().committed.insert(fiber_id.to_string(), sequence);
    }

    /// Make a fiber visible only through the query-layer mirror
    pub fn set_mirror_only(&self, fiber_id: &str, sequence: u64) {
        self.state.lock().mirror_only.insert(fiber_id.to_string(), sequence);
    }

    /// Stop writes to a fiber from ever becoming visible
    pub fn freeze_fiber(&self, fiber_id: &str) {
        self.state.lock().frozen.insert(fiber_id.to_string());
    }

    pub fn unfreeze_fiber(&self, fiber_id: &str) {
        self.state.lock().frozen.remove(fiber_id);
    }

    pub fn committed(&self, fiber_id: &str) -> Option<u64> {
        self.state.lock().committed.get(fiber_id).copied()
    }

    /// Writes that passed sequence validation, in arrival order
    pub fn accepted_writes(&self) -> Vec<(FiberId, u64)> {
        self.state.lock().accepted.clone()
    }

    /// Writes refused for a sequence mismatch
    pub fn rejections(&self) -> Vec<Rejection> {
        self.state.lock().rejections.clone()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Publish a snapshot header and its state payload
    pub fn publish_snapshot(&self, payload: SnapshotPayload) {
        let mut state = self.state.lock();
        state.snapshots.insert(
            payload.ordinal,
            SnapshotInfo {
                ordinal: payload.ordinal,
                hash: payload.hash.clone(),
                timestamp: None,
            },
        );
        state.payloads.insert(payload.ordinal, payload);
    }

    /// Publish only a snapshot header
    pub fn publish_header(&self, ordinal: Ordinal, hash: &str) {
        self.state.lock().snapshots.insert(
            ordinal,
            SnapshotInfo {
                ordinal,
                hash: hash.to_string(),
                timestamp: None,
            },
        );
    }

    /// Record the checkpoint layer's decision at `ordinal` and advance the frontier
    pub fn confirm(&self, ordinal: Ordinal, hash: &str, checkpoint_ordinal: Option<Ordinal>) {
        let mut state = self.state.lock();
        state.checkpoint_records.insert(
            ordinal,
            CheckpointRecord {
                ordinal,
                hash: hash.to_string(),
                checkpoint_ordinal,
            },
        );
        let frontier = state.checkpoint.as_ref().map_or(0, |c| c.ordinal).max(ordinal);
        state.checkpoint = Some(Checkpoint {
            ordinal: frontier,
            state_digest: format!("digest-{}", frontier),
        });
    }

    /// Advance the frontier without publishing records below it
    pub fn set_frontier(&self, ordinal: Ordinal) {
        self.state.lock().checkpoint = Some(Checkpoint {
            ordinal,
            state_digest: format!("digest-{}", ordinal),
        });
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().subscriptions.clone()
    }

    /// Number of snapshot state payloads served
    pub fn state_reads(&self) -> u64 {
        self.state.lock().state_reads
    }

    fn check_reachable(&self, state: &LedgerState, path: &str) -> Result<(), LedgerError> {
        if state.unreachable {
            return Err(LedgerError::Status {
                url: format!("memory://{}{}", self.label, path),
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn not_found(&self, path: &str) -> LedgerError {
        LedgerError::Status {
            url: format!("memory://{}{}", self.label, path),
            status: 404,
            body: "not found".to_string(),
        }
    }
}

/// Locate `fiberId` and `targetSequenceNumber` in an update value
fn update_target(value: &Value) -> Option<(String, u64)> {
    let candidates = std::iter::once(value).chain(value.as_object().into_iter().flat_map(|m| m.values()));
    for candidate in candidates {
        let fiber = candidate.get("fiberId").and_then(Value::as_str);
        let target = candidate.get("targetSequenceNumber").and_then(Value::as_u64);
        if let (Some(fiber), Some(target)) = (fiber, target) {
            return Some((fiber.to_string(), target));
        }
    }
    None
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    fn label(&self) -> &str {
        &self.label
    }

    async fn latest_checkpoint(&self) -> Result<Checkpoint, LedgerError> {
        let state = self.state.lock();
        self.check_reachable(&state, "/checkpoint")?;
        state
            .checkpoint
            .clone()
            .ok_or_else(|| self.not_found("/checkpoint"))
    }

    async fn checkpoint_record(
        &self,
        ordinal: Ordinal,
    ) -> Result<Option<CheckpointRecord>, LedgerError> {
        let state = self.state.lock();
        self.check_reachable(&state, "/checkpoint/:ordinal")?;
        Ok(state.checkpoint_records.get(&ordinal).cloned())
    }

    async fn latest_snapshot(&self) -> Result<SnapshotInfo, LedgerError> {
        let state = self.state.lock();
        self.check_reachable(&state, "/snapshots/latest")?;
        state
            .snapshots
            .values()
            .next_back()
            .cloned()
            .ok_or_else(|| self.not_found("/snapshots/latest"))
    }

    async fn snapshot_info(&self, ordinal: Ordinal) -> Result<Option<SnapshotInfo>, LedgerError> {
        let state = self.state.lock();
        self.check_reachable(&state, "/snapshots/:ordinal")?;
        Ok(state.snapshots.get(&ordinal).cloned())
    }

    async fn snapshot_state(&self, ordinal: Ordinal) -> Result<SnapshotPayload, LedgerError> {
        let mut state = self.state.lock();
        self.check_reachable(&state, "/snapshots/:ordinal/state")?;
        state.state_reads += 1;
        state
            .payloads
            .get(&ordinal)
            .cloned()
            .ok_or_else(|| self.not_found("/snapshots/:ordinal/state"))
    }

    async fn onchain_state(&self) -> Result<OnChainState, LedgerError> {
        let mut state = self.state.lock();
        self.check_reachable(&state, "/onchain")?;

        let LedgerState {
            pending,
            committed,
            frozen,
            ..
        } = &mut *state;
        pending.retain_mut(|write| {
            if frozen.contains(&write.fiber_id) {
                return true;
            }
            if write.reads_left > 0 {
                write.reads_left -= 1;
                return true;
            }
            let entry = committed.entry(write.fiber_id.clone()).or_insert(0);
            *entry = (*entry).max(write.target);
            false
        });

        Ok(OnChainState {
            fiber_commits: committed
                .iter()
                .map(|(id, seq)| {
                    (
                        id.clone(),
                        FiberCommit {
                            sequence_number: *seq,
                        },
                    )
                })
                .collect(),
        })
    }

    async fn state_machine(&self, fiber_id: &str) -> Result<Option<FiberSnapshot>, LedgerError> {
        let state = self.state.lock();
        self.check_reachable(&state, "/state-machines/:fiberId")?;
        let sequence = state
            .committed
            .get(fiber_id)
            .or_else(|| state.mirror_only.get(fiber_id))
            .copied();
        Ok(sequence.map(|sequence_number| FiberSnapshot {
            fiber_id: fiber_id.to_string(),
            sequence_number,
            current_state: None,
            owners: BTreeSet::new(),
            state_data: Value::Null,
        }))
    }

    async fn submit_update(&self, update: &SignedUpdate) -> Result<SubmitResponse, LedgerError> {
        let mut state = self.state.lock();
        self.check_reachable(&state, "/data")?;

        let (fiber_id, target) = update_target(&update.value).ok_or_else(|| LedgerError::Status {
            url: format!("memory://{}/data", self.label),
            status: 400,
            body: "missing fiberId or targetSequenceNumber".to_string(),
        })?;
        let hash = format!("update-{}-{}", fiber_id, target);

        let committed = state.committed.get(&fiber_id).copied().unwrap_or(0);
        let head = state
            .pending
            .iter()
            .filter(|w| w.fiber_id == fiber_id)
            .map(|w| w.target)
            .fold(committed, u64::max);

        if target != head + 1 {
            state.rejections.push(Rejection {
                update_type: "TransitionStateMachine".to_string(),
                fiber_id,
                update_hash: hash.clone(),
                errors: vec![RejectionError {
                    code: "SequenceNumberMismatch".to_string(),
                    message: Some(format!("expected {}, got {}", head + 1, target)),
                }],
                signers: Vec::new(),
            });
            return Ok(SubmitResponse { hash });
        }

        let reads_left = state.lag_reads;
        state.accepted.push((fiber_id.clone(), target));
        state.pending.push(PendingWrite {
            fiber_id,
            target,
            reads_left,
        });
        Ok(SubmitResponse { hash })
    }

    async fn subscribe_webhook(&self, callback_url: &str) -> Result<SubscriptionAck, LedgerError> {
        let mut state = self.state.lock();
        self.check_reachable(&state, "/webhooks/subscribe")?;
        state.subscriptions.push(callback_url.to_string());
        Ok(SubscriptionAck {
            id: Some(format!("sub-{}", state.subscriptions.len())),
        })
    }
}
