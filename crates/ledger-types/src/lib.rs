//! Shared wire types for the metagraph ledger
//!
//! This crate mirrors the JSON documents exchanged with the ledger node:
//! webhook notifications it pushes to us, the checkpoint and snapshot
//! listings we poll, the on-chain commit index, and signed updates we submit.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

/// Identifier of a state machine instance on the ledger
pub type FiberId = String;

/// Snapshot height on the ledger
pub type Ordinal = u64;

/// Event name for finalized snapshot notifications
pub const SNAPSHOT_FINALIZED: &str = "snapshot.finalized";

/// Event name for rejected transaction notifications
pub const TRANSACTION_REJECTED: &str = "transaction.rejected";

// ============ Webhook Notifications ============

/// Counters the ledger attaches to a finalized snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotStats {
    pub updates_processed: u64,
    pub state_machines_active: u64,
    pub scripts_active: u64,
}

/// A finalized snapshot pushed by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotNotification {
    pub ordinal: Ordinal,
    pub hash: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub stats: SnapshotStats,
}

/// One error reported for a rejected update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionError {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A transaction the ledger refused to apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub update_type: String,
    pub fiber_id: FiberId,
    pub update_hash: String,
    #[serde(default)]
    pub errors: Vec<RejectionError>,
    #[serde(default)]
    pub signers: Vec<String>,
}

impl Rejection {
    /// Error codes in the order the ledger reported them
    pub fn error_codes(&self) -> impl Iterator<Item = &str> {
        self.errors.iter().map(|e| e.code.as_str())
    }
}

/// Rejection notification pushed by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionNotification {
    pub ordinal: Ordinal,
    #[serde(default)]
    pub timestamp: Option<String>,
    pub rejection: Rejection,
}

/// Everything the ledger may post to the webhook endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum WebhookEvent {
    #[serde(rename = "snapshot.finalized")]
    SnapshotFinalized(SnapshotNotification),
    #[serde(rename = "transaction.rejected")]
    TransactionRejected(RejectionNotification),
}

impl WebhookEvent {
    /// Parse a webhook body. Bodies without an `event` field are snapshot notifications.
    pub fn from_value(mut value: Value) -> Result<Self, serde_json::Error> {
        if let Value::Object(ref mut map) = value {
            map.entry("event")
                .or_insert_with(|| Value::String(SNAPSHOT_FINALIZED.to_string()));
        }
        serde_json::from_value(value)
    }
}

// ============ Checkpoint Layer ============

/// Latest confirmed frontier of the checkpoint layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub ordinal: Ordinal,
    pub state_digest: String,
}

/// The snapshot the checkpoint layer accepted at one height
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord {
    pub ordinal: Ordinal,
    pub hash: String,
    /// Ordinal of the checkpoint that sealed this snapshot, when reported
    #[serde(default)]
    pub checkpoint_ordinal: Option<Ordinal>,
}

// ============ Snapshots ============

/// Snapshot header as listed by a ledger peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    pub ordinal: Ordinal,
    pub hash: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// How a snapshot payload describes fiber state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadMode {
    /// Every listed fiber carries its complete state
    #[default]
    Full,
    /// Listed fibers carry only what changed; `stateData` is a merge patch
    Diff,
}

/// State of one fiber inside a snapshot payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FiberState {
    pub fiber_id: FiberId,
    pub sequence_number: u64,
    #[serde(default)]
    pub current_state: Option<String>,
    #[serde(default)]
    pub owners: Option<BTreeSet<String>>,
    #[serde(default)]
    pub state_data: Option<Value>,
    /// Workflow family (agent, contract, market, ...)
    #[serde(default)]
    pub kind: Option<String>,
}

/// State payload of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    pub ordinal: Ordinal,
    pub hash: String,
    #[serde(default)]
    pub mode: PayloadMode,
    #[serde(default)]
    pub fibers: Vec<FiberState>,
}

// ============ Fibers ============

/// Commit position of one fiber in the on-chain index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FiberCommit {
    pub sequence_number: u64,
}

/// Authoritative commit index maintained by the ledger's data layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnChainState {
    #[serde(default)]
    pub fiber_commits: HashMap<FiberId, FiberCommit>,
}

impl OnChainState {
    /// Committed sequence number of a fiber, if the index knows it
    pub fn sequence_of(&self, fiber_id: &str) -> Option<u64> {
        self.fiber_commits.get(fiber_id).map(|c| c.sequence_number)
    }
}

/// Query-layer view of a single fiber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FiberSnapshot {
    pub fiber_id: FiberId,
    pub sequence_number: u64,
    #[serde(default)]
    pub current_state: Option<String>,
    #[serde(default)]
    pub owners: BTreeSet<String>,
    #[serde(default)]
    pub state_data: Value,
}

// ============ Writes ============

/// Signature over an update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureProof {
    pub id: String,
    pub signature: String,
}

/// Signed transition submitted to `POST /data`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedUpdate {
    pub value: Value,
    #[serde(default)]
    pub proofs: Vec<SignatureProof>,
}

/// Response to a submitted update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub hash: String,
}

/// Webhook registration request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSubscription {
    pub callback_url: String,
}

/// Webhook registration acknowledgement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionAck {
    #[serde(default)]
    pub id: Option<String>,
}
