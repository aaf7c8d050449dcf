//! Materializer - Turns snapshot payloads into fiber records
//!
//! Every write is derived from the immutable snapshot payload, so running
//! the same snapshot twice, or two snapshots out of order, converges on the
//! same fiber records.

use crate::error::{MaterializeError, StoreError};
use crate::store::{FiberRecord, IndexerStore, MaterializationCounts, SnapshotStatus};
use ledger_bridge::LedgerClient;
use ledger_types::{FiberState, Ordinal, PayloadMode, SnapshotPayload};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Materializes indexed snapshots into the fiber table
pub struct Materializer {
    store: IndexerStore,
    ledger: Arc<dyn LedgerClient>,
}

impl Materializer {
    pub fn new(store: IndexerStore, ledger: Arc<dyn LedgerClient>) -> Self {
        Self { store, ledger }
    }

    /// Fetch the payload of an indexed snapshot and apply it
    ///
    /// On any error the snapshot row is left without counters so a later
    /// sweep picks it up again.
    pub async fn materialize(
        &self,
        ordinal: Ordinal,
        hash: &str,
    ) -> Result<MaterializationCounts, MaterializeError> {
        let row = self
            .store
            .get_snapshot(ordinal, hash)?
            .ok_or_else(|| MaterializeError::NotIndexed {
                ordinal,
                hash: hash.to_string(),
            })?;

        if row.status == SnapshotStatus::Orphaned {
            return Err(MaterializeError::Orphaned {
                ordinal,
                hash: hash.to_string(),
            });
        }

        let payload = self.ledger.snapshot_state(ordinal).await?;
        if payload.hash != hash {
            return Err(MaterializeError::HashMismatch {
                ordinal,
                expected: hash.to_string(),
                actual: payload.hash,
            });
        }

        let counts = apply_payload(&self.store, &payload)?;
        self.store.record_materialization(ordinal, hash, counts)?;

        tracing::debug!(
            "Materialized snapshot {}: {} fibers ({} agents, {} contracts)",
            ordinal,
            counts.fibers_updated,
            counts.agents_updated,
            counts.contracts_updated
        );

        Ok(counts)
    }
}

/// Apply every fiber entry of a payload to the store
pub fn apply_payload(
    store: &IndexerStore,
    payload: &SnapshotPayload,
) -> Result<MaterializationCounts, StoreError> {
    let mut counts = MaterializationCounts::default();

    for state in &payload.fibers {
        let applied = store.update_fiber(&state.fiber_id, |existing| {
            apply_fiber(existing, state, payload.ordinal, payload.mode)
        })?;

        if let Some(record) = applied {
            counts.fibers_updated += 1;
            match record.fiber_kind.as_deref().map(str::to_ascii_lowercase).as_deref() {
                Some("agent") => counts.agents_updated += 1,
                Some("contract") => counts.contracts_updated += 1,
                _ => {}
            }
        }
    }

    Ok(counts)
}

/// New record for `existing` after applying `state` observed at `ordinal`
///
/// Returns `None` when the stored record is newer than the entry.
pub fn apply_fiber(
    existing: Option<FiberRecord>,
    state: &FiberState,
    ordinal: Ordinal,
    mode: PayloadMode,
) -> Option<FiberRecord> {
    if let Some(current) = &existing {
        if (state.sequence_number, ordinal) < (current.sequence_number, current.last_observed_ordinal)
        {
            return None;
        }
    }

    let mut record = existing.unwrap_or_else(|| FiberRecord {
        fiber_id: state.fiber_id.clone(),
        sequence_number: 0,
        current_state_label: None,
        owner_addresses: BTreeSet::new(),
        state_data: Value::Null,
        last_observed_ordinal: 0,
        fiber_kind: None,
    });

    match mode {
        PayloadMode::Full => {
            record.current_state_label = state.current_state.clone();
            record.owner_addresses = state.owners.clone().unwrap_or_default();
            record.state_data = state.state_data.clone().unwrap_or(Value::Null);
            record.fiber_kind = state.kind.clone();
        }
        PayloadMode::Diff => {
            if let Some(label) = &state.current_state {
                record.current_state_label = Some(label.clone());
            }
            if let Some(owners) = &state.owners {
                record.owner_addresses = owners.clone();
            }
            if let Some(patch) = &state.state_data {
                merge_patch(&mut record.state_data, patch);
            }
            if let Some(kind) = &state.kind {
                record.fiber_kind = Some(kind.clone());
            }
        }
    }

    record.sequence_number = state.sequence_number;
    record.last_observed_ordinal = ordinal;
    Some(record)
}

/// JSON merge patch (RFC 7386)
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IndexedSnapshot, IngestSource, Resolution};
    use ledger_bridge::memory::InMemoryLedger;
    use ledger_types::SnapshotStats;
    use serde_json::json;

    fn fiber(id: &str, seq: u64, kind: &str, data: Value) -> FiberState {
        FiberState {
            fiber_id: id.to_string(),
            sequence_number: seq,
            current_state: Some(format!("state-{}", seq)),
            owners: Some(["DAG1".to_string()].into_iter().collect()),
            state_data: Some(data),
            kind: Some(kind.to_string()),
        }
    }

    fn payload(ordinal: Ordinal, hash: &str, fibers: Vec<FiberState>) -> SnapshotPayload {
        SnapshotPayload {
            ordinal,
            hash: hash.to_string(),
            mode: PayloadMode::Full,
            fibers,
        }
    }

    fn setup() -> (IndexerStore, Arc<InMemoryLedger>, Materializer) {
        let store = IndexerStore::temporary().unwrap();
        let ledger = Arc::new(InMemoryLedger::new("node-0"));
        let materializer = Materializer::new(store.clone(), ledger.clone());
        (store, ledger, materializer)
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

    #[test]
    fn test_merge_patch() {
        let mut target = json!({ "a": 1, "b": { "c": 2, "d": 3 } });
        merge_patch(&mut target, &json!({ "a": null, "b": { "c": 5 }, "e": [1] }));
        assert_eq!(target, json!({ "b": { "c": 5, "d": 3 }, "e": [1] }));

        let mut scalar = json!(4);
        merge_patch(&mut scalar, &json!({ "x": 1 }));
        assert_eq!(scalar, json!({ "x": 1 }));
    }

    #[tokio::test]
    async fn test_materialize_full_payload() {
        let (store, ledger, materializer) = setup();
        index(&store, 100, "h100");
        ledger.publish_snapshot(payload(
            100,
            "h100",
            vec![
                fiber("agent-1", 1, "agent", json!({ "reputation": 10 })),
                fiber("contract-1", 3, "contract", json!({ "status": "open" })),
                fiber("market-1", 2, "market", json!({})),
            ],
        ));

        let counts = materializer.materialize(100, "h100").await.unwrap();
        assert_eq!(
            counts,
            MaterializationCounts {
                fibers_updated: 3,
                agents_updated: 1,
                contracts_updated: 1,
            }
        );

        let agent = store.get_fiber("agent-1").unwrap().unwrap();
        assert_eq!(agent.sequence_number, 1);
        assert_eq!(agent.current_state_label.as_deref(), Some("state-1"));
        assert_eq!(agent.last_observed_ordinal, 100);
        assert_eq!(agent.state_data, json!({ "reputation": 10 }));

        let row = store.get_snapshot(100, "h100").unwrap().unwrap();
        assert_eq!(row.materialization, Some(counts));
        assert_eq!(row.status, SnapshotStatus::Pending);
    }

    #[tokio::test]
    async fn test_materialize_twice_is_idempotent() {
        let (store, ledger, materializer) = setup();
        index(&store, 7, "h7");
        ledger.publish_snapshot(payload(7, "h7", vec![fiber("agent-1", 2, "agent", json!({ "n": 1 }))]));

        let first = materializer.materialize(7, "h7").await.unwrap();
        let after_first = store.get_fiber("agent-1").unwrap();
        let second = materializer.materialize(7, "h7").await.unwrap();
        let after_second = store.get_fiber("agent-1").unwrap();

        assert_eq!(first, second);
        assert_eq!(after_first, after_second);
        assert_eq!(store.fiber_count(), 1);
    }

    #[tokio::test]
    async fn test_older_snapshot_never_regresses_fiber() {
        let (store, ledger, materializer) = setup();
        index(&store, 10, "h10");
        index(&store, 11, "h11");
        ledger.publish_snapshot(payload(10, "h10", vec![fiber("agent-1", 4, "agent", json!({ "v": 4 }))]));
        ledger.publish_snapshot(payload(11, "h11", vec![fiber("agent-1", 5, "agent", json!({ "v": 5 }))]));

        materializer.materialize(11, "h11").await.unwrap();
        let stale = materializer.materialize(10, "h10").await.unwrap();

        assert_eq!(stale.fibers_updated, 0);
        let record = store.get_fiber("agent-1").unwrap().unwrap();
        assert_eq!(record.sequence_number, 5);
        assert_eq!(record.state_data, json!({ "v": 5 }));
    }

    #[tokio::test]
    async fn test_diff_payload_patches_state() {
        let (store, ledger, materializer) = setup();
        index(&store, 20, "h20");
        index(&store, 21, "h21");
        ledger.publish_snapshot(payload(
            20,
            "h20",
            vec![fiber("contract-1", 1, "contract", json!({ "status": "open", "parties": 2 }))],
        ));
        ledger.publish_snapshot(SnapshotPayload {
            ordinal: 21,
            hash: "h21".to_string(),
            mode: PayloadMode::Diff,
            fibers: vec![FiberState {
                fiber_id: "contract-1".to_string(),
                sequence_number: 2,
                current_state: Some("signed".to_string()),
                owners: None,
                state_data: Some(json!({ "status": "signed" })),
                kind: None,
            }],
        });

        materializer.materialize(20, "h20").await.unwrap();
        let counts = materializer.materialize(21, "h21").await.unwrap();
        assert_eq!(counts.contracts_updated, 1);

        let record = store.get_fiber("contract-1").unwrap().unwrap();
        assert_eq!(record.sequence_number, 2);
        assert_eq!(record.current_state_label.as_deref(), Some("signed"));
        assert_eq!(record.state_data, json!({ "status": "signed", "parties": 2 }));
        assert_eq!(record.owner_addresses.len(), 1);
    }

    #[tokio::test]
    async fn test_hash_mismatch_leaves_row_unmaterialized() {
        let (store, ledger, materializer) = setup();
        index(&store, 30, "ours");
        ledger.publish_snapshot(payload(30, "theirs", vec![fiber("agent-1", 1, "agent", json!({}))]));

        let result = materializer.materialize(30, "ours").await;
        assert!(matches!(result, Err(MaterializeError::HashMismatch { .. })));
        assert!(store.get_fiber("agent-1").unwrap().is_none());
        assert_eq!(store.unmaterialized(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_ledger_leaves_row_unmaterialized() {
        let (store, ledger, materializer) = setup();
        index(&store, 31, "h31");
        ledger.set_unreachable(true);

        assert!(matches!(
            materializer.materialize(31, "h31").await,
            Err(MaterializeError::Ledger(_))
        ));
        let row = store.get_snapshot(31, "h31").unwrap().unwrap();
        assert!(row.materialization.is_none());
        assert_eq!(row.status, SnapshotStatus::Pending);
    }

    #[tokio::test]
    async fn test_orphaned_and_unknown_snapshots_are_skipped() {
        let (store, ledger, materializer) = setup();
        index(&store, 40, "lost");
        store.resolve(40, "lost", Resolution::Orphaned).unwrap();

        assert!(matches!(
            materializer.materialize(40, "lost").await,
            Err(MaterializeError::Orphaned { .. })
        ));
        assert!(matches!(
            materializer.materialize(41, "nope").await,
            Err(MaterializeError::NotIndexed { .. })
        ));
        assert_eq!(ledger.state_reads(), 0);
    }
}
