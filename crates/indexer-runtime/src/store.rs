//! Indexer Store - Durable snapshot and fiber tables
//!
//! Uses the sled embedded database. Every mutation is either an
//! insert-if-absent or a compare-and-swap on a single row, so the webhook
//! path, the materializer pool and both pollers can write concurrently
//! without a global lock.
//!
//! Snapshot rows are keyed by big-endian ordinal followed by the hash, which
//! keeps competing snapshots at the same height side by side and makes key
//! order equal ordinal order.
//!
//! The `pending` and `unmaterialized` trees hold the keys of rows in those
//! states, and `meta` holds a counter per status. Both are written in the same
//! transaction as the row, so pollers and `/status` never scan the full
//! snapshot table.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use ledger_types::{FiberId, Ordinal, SnapshotStats};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::{Db, IVec, Transactional, Tree};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

const LAST_CONFIRMED_KEY: &[u8] = b"last_confirmed_ordinal";
const BACKFILL_WATERMARK_KEY: &[u8] = b"backfill_watermark";

/// Value of index entries; the key is all that matters
const INDEX_MARKER: &[u8] = &[];

/// Lifecycle of an indexed snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotStatus {
    Pending,
    Confirmed,
    Orphaned,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Pending => "PENDING",
            SnapshotStatus::Confirmed => "CONFIRMED",
            SnapshotStatus::Orphaned => "ORPHANED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SnapshotStatus::Pending)
    }

    fn counter_key(&self) -> &'static [u8] {
        match self {
            SnapshotStatus::Pending => b"count_pending",
            SnapshotStatus::Confirmed => b"count_confirmed",
            SnapshotStatus::Orphaned => b"count_orphaned",
        }
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(SnapshotStatus::Pending),
            "CONFIRMED" => Ok(SnapshotStatus::Confirmed),
            "ORPHANED" => Ok(SnapshotStatus::Orphaned),
            other => Err(format!("unknown snapshot status: {}", other)),
        }
    }
}

/// Who created a snapshot row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestSource {
    Webhook,
    Fallback,
}

/// Counters produced by materializing one snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializationCounts {
    pub fibers_updated: u64,
    pub agents_updated: u64,
    pub contracts_updated: u64,
}

/// Snapshot metadata row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedSnapshot {
    pub ordinal: Ordinal,
    pub hash: String,
    pub status: SnapshotStatus,
    pub parent_checkpoint_ordinal: Option<Ordinal>,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub orphaned_at: Option<DateTime<Utc>>,
    pub source: IngestSource,
    /// Timestamp the ledger attached to the snapshot
    pub ledger_timestamp: Option<String>,
    pub stats: SnapshotStats,
    /// Present once the snapshot has been materialized
    pub materialization: Option<MaterializationCounts>,
    pub materialized_at: Option<DateTime<Utc>>,
}

impl IndexedSnapshot {
    /// New PENDING row
    pub fn pending(
        ordinal: Ordinal,
        hash: &str,
        source: IngestSource,
        ledger_timestamp: Option<String>,
        stats: SnapshotStats,
    ) -> Self {
        Self {
            ordinal,
            hash: hash.to_string(),
            status: SnapshotStatus::Pending,
            parent_checkpoint_ordinal: None,
            created_at: Utc::now(),
            confirmed_at: None,
            orphaned_at: None,
            source,
            ledger_timestamp,
            stats,
            materialization: None,
            materialized_at: None,
        }
    }

    /// Whether the materializer still owes this snapshot a pass
    pub fn needs_materialization(&self) -> bool {
        self.status != SnapshotStatus::Orphaned && self.materialization.is_none()
    }
}

/// Materialized state of one fiber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FiberRecord {
    pub fiber_id: FiberId,
    pub sequence_number: u64,
    pub current_state_label: Option<String>,
    pub owner_addresses: BTreeSet<String>,
    pub state_data: Value,
    pub last_observed_ordinal: Ordinal,
    pub fiber_kind: Option<String>,
}

/// Result of a PENDING insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// First row at this ordinal
    Inserted,
    /// Inserted next to rows with these other hashes at the same ordinal
    Competing(Vec<String>),
    /// Same ordinal and hash already present; nothing written
    AlreadyIndexed,
}

impl InsertOutcome {
    pub fn is_new(&self) -> bool {
        !matches!(self, InsertOutcome::AlreadyIndexed)
    }
}

/// Terminal decision for a PENDING snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Confirmed { parent_checkpoint_ordinal: Ordinal },
    Orphaned,
}

/// Number of rows per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub pending: u64,
    pub confirmed: u64,
    pub orphaned: u64,
}

/// Durable storage for the indexer
#[derive(Clone)]
pub struct IndexerStore {
    /// Sled database instance
    db: Db,
    /// Snapshot rows
    snapshots: Tree,
    /// Keys of PENDING rows
    pending: Tree,
    /// Keys of rows still owed a materialization pass
    unmaterialized: Tree,
    /// Fiber records
    fibers: Tree,
    /// Aggregate markers
    meta: Tree,
}

impl IndexerStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(&path)?;
        tracing::info!("Opened indexer store at {:?}", path.as_ref());
        Self::from_db(db)
    }

    /// Store that lives only as long as the process (for tests)
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, StoreError> {
        Ok(Self {
            snapshots: db.open_tree("snapshots")?,
            pending: db.open_tree("snapshots_pending")?,
            unmaterialized: db.open_tree("snapshots_unmaterialized")?,
            fibers: db.open_tree("fibers")?,
            meta: db.open_tree("meta")?,
            db,
        })
    }

    /// Underlying database, shared with the rejection ledger
    pub fn db(&self) -> &Db {
        &self.db
    }

    // ============ Snapshots ============

    /// Insert a PENDING row unless the same ordinal and hash is already indexed
    pub fn insert_pending(&self, snapshot: IndexedSnapshot) -> Result<InsertOutcome, StoreError> {
        let key = snapshot_key(snapshot.ordinal, &snapshot.hash);
        let bytes = encode(&snapshot)?;
        let needs_materialization = snapshot.needs_materialization();
        let status = snapshot.status;

        let inserted = run_transaction(
            (&self.snapshots, &self.pending, &self.unmaterialized, &self.meta).transaction(
                |(snapshots, pending, unmaterialized, meta)| -> ConflictableTransactionResult<bool, StoreError> {
                    if snapshots.get(key.as_slice())?.is_some() {
                        return Ok(false);
                    }
                    snapshots.insert(key.as_slice(), bytes.as_slice())?;
                    if status == SnapshotStatus::Pending {
                        pending.insert(key.as_slice(), INDEX_MARKER)?;
                    }
                    if needs_materialization {
                        unmaterialized.insert(key.as_slice(), INDEX_MARKER)?;
                    }
                    adjust_counter(meta, status.counter_key(), true)?;
                    Ok(true)
                },
            ),
        )?;
        if !inserted {
            return Ok(InsertOutcome::AlreadyIndexed);
        }

        let competing: Vec<String> = self
            .snapshots_at(snapshot.ordinal)?
            .into_iter()
            .filter(|row| row.hash != snapshot.hash)
            .map(|row| row.hash)
            .collect();

        if competing.is_empty() {
            Ok(InsertOutcome::Inserted)
        } else {
            Ok(InsertOutcome::Competing(competing))
        }
    }

    /// Get one snapshot row
    pub fn get_snapshot(
        &self,
        ordinal: Ordinal,
        hash: &str,
    ) -> Result<Option<IndexedSnapshot>, StoreError> {
        match self.snapshots.get(snapshot_key(ordinal, hash))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All rows at one ordinal
    pub fn snapshots_at(&self, ordinal: Ordinal) -> Result<Vec<IndexedSnapshot>, StoreError> {
        self.snapshots
            .scan_prefix(ordinal.to_be_bytes())
            .map(|entry| {
                let (_, value) = entry?;
                decode(&value)
            })
            .collect()
    }

    /// Whether any row exists at this ordinal
    pub fn has_ordinal(&self, ordinal: Ordinal) -> Result<bool, StoreError> {
        Ok(self
            .snapshots
            .scan_prefix(ordinal.to_be_bytes())
            .next()
            .transpose()?
            .is_some())
    }

    /// PENDING rows at or below `frontier`, lowest ordinal first
    pub fn pending_up_to(&self, frontier: Ordinal) -> Result<Vec<IndexedSnapshot>, StoreError> {
        let mut pending = Vec::new();
        for entry in self.pending.iter() {
            let (key, _) = entry?;
            if key_ordinal(&key) > frontier {
                break;
            }
            if let Some(row) = self.indexed_row(&key)? {
                if row.status == SnapshotStatus::Pending {
                    pending.push(row);
                }
            }
        }
        Ok(pending)
    }

    /// Rows still owed a materialization pass, lowest ordinal first
    pub fn unmaterialized(&self, limit: usize) -> Result<Vec<IndexedSnapshot>, StoreError> {
        let mut rows = Vec::new();
        for entry in self.unmaterialized.iter() {
            if rows.len() >= limit {
                break;
            }
            let (key, _) = entry?;
            if let Some(row) = self.indexed_row(&key)? {
                if row.needs_materialization() {
                    rows.push(row);
                }
            }
        }
        Ok(rows)
    }

    fn indexed_row(&self, key: &[u8]) -> Result<Option<IndexedSnapshot>, StoreError> {
        match self.snapshots.get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Newest rows first, optionally filtered by status
    pub fn list_snapshots(
        &self,
        status: Option<SnapshotStatus>,
        limit: usize,
    ) -> Result<Vec<IndexedSnapshot>, StoreError> {
        let mut rows = Vec::new();
        for entry in self.snapshots.iter().rev() {
            if rows.len() >= limit {
                break;
            }
            let (_, value) = entry?;
            let row: IndexedSnapshot = decode(&value)?;
            if status.map_or(true, |s| s == row.status) {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Move a PENDING row to a terminal status
    ///
    /// Returns false when the row is missing or no longer PENDING, which is
    /// how a concurrent poller that got there first is detected.
    pub fn resolve(
        &self,
        ordinal: Ordinal,
        hash: &str,
        resolution: Resolution,
    ) -> Result<bool, StoreError> {
        let key = snapshot_key(ordinal, hash);
        run_transaction(
            (&self.snapshots, &self.pending, &self.unmaterialized, &self.meta).transaction(
                |(snapshots, pending, unmaterialized, meta)| -> ConflictableTransactionResult<bool, StoreError> {
                    let Some(bytes) = snapshots.get(key.as_slice())? else {
                        return Ok(false);
                    };
                    let mut row: IndexedSnapshot = decode(&bytes).map_err(abort)?;
                    if row.status != SnapshotStatus::Pending {
                        return Ok(false);
                    }
                    match resolution {
                        Resolution::Confirmed {
                            parent_checkpoint_ordinal,
                        } => {
                            row.status = SnapshotStatus::Confirmed;
                            row.parent_checkpoint_ordinal = Some(parent_checkpoint_ordinal);
                            row.confirmed_at = Some(Utc::now());
                            let last = meta
                                .get(LAST_CONFIRMED_KEY)?
                                .and_then(|v| decode_u64(&v))
                                .unwrap_or(0);
                            meta.insert(LAST_CONFIRMED_KEY, &last.max(ordinal).to_be_bytes()[..])?;
                        }
                        Resolution::Orphaned => {
                            row.status = SnapshotStatus::Orphaned;
                            row.orphaned_at = Some(Utc::now());
                            unmaterialized.remove(key.as_slice())?;
                        }
                    }

                    snapshots.insert(key.as_slice(), encode(&row).map_err(abort)?)?;
                    pending.remove(key.as_slice())?;
                    adjust_counter(meta, SnapshotStatus::Pending.counter_key(), false)?;
                    adjust_counter(meta, row.status.counter_key(), true)?;
                    Ok(true)
                },
            ),
        )
    }

    /// Attach materialization counters without touching the status
    pub fn record_materialization(
        &self,
        ordinal: Ordinal,
        hash: &str,
        counts: MaterializationCounts,
    ) -> Result<bool, StoreError> {
        let key = snapshot_key(ordinal, hash);
        run_transaction((&self.snapshots, &self.unmaterialized).transaction(
            |(snapshots, unmaterialized)| -> ConflictableTransactionResult<bool, StoreError> {
                let Some(bytes) = snapshots.get(key.as_slice())? else {
                    return Ok(false);
                };
                let mut row: IndexedSnapshot = decode(&bytes).map_err(abort)?;
                row.materialization = Some(counts);
                row.materialized_at = Some(Utc::now());
                snapshots.insert(key.as_slice(), encode(&row).map_err(abort)?)?;
                unmaterialized.remove(key.as_slice())?;
                Ok(true)
            },
        ))
    }

    /// Highest ordinal with any row
    pub fn last_indexed_ordinal(&self) -> Result<Option<Ordinal>, StoreError> {
        Ok(self.snapshots.last()?.map(|(key, _)| key_ordinal(&key)))
    }

    /// Highest ordinal ever confirmed
    pub fn last_confirmed_ordinal(&self) -> Result<Option<Ordinal>, StoreError> {
        Ok(self.meta.get(LAST_CONFIRMED_KEY)?.and_then(|v| decode_u64(&v)))
    }

    /// Lowest ordinal with any row
    pub fn first_indexed_ordinal(&self) -> Result<Option<Ordinal>, StoreError> {
        Ok(self.snapshots.first()?.map(|(key, _)| key_ordinal(&key)))
    }

    /// Highest ordinal the fallback poller has settled: every ordinal from
    /// where it started up to here has a row or is unknown to the node
    pub fn backfill_watermark(&self) -> Result<Option<Ordinal>, StoreError> {
        Ok(self.meta.get(BACKFILL_WATERMARK_KEY)?.and_then(|v| decode_u64(&v)))
    }

    /// Raise the backfill watermark; never lowers it
    pub fn advance_backfill_watermark(&self, ordinal: Ordinal) -> Result<(), StoreError> {
        self.meta.fetch_and_update(BACKFILL_WATERMARK_KEY, |old| {
            let next = old.and_then(decode_u64).map_or(ordinal, |w| w.max(ordinal));
            Some(next.to_be_bytes().to_vec())
        })?;
        Ok(())
    }

    /// Row count per status
    pub fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let count = |status: SnapshotStatus| -> Result<u64, StoreError> {
            Ok(self
                .meta
                .get(status.counter_key())?
                .and_then(|v| decode_u64(&v))
                .unwrap_or(0))
        };
        Ok(StatusCounts {
            pending: count(SnapshotStatus::Pending)?,
            confirmed: count(SnapshotStatus::Confirmed)?,
            orphaned: count(SnapshotStatus::Orphaned)?,
        })
    }

    // ============ Fibers ============

    /// Get a fiber record
    pub fn get_fiber(&self, fiber_id: &str) -> Result<Option<FiberRecord>, StoreError> {
        match self.fibers.get(fiber_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Atomically replace a fiber record with the result of `f`
    ///
    /// `f` may run more than once under contention and must be pure. Returning
    /// `None` leaves the record untouched.
    pub fn update_fiber<F>(&self, fiber_id: &str, f: F) -> Result<Option<FiberRecord>, StoreError>
    where
        F: FnMut(Option<FiberRecord>) -> Option<FiberRecord>,
    {
        cas_update(&self.fibers, fiber_id.as_bytes(), f)
    }

    /// Number of materialized fibers
    pub fn fiber_count(&self) -> usize {
        self.fibers.len()
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<usize, StoreError> {
        Ok(self.db.flush()?)
    }
}

fn snapshot_key(ordinal: Ordinal, hash: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + hash.len());
    key.extend_from_slice(&ordinal.to_be_bytes());
    key.extend_from_slice(hash.as_bytes());
    key
}

fn key_ordinal(key: &[u8]) -> Ordinal {
    let mut bytes = [0u8; 8];
    let len = key.len().min(8);
    bytes[..len].copy_from_slice(&key[..len]);
    Ordinal::from_be_bytes(bytes)
}

fn decode_u64(bytes: &[u8]) -> Option<u64> {
    let arr: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(arr))
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

fn abort(error: StoreError) -> ConflictableTransactionError<StoreError> {
    ConflictableTransactionError::Abort(error)
}

fn run_transaction<T>(result: Result<T, TransactionError<StoreError>>) -> Result<T, StoreError> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Storage(e)) => Err(StoreError::Sled(e)),
        Err(TransactionError::Abort(e)) => Err(e),
    }
}

fn adjust_counter(
    meta: &TransactionalTree,
    key: &[u8],
    increment: bool,
) -> ConflictableTransactionResult<(), StoreError> {
    let current = meta.get(key)?.and_then(|v| decode_u64(&v)).unwrap_or(0);
    let next = if increment {
        current.saturating_add(1)
    } else {
        current.saturating_sub(1)
    };
    meta.insert(key, &next.to_be_bytes()[..])?;
    Ok(())
}

/// Compare-and-swap loop over one row
///
/// Returns the written value, or `None` when `f` declined to write.
fn cas_update<T, F>(tree: &Tree, key: &[u8], mut f: F) -> Result<Option<T>, StoreError>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(Option<T>) -> Option<T>,
{
    loop {
        let current: Option<IVec> = tree.get(key)?;
        let decoded = match &current {
            Some(bytes) => Some(decode::<T>(bytes)?),
            None => None,
        };
        let Some(next) = f(decoded) else {
            return Ok(None);
        };
        let bytes = encode(&next)?;
        if tree.compare_and_swap(key, current, Some(bytes))?.is_ok() {
            return Ok(Some(next));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pending(ordinal: Ordinal, hash: &str) -> IndexedSnapshot {
        IndexedSnapshot::pending(
            ordinal,
            hash,
            IngestSource::Webhook,
            None,
            SnapshotStats::default(),
        )
    }

    #[test]
    fn test_insert_is_idempotent() {
        let store = IndexerStore::temporary().unwrap();

        assert_eq!(store.insert_pending(pending(10, "aa")).unwrap(), InsertOutcome::Inserted);
        assert_eq!(
            store.insert_pending(pending(10, "aa")).unwrap(),
            InsertOutcome::AlreadyIndexed
        );
        assert_eq!(store.snapshots_at(10).unwrap().len(), 1);
    }

    #[test]
    fn test_competing_hash_gets_second_row() {
        let store = IndexerStore::temporary().unwrap();
        store.insert_pending(pending(10, "aa")).unwrap();

        let outcome = store.insert_pending(pending(10, "bb")).unwrap();
        assert_eq!(outcome, InsertOutcome::Competing(vec!["aa".to_string()]));
        assert_eq!(store.snapshots_at(10).unwrap().len(), 2);
        assert!(store.snapshots_at(11).unwrap().is_empty());
    }

    #[test]
    fn test_resolve_only_from_pending() {
        let store = IndexerStore::temporary().unwrap();
        store.insert_pending(pending(5, "aa")).unwrap();

        let confirmed = Resolution::Confirmed {
            parent_checkpoint_ordinal: 7,
        };
        assert!(store.resolve(5, "aa", confirmed).unwrap());
        // Terminal rows never move again
        assert!(!store.resolve(5, "aa", Resolution::Orphaned).unwrap());
        assert!(!store.resolve(5, "aa", confirmed).unwrap());
        assert!(!store.resolve(6, "missing", confirmed).unwrap());

        let row = store.get_snapshot(5, "aa").unwrap().unwrap();
        assert_eq!(row.status, SnapshotStatus::Confirmed);
        assert_eq!(row.parent_checkpoint_ordinal, Some(7));
        assert!(row.confirmed_at.is_some());
        assert_eq!(store.last_confirmed_ordinal().unwrap(), Some(5));
    }

    #[test]
    fn test_pending_up_to_respects_frontier() {
        let store = IndexerStore::temporary().unwrap();
        for ordinal in [1, 2, 255, 256, 300] {
            store.insert_pending(pending(ordinal, "h")).unwrap();
        }
        store
            .resolve(2, "h", Resolution::Confirmed { parent_checkpoint_ordinal: 2 })
            .unwrap();

        let ordinals: Vec<_> = store
            .pending_up_to(256)
            .unwrap()
            .into_iter()
            .map(|r| r.ordinal)
            .collect();
        assert_eq!(ordinals, vec![1, 255, 256]);
        assert_eq!(store.last_indexed_ordinal().unwrap(), Some(300));
    }

    #[test]
    fn test_materialization_counters_keep_status() {
        let store = IndexerStore::temporary().unwrap();
        store.insert_pending(pending(3, "aa")).unwrap();
        assert_eq!(store.unmaterialized(10).unwrap().len(), 1);

        let counts = MaterializationCounts {
            fibers_updated: 4,
            agents_updated: 1,
            contracts_updated: 2,
        };
        assert!(store.record_materialization(3, "aa", counts).unwrap());

        let row = store.get_snapshot(3, "aa").unwrap().unwrap();
        assert_eq!(row.status, SnapshotStatus::Pending);
        assert_eq!(row.materialization, Some(counts));
        assert!(store.unmaterialized(10).unwrap().is_empty());
    }

    #[test]
    fn test_list_and_counts() {
        let store = IndexerStore::temporary().unwrap();
        store.insert_pending(pending(1, "a")).unwrap();
        store.insert_pending(pending(2, "b")).unwrap();
        store.insert_pending(pending(2, "c")).unwrap();
        store.resolve(2, "b", Resolution::Confirmed { parent_checkpoint_ordinal: 2 }).unwrap();
        store.resolve(2, "c", Resolution::Orphaned).unwrap();

        let counts = store.status_counts().unwrap();
        assert_eq!(counts, StatusCounts { pending: 1, confirmed: 1, orphaned: 1 });

        let newest = store.list_snapshots(None, 2).unwrap();
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].ordinal, 2);

        let orphaned = store.list_snapshots(Some(SnapshotStatus::Orphaned), 10).unwrap();
        assert_eq!(orphaned.len(), 1);
        assert_eq!(orphaned[0].hash, "c");
        // Orphaned rows are never materialized
        assert!(store.unmaterialized(10).unwrap().iter().all(|r| r.hash != "c"));
    }

    #[test]
    fn test_indexes_follow_row_state() {
        let store = IndexerStore::temporary().unwrap();
        for ordinal in 1..=3 {
            store.insert_pending(pending(ordinal, "h")).unwrap();
        }
        store
            .record_materialization(1, "h", MaterializationCounts::default())
            .unwrap();
        store.resolve(2, "h", Resolution::Orphaned).unwrap();
        store
            .resolve(3, "h", Resolution::Confirmed { parent_checkpoint_ordinal: 3 })
            .unwrap();

        let pending_ordinals: Vec<_> =
            store.pending_up_to(10).unwrap().into_iter().map(|r| r.ordinal).collect();
        assert_eq!(pending_ordinals, vec![1]);
        let owed: Vec<_> = store.unmaterialized(10).unwrap().into_iter().map(|r| r.ordinal).collect();
        assert_eq!(owed, vec![3]);

        // A duplicate insert leaves the counters alone
        assert_eq!(store.insert_pending(pending(1, "h")).unwrap(), InsertOutcome::AlreadyIndexed);
        assert_eq!(
            store.status_counts().unwrap(),
            StatusCounts { pending: 1, confirmed: 1, orphaned: 1 }
        );
    }

    #[test]
    fn test_backfill_watermark_only_rises() {
        let store = IndexerStore::temporary().unwrap();
        assert_eq!(store.backfill_watermark().unwrap(), None);

        store.advance_backfill_watermark(10).unwrap();
        store.advance_backfill_watermark(4).unwrap();
        assert_eq!(store.backfill_watermark().unwrap(), Some(10));
    }

    #[test]
    fn test_rows_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = IndexerStore::open(dir.path()).unwrap();
            store.insert_pending(pending(42, "aa")).unwrap();
            store.flush().unwrap();
        }

        let store = IndexerStore::open(dir.path()).unwrap();
        let row = store.get_snapshot(42, "aa").unwrap().unwrap();
        assert_eq!(row.status, SnapshotStatus::Pending);
        assert_eq!(store.status_counts().unwrap().pending, 1);
        assert_eq!(store.pending_up_to(42).unwrap().len(), 1);
    }

    #[test]
    fn test_status_parses_case_insensitively() {
        assert_eq!("confirmed".parse::<SnapshotStatus>(), Ok(SnapshotStatus::Confirmed));
        assert!("final".parse::<SnapshotStatus>().is_err());
    }
}
