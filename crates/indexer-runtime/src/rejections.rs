//! Rejection Ledger - Deduplicated record of updates the ledger refused
//!
//! Rows are immutable and keyed by update hash. Two secondary trees index
//! them by fiber and by update type; all three are written in one sled
//! transaction so an index never points at a missing row.

use crate::error::StoreError;
use crate::store::{decode, encode};
use chrono::{DateTime, Utc};
use ledger_types::{FiberId, Ordinal, Rejection, RejectionError, RejectionNotification};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::{Db, Transactional, Tree};

/// Error codes caused by ordering races between writers and the ledger's
/// own propagation. Anything else is terminal.
pub const BENIGN_ERROR_CODES: &[&str] = &[
    "SequenceNumberMismatch",
    "StaleSequenceNumber",
    "DuplicateUpdate",
    "SnapshotOrdinalMismatch",
];

/// Severity of a rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    /// Transient ordering race; the caller's next natural retry resolves it
    Benign,
    /// Guard failure, malformed payload or unauthorized signer
    Critical,
}

/// Classify a list of error codes
///
/// Benign only when there is at least one code and every code is benign.
pub fn classify_codes<'a, I>(codes: I) -> Classification
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = false;
    for code in codes {
        seen = true;
        if !BENIGN_ERROR_CODES.contains(&code) {
            return Classification::Critical;
        }
    }
    if seen {
        Classification::Benign
    } else {
        Classification::Critical
    }
}

/// Stored rejection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedTransaction {
    pub update_hash: String,
    pub fiber_id: FiberId,
    pub update_type: String,
    pub errors: Vec<RejectionError>,
    pub signers: Vec<String>,
    pub ordinal: Ordinal,
    /// Ledger timestamp if reported, else the time we received it
    pub timestamp: String,
    pub received_at: DateTime<Utc>,
}

impl RejectedTransaction {
    pub fn from_notification(notification: RejectionNotification) -> Self {
        let received_at = Utc::now();
        let Rejection {
            update_type,
            fiber_id,
            update_hash,
            errors,
            signers,
        } = notification.rejection;
        Self {
            update_hash,
            fiber_id,
            update_type,
            errors,
            signers,
            ordinal: notification.ordinal,
            timestamp: notification
                .timestamp
                .unwrap_or_else(|| received_at.to_rfc3339()),
            received_at,
        }
    }

    pub fn error_codes(&self) -> impl Iterator<Item = &str> {
        self.errors.iter().map(|e| e.code.as_str())
    }

    pub fn classify(&self) -> Classification {
        classify_codes(self.error_codes())
    }
}

/// Lookup key for `query`
#[derive(Debug, Clone, Copy)]
pub enum RejectionFilter<'a> {
    Fiber(&'a str),
    UpdateType(&'a str),
}

/// Deduplicated store of rejections
#[derive(Clone)]
pub struct RejectionLedger {
    records: Tree,
    by_fiber: Tree,
    by_type: Tree,
}

impl RejectionLedger {
    /// Open the rejection trees in an existing database
    pub fn open(db: &Db) -> Result<Self, StoreError> {
        Ok(Self {
            records: db.open_tree("rejections")?,
            by_fiber: db.open_tree("rejections_by_fiber")?,
            by_type: db.open_tree("rejections_by_type")?,
        })
    }

    /// Insert unless a rejection with the same update hash exists
    ///
    /// Returns whether a new row was written.
    pub fn record(&self, rejection: &RejectedTransaction) -> Result<bool, StoreError> {
        let bytes = encode(rejection)?;
        let record_key = rejection.update_hash.as_bytes();
        let fiber_key = index_key(&rejection.fiber_id, rejection.ordinal, &rejection.update_hash);
        let type_key = index_key(&rejection.update_type, rejection.ordinal, &rejection.update_hash);

        let result = (&self.records, &self.by_fiber, &self.by_type).transaction(
            |(records, by_fiber, by_type)| -> ConflictableTransactionResult<bool, ()> {
                if records.get(record_key)?.is_some() {
                    return Ok(false);
                }
                records.insert(record_key, bytes.as_slice())?;
                by_fiber.insert(fiber_key.as_slice(), record_key)?;
                by_type.insert(type_key.as_slice(), record_key)?;
                Ok(true)
            },
        );

        let inserted = match result {
            Ok(inserted) => inserted,
            Err(TransactionError::Storage(e)) => return Err(StoreError::Sled(e)),
            Err(TransactionError::Abort(())) => {
                return Err(StoreError::Transaction(format!(
                    "rejection {} aborted",
                    rejection.update_hash
                )))
            }
        };

        match (inserted, rejection.classify()) {
            (false, _) => tracing::debug!("Rejection {} already recorded", rejection.update_hash),
            (true, Classification::Benign) => tracing::debug!(
                "Benign rejection {} on fiber {}: {:?}",
                rejection.update_hash,
                rejection.fiber_id,
                rejection.error_codes().collect::<Vec<_>>()
            ),
            (true, Classification::Critical) => tracing::warn!(
                "Critical rejection {} on fiber {}: {:?}",
                rejection.update_hash,
                rejection.fiber_id,
                rejection.error_codes().collect::<Vec<_>>()
            ),
        }

        Ok(inserted)
    }

    /// Get one rejection by update hash
    pub fn get(&self, update_hash: &str) -> Result<Option<RejectedTransaction>, StoreError> {
        match self.records.get(update_hash.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Newest rejections for a fiber or update type
    pub fn query(
        &self,
        filter: RejectionFilter<'_>,
        limit: usize,
    ) -> Result<Vec<RejectedTransaction>, StoreError> {
        let (index, prefix) = match filter {
            RejectionFilter::Fiber(fiber_id) => (&self.by_fiber, index_prefix(fiber_id)),
            RejectionFilter::UpdateType(update_type) => (&self.by_type, index_prefix(update_type)),
        };

        let mut rows = Vec::new();
        for entry in index.scan_prefix(&prefix).rev() {
            if rows.len() >= limit {
                break;
            }
            let (_, record_key) = entry?;
            if let Some(bytes) = self.records.get(&record_key)? {
                rows.push(decode(&bytes)?);
            }
        }
        Ok(rows)
    }

    /// Whether a fiber has any critical rejection on record
    pub fn has_critical(&self, fiber_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .query(RejectionFilter::Fiber(fiber_id), usize::MAX)?
            .iter()
            .any(|r| r.classify() == Classification::Critical))
    }

    /// Number of stored rejections
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// `<name> 0x00`, so one fiber's entries never match another fiber's prefix
fn index_prefix(name: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(name.len() + 1);
    prefix.extend_from_slice(name.as_bytes());
    prefix.push(0);
    prefix
}

fn index_key(name: &str, ordinal: Ordinal, update_hash: &str) -> Vec<u8> {
    let mut key = index_prefix(name);
    key.extend_from_slice(&ordinal.to_be_bytes());
    key.extend_from_slice(update_hash.as_bytes());
    key
}
