//! Request handlers
//!
//! The webhook handler only indexes and enqueues; materialization happens in
//! the pool and its failures never reach the ledger.

use crate::{DEFAULT_LIMIT, MAX_LIMIT};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use indexer_runtime::{
    DivergenceMonitor, HealthHandle, IndexedSnapshot, RejectedTransaction, RejectionFilter,
    SnapshotIngestor, SnapshotStatus, StoreError,
};
use ledger_types::WebhookEvent;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// State shared across handlers
pub struct AppContext {
    pub ingestor: SnapshotIngestor,
    pub confirmation_health: HealthHandle,
    pub fallback_health: HealthHandle,
    pub divergence: DivergenceMonitor,
}

impl AppContext {
    pub fn new(ingestor: SnapshotIngestor) -> Self {
        Self {
            ingestor,
            confirmation_health: HealthHandle::new(),
            fallback_health: HealthHandle::new(),
            divergence: DivergenceMonitor::new(),
        }
    }

    pub fn with_confirmation_health(mut self, health: HealthHandle) -> Self {
        self.confirmation_health = health;
        self
    }

    pub fn with_fallback_health(mut self, health: HealthHandle) -> Self {
        self.fallback_health = health;
        self
    }

    pub fn with_divergence(mut self, divergence: DivergenceMonitor) -> Self {
        self.divergence = divergence;
        self
    }
}

// ============ Errors ============

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        tracing::error!("Store failure while serving request: {}", error);
        ApiError::Internal(error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// ============ Query Types ============

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionsQuery {
    pub update_type: Option<String>,
    pub limit: Option<usize>,
}

fn page_size(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

// ============ Handlers ============

/// `POST /webhook/snapshot`
pub async fn handle_webhook(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let event = WebhookEvent::from_value(body)
        .map_err(|e| ApiError::BadRequest(format!("Unrecognized webhook payload: {}", e)))?;

    match event {
        WebhookEvent::SnapshotFinalized(notification) => {
            if notification.hash.trim().is_empty() {
                return Err(ApiError::BadRequest("Snapshot hash must not be empty".to_string()));
            }

            let outcome = ctx.ingestor.ingest_notification(notification)?;
            let status = if outcome.already_indexed {
                StatusCode::OK
            } else {
                StatusCode::ACCEPTED
            };
            Ok((
                status,
                Json(json!({
                    "accepted": true,
                    "alreadyIndexed": outcome.already_indexed,
                    "ordinal": outcome.ordinal,
                })),
            ))
        }
        WebhookEvent::TransactionRejected(notification) => {
            if notification.rejection.update_hash.trim().is_empty() {
                return Err(ApiError::BadRequest("Rejection updateHash must not be empty".to_string()));
            }

            let outcome = ctx.ingestor.ingest_rejection(notification)?;
            Ok((StatusCode::OK, Json(json!(outcome))))
        }
    }
}

/// `GET /status`
pub async fn handle_status(State(ctx): State<Arc<AppContext>>) -> Result<Json<Value>, ApiError> {
    let store = ctx.ingestor.store().clone();
    let rejections = ctx.ingestor.rejections().clone();

    // Table lengths are counted by iteration in sled
    let (last_indexed, last_confirmed, counts, fibers, rejection_count) =
        tokio::task::spawn_blocking(move || -> Result<_, StoreError> {
            Ok((
                store.last_indexed_ordinal()?,
                store.last_confirmed_ordinal()?,
                store.status_counts()?,
                store.fiber_count(),
                rejections.len(),
            ))
        })
        .await
        .map_err(|e| ApiError::Internal(format!("status task failed: {}", e)))??;

    Ok(Json(json!({
        "lastIndexedOrdinal": last_indexed,
        "lastConfirmedOrdinal": last_confirmed,
        "counts": counts,
        "fibers": fibers,
        "rejections": rejection_count,
        "confirmationPoller": ctx.confirmation_health.snapshot(),
        "fallbackPoller": ctx.fallback_health.snapshot(),
        "divergence": ctx.divergence.snapshot(),
        "materializer": ctx.ingestor.queue().stats(),
    })))
}

/// `GET /snapshots?status=&limit=`
pub async fn handle_list_snapshots(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<SnapshotsQuery>,
) -> Result<Json<Vec<IndexedSnapshot>>, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(raw.parse::<SnapshotStatus>().map_err(ApiError::BadRequest)?),
        None => None,
    };

    let rows = ctx
        .ingestor
        .store()
        .list_snapshots(status, page_size(query.limit))?;
    Ok(Json(rows))
}

/// `GET /fibers/:fiberId`
pub async fn handle_get_fiber(
    State(ctx): State<Arc<AppContext>>,
    Path(fiber_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = ctx
        .ingestor
        .store()
        .get_fiber(&fiber_id)?
        .ok_or_else(|| ApiError::NotFound(format!("fiber {}", fiber_id)))?;

    let mut body = json!(record);
    if let Value::Object(map) = &mut body {
        map.insert(
            "hasCriticalRejection".to_string(),
            json!(ctx.ingestor.rejections().has_critical(&fiber_id)?),
        );
    }
    Ok(Json(body))
}

/// `GET /fibers/:fiberId/rejections?limit=`
pub async fn handle_fiber_rejections(
    State(ctx): State<Arc<AppContext>>,
    Path(fiber_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<RejectedTransaction>>, ApiError> {
    let rows = ctx
        .ingestor
        .rejections()
        .query(RejectionFilter::Fiber(&fiber_id), page_size(query.limit))?;
    Ok(Json(rows))
}

/// `GET /rejections?updateType=&limit=`
pub async fn handle_rejections_by_type(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<RejectionsQuery>,
) -> Result<Json<Vec<RejectedTransaction>>, ApiError> {
    let update_type = query
        .update_type
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::BadRequest("updateType is required".to_string()))?;

    let rows = ctx
        .ingestor
        .rejections()
        .query(RejectionFilter::UpdateType(update_type), page_size(query.limit))?;
    Ok(Json(rows))
}

/// `GET /health`
pub async fn handle_health() -> &'static str {
    "ok"
}
