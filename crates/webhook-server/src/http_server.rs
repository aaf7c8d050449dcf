//! HTTP Server
//!
//! Routes the webhook and query endpoints onto an axum router.

use crate::handlers::{
    handle_fiber_rejections, handle_get_fiber, handle_health, handle_list_snapshots,
    handle_rejections_by_type, handle_status, handle_webhook, AppContext,
};
use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use indexer_runtime::ShutdownSignal;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Webhook and query server
pub struct WebhookServer {
    context: Arc<AppContext>,
}

impl WebhookServer {
    pub fn new(context: AppContext) -> Self {
        Self {
            context: Arc::new(context),
        }
    }

    /// Create the Axum router
    pub fn router(&self) -> Router {
        // Query endpoints are read from browser dashboards
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

        Router::new()
            .route("/webhook/snapshot", post(handle_webhook))
            .route("/status", get(handle_status))
            .route("/snapshots", get(handle_list_snapshots))
            .route("/fibers/:fiber_id", get(handle_get_fiber))
            .route("/fibers/:fiber_id/rejections", get(handle_fiber_rejections))
            .route("/rejections", get(handle_rejections_by_type))
            .route("/health", get(handle_health))
            .layer(cors)
            .with_state(self.context.clone())
    }

    /// Serve until `shutdown` fires
    pub async fn run(self, addr: &str, mut shutdown: ShutdownSignal) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Webhook server listening on {}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await?;

        tracing::info!("Webhook server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use indexer_runtime::{
        IndexerStore, Materializer, MaterializerPool, MaterializerPoolConfig, RejectionLedger,
        Resolution, SnapshotIngestor,
    };
    use ledger_bridge::memory::InMemoryLedger;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        store: IndexerStore,
        _pool: MaterializerPool,
    }

    fn test_app() -> TestApp {
        let store = IndexerStore::temporary().unwrap();
        let rejections = RejectionLedger::open(store.db()).unwrap();
        let (pool, queue) = MaterializerPool::new(
            Materializer::new(store.clone(), Arc::new(InMemoryLedger::new("node-0"))),
            MaterializerPoolConfig::default(),
        );
        let context = AppContext::new(SnapshotIngestor::new(store.clone(), rejections, queue));
        TestApp {
            router: WebhookServer::new(context).router(),
            store,
            _pool: pool,
        }
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, body)
    }

    fn post_webhook(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhook/snapshot")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn rejection(update_hash: &str, code: &str) -> Value {
        json!({
            "event": "transaction.rejected",
            "ordinal": 12,
            "timestamp": "2024-05-01T00:00:00Z",
            "rejection": {
                "updateType": "TransitionStateMachine",
                "fiberId": "fiber-a",
                "updateHash": update_hash,
                "errors": [{ "code": code, "message": "rejected" }],
                "signers": ["DAG0signer"]
            }
        })
    }

    #[tokio::test]
    async fn test_snapshot_webhook_is_idempotent() {
        let app = test_app();
        let body = json!({
            "event": "snapshot.finalized",
            "ordinal": 42,
            "hash": "abc",
            "timestamp": "2024-05-01T00:00:00Z",
            "stats": { "updatesProcessed": 3, "stateMachinesActive": 1, "scriptsActive": 0 }
        });

        let (status, first) = send(&app.router, post_webhook(body.clone())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(first["alreadyIndexed"], json!(false));
        assert_eq!(first["ordinal"], json!(42));

        let (status, second) = send(&app.router, post_webhook(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["alreadyIndexed"], json!(true));

        assert_eq!(app.store.snapshots_at(42).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_event_defaults_to_snapshot() {
        let app = test_app();
        let (status, _) = send(&app.router, post_webhook(json!({ "ordinal": 1, "hash": "h1" }))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(app.store.has_ordinal(1).unwrap());
    }

    #[tokio::test]
    async fn test_invalid_webhooks_are_rejected() {
        let app = test_app();

        let (status, _) = send(&app.router, post_webhook(json!({ "event": "node.restarted" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app.router, post_webhook(json!({ "ordinal": 2, "hash": "" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!app.store.has_ordinal(2).unwrap());
    }

    #[tokio::test]
    async fn test_rejection_webhook_and_queries() {
        let app = test_app();

        let (status, body) = send(&app.router, post_webhook(rejection("u1", "SequenceNumberMismatch"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "recorded": true, "classification": "benign" }));

        let (_, body) = send(&app.router, post_webhook(rejection("u1", "SequenceNumberMismatch"))).await;
        assert_eq!(body["recorded"], json!(false));

        let (_, body) = send(&app.router, post_webhook(rejection("u2", "GuardConditionFailed"))).await;
        assert_eq!(body["classification"], json!("critical"));

        let (status, body) = send(&app.router, get("/fibers/fiber-a/rejections?limit=1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(1));

        let (_, body) = send(&app.router, get("/rejections?updateType=TransitionStateMachine")).await;
        assert_eq!(body.as_array().map(Vec::len), Some(2));

        let (status, _) = send(&app.router, get("/rejections")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_snapshot_listing_and_status() {
        let app = test_app();
        for (ordinal, hash) in [(1, "a"), (2, "b"), (3, "c")] {
            send(&app.router, post_webhook(json!({ "ordinal": ordinal, "hash": hash }))).await;
        }
        app.store
            .resolve(
                1,
                "a",
                Resolution::Confirmed {
                    parent_checkpoint_ordinal: 1,
                },
            )
            .unwrap();

        let (status, body) = send(&app.router, get("/snapshots?status=pending&limit=10")).await;
        assert_eq!(status, StatusCode::OK);
        let ordinals: Vec<_> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|row| row["ordinal"].as_u64().unwrap())
            .collect();
        assert_eq!(ordinals, vec![3, 2]);

        let (status, _) = send(&app.router, get("/snapshots?status=lost")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app.router, get("/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["lastIndexedOrdinal"], json!(3));
        assert_eq!(body["lastConfirmedOrdinal"], json!(1));
        assert_eq!(body["counts"], json!({ "pending": 2, "confirmed": 1, "orphaned": 0 }));
        assert_eq!(body["materializer"]["queued"], json!(3));
        assert_eq!(body["confirmationPoller"]["consecutiveFailures"], json!(0));
    }

    #[tokio::test]
    async fn test_fiber_lookup_and_health() {
        let app = test_app();

        let (status, _) = send(&app.router, get("/fibers/unknown")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app.router, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!("ok"));
    }
}
