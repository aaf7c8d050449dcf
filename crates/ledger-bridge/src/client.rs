//! Ledger Client - HTTP access to a ledger node
//!
//! `LedgerClient` is the seam every poller and the sequence coordinator
//! talks through. `HttpLedgerClient` is the production implementation.

use async_trait::async_trait;
use ledger_types::{
    Checkpoint, CheckpointRecord, FiberSnapshot, OnChainState, Ordinal, SignedUpdate,
    SnapshotInfo, SnapshotPayload, SubmitResponse, SubscriptionAck, WebhookSubscription,
};
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Default per-request timeout
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Read and write access to one ledger node
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Human-readable name of the node, used in logs and divergence reports
    fn label(&self) -> &str;

    /// Latest confirmed frontier of the checkpoint layer
    async fn latest_checkpoint(&self) -> Result<Checkpoint, LedgerError>;

    /// Checkpoint layer's record at one height, `None` if it has none yet
    async fn checkpoint_record(
        &self,
        ordinal: Ordinal,
    ) -> Result<Option<CheckpointRecord>, LedgerError>;

    /// Most recent snapshot the node has produced
    async fn latest_snapshot(&self) -> Result<SnapshotInfo, LedgerError>;

    /// Snapshot header at one ordinal, `None` if the node does not have it
    async fn snapshot_info(&self, ordinal: Ordinal) -> Result<Option<SnapshotInfo>, LedgerError>;

    /// Full or incremental state carried by a snapshot
    async fn snapshot_state(&self, ordinal: Ordinal) -> Result<SnapshotPayload, LedgerError>;

    /// Authoritative per-fiber commit index
    async fn onchain_state(&self) -> Result<OnChainState, LedgerError>;

    /// Query-layer view of a fiber, `None` if unknown
    async fn state_machine(&self, fiber_id: &str) -> Result<Option<FiberSnapshot>, LedgerError>;

    /// Submit a signed transition
    async fn submit_update(&self, update: &SignedUpdate) -> Result<SubmitResponse, LedgerError>;

    /// Ask the node to push snapshot notifications to `callback_url`
    async fn subscribe_webhook(&self, callback_url: &str) -> Result<SubscriptionAck, LedgerError>;
}

// ============ Error Types ============

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}: {body}")]
    Status { url: String, status: u16, body: String },
    #[error("Invalid response from {url}: {reason}")]
    Decode { url: String, reason: String },
    #[error("Cannot build request URL from {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl LedgerError {
    /// Whether the node could not be reached or answered with a server error
    pub fn is_unavailable(&self) -> bool {
        match self {
            LedgerError::Transport { .. } => true,
            LedgerError::Status { status, .. } => *status >= 500,
            LedgerError::Decode { .. } | LedgerError::InvalidUrl { .. } => false,
        }
    }
}

// ============ HTTP Implementation ============

/// Ledger client over the node's REST API
pub struct HttpLedgerClient {
    client: Client,
    base_url: String,
}

impl HttpLedgerClient {
    /// Create a client for the node at `base_url`
    pub fn new(base_url: &str) -> Result<Self, LedgerError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|source| LedgerError::Transport {
                url: base_url.to_string(),
                source,
            })?;
        Ok(Self::with_client(client, base_url))
    }

    /// Create a client sharing an existing connection pool
    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// URL of `/{collection}/{id}` with `id` percent-encoded as one segment
    fn segment_url(&self, collection: &str, id: &str) -> Result<String, LedgerError> {
        let invalid = |reason: String| LedgerError::InvalidUrl {
            url: self.base_url.clone(),
            reason,
        };
        let mut url = Url::parse(&self.base_url).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("base URL cannot carry a path".to_string()))?
            .pop_if_empty()
            .push(collection)
            .push(id);
        Ok(url.into())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, LedgerError> {
        let url = self.url(path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| LedgerError::Transport {
                url: url.clone(),
                source,
            })?;
        read_json(&url, response).await
    }

    /// GET that maps 404 to `None`
    async fn get_optional<T: DeserializeOwned>(&self, url: String) -> Result<Option<T>, LedgerError> {
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| LedgerError::Transport {
                url: url.clone(),
                source,
            })?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        read_json(&url, response).await.map(Some)
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, LedgerError>
    where
        B: serde::Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|source| LedgerError::Transport {
                url: url.clone(),
                source,
            })?;
        read_json(&url, response).await
    }
}

async fn read_json<T: DeserializeOwned>(url: &str, response: Response) -> Result<T, LedgerError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(LedgerError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        });
    }

    response.json::<T>().await.map_err(|e| LedgerError::Decode {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    fn label(&self) -> &str {
        &self.base_url
    }

    async fn latest_checkpoint(&self) -> Result<Checkpoint, LedgerError> {
        self.get_json("/checkpoint").await
    }

    async fn checkpoint_record(
        &self,
        ordinal: Ordinal,
    ) -> Result<Option<CheckpointRecord>, LedgerError> {
        self.get_optional(self.url(&format!("/checkpoint/{}", ordinal)))
            .await
    }

    async fn latest_snapshot(&self) -> Result<SnapshotInfo, LedgerError> {
        self.get_json("/snapshots/latest").await
    }

    async fn snapshot_info(&self, ordinal: Ordinal) -> Result<Option<SnapshotInfo>, LedgerError> {
        self.get_optional(self.url(&format!("/snapshots/{}", ordinal)))
            .await
    }

    async fn snapshot_state(&self, ordinal: Ordinal) -> Result<SnapshotPayload, LedgerError> {
        self.get_json(&format!("/snapshots/{}/state", ordinal)).await
    }

    async fn onchain_state(&self) -> Result<OnChainState, LedgerError> {
        self.get_json("/onchain").await
    }

    async fn state_machine(&self, fiber_id: &str) -> Result<Option<FiberSnapshot>, LedgerError> {
        self.get_optional(self.segment_url("state-machines", fiber_id)?)
            .await
    }

    async fn submit_update(&self, update: &SignedUpdate) -> Result<SubmitResponse, LedgerError> {
        self.post_json("/data", update).await
    }

    async fn subscribe_webhook(&self, callback_url: &str) -> Result<SubscriptionAck, LedgerError> {
        let request = WebhookSubscription {
            callback_url: callback_url.to_string(),
        };
        self.post_json("/webhooks/subscribe", &request).await
    }
}
