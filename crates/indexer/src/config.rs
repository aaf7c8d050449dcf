//! Indexer Configuration

use anyhow::{Context, Result};
use indexer_runtime::{ConfirmationConfig, FallbackConfig, MaterializerPoolConfig};
use ledger_bridge::SequenceConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Indexer configuration, loaded from a JSON file and overridden by flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IndexerConfig {
    /// HTTP bind address for the webhook and query endpoints
    pub http_addr: String,
    /// Directory holding the sled database
    pub data_dir: PathBuf,
    /// Primary ledger node
    pub ledger_url: String,
    /// Checkpoint layer; the primary node when unset
    pub checkpoint_url: Option<String>,
    /// Extra nodes compared with the primary for divergence
    pub peer_urls: Vec<String>,
    /// Our public webhook URL, registered with the node on startup when set
    pub webhook_callback_url: Option<String>,
    pub confirmation_interval_secs: u64,
    pub fallback_interval_secs: u64,
    pub fallback_max_backfill: usize,
    pub fallback_lookback: u64,
    pub sweep_batch: usize,
    pub queue_capacity: usize,
    pub max_concurrent_materializations: usize,
    pub sequence_wait_timeout_ms: u64,
    pub sequence_poll_interval_ms: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        let fallback = FallbackConfig::default();
        let pool = MaterializerPoolConfig::default();
        let sequence = SequenceConfig::default();

        Self {
            http_addr: webhook_server::DEFAULT_HTTP_ADDR.to_string(),
            data_dir: PathBuf::from("./data"),
            ledger_url: "http://127.0.0.1:9200".to_string(),
            checkpoint_url: None,
            peer_urls: Vec::new(),
            webhook_callback_url: None,
            confirmation_interval_secs: ConfirmationConfig::default().interval.as_secs(),
            fallback_interval_secs: fallback.interval.as_secs(),
            fallback_max_backfill: fallback.max_backfill_per_tick,
            fallback_lookback: fallback.lookback,
            sweep_batch: fallback.sweep_batch,
            queue_capacity: pool.queue_capacity,
            max_concurrent_materializations: pool.max_concurrent,
            sequence_wait_timeout_ms: sequence.wait_timeout.as_millis() as u64,
            sequence_poll_interval_ms: sequence.poll_interval.as_millis() as u64,
        }
    }
}

impl IndexerConfig {
    /// Load from a JSON file; missing keys take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {:?}", path))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config file {:?}", path))
    }

    pub fn checkpoint_url(&self) -> &str {
        self.checkpoint_url.as_deref().unwrap_or(&self.ledger_url)
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("indexer.sled")
    }

    pub fn confirmation(&self) -> ConfirmationConfig {
        ConfirmationConfig {
            interval: Duration::from_secs(self.confirmation_interval_secs.max(1)),
        }
    }

    pub fn fallback(&self) -> FallbackConfig {
        FallbackConfig {
            interval: Duration::from_secs(self.fallback_interval_secs.max(1)),
            max_backfill_per_tick: self.fallback_max_backfill,
            lookback: self.fallback_lookback,
            sweep_batch: self.sweep_batch,
        }
    }

    pub fn pool(&self) -> MaterializerPoolConfig {
        MaterializerPoolConfig {
            queue_capacity: self.queue_capacity,
            max_concurrent: self.max_concurrent_materializations,
        }
    }

    /// Pool for reconcile mode, which never runs the workers
    ///
    /// One fallback tick enqueues at most its backfill limit plus one sweep
    /// batch, so a queue that size never sheds.
    pub fn reconcile_pool(&self) -> MaterializerPoolConfig {
        MaterializerPoolConfig {
            queue_capacity: self
                .fallback_max_backfill
                .saturating_add(self.sweep_batch)
                .max(1),
            max_concurrent: 1,
        }
    }

    pub fn sequence(&self) -> SequenceConfig {
        SequenceConfig {
            wait_timeout: Duration::from_millis(self.sequence_wait_timeout_ms),
            poll_interval: Duration::from_millis(self.sequence_poll_interval_ms.max(1)),
        }
    }
}
