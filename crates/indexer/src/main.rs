//! Metagraph Indexer
//!
//! Main entry point for the snapshot indexer daemon.
//! Ingests snapshot notifications from the ledger, materializes fiber state,
//! and confirms snapshots against the checkpoint layer.
//! State is persisted to disk and survives restarts.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use indexer_runtime::{
    ConfirmationPoller, FallbackPoller, IndexerStore, Materializer, MaterializerPool,
    RejectionLedger, Shutdown, SnapshotIngestor,
};
use ledger_bridge::{HttpLedgerClient, LedgerClient, SequenceCoordinator, WebhookRegistrar};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use webhook_server::{AppContext, WebhookServer};

mod config;

use config::IndexerConfig;

/// What to run
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Run the webhook server, materializer pool and both pollers
    Serve,
    /// Run one fallback and one confirmation pass, materialize, and exit
    Reconcile,
    /// Print the next safe sequence number for `--fiber-id` and exit
    NextSequence,
}

/// Metagraph snapshot indexer
#[derive(Parser, Debug)]
#[command(name = "metagraph-indexer")]
#[command(about = "Indexes metagraph snapshots and confirms them against the checkpoint layer", long_about = None)]
struct Args {
    /// What to run
    #[arg(long, value_enum, default_value = "serve")]
    mode: Mode,

    /// JSON config file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// HTTP bind address
    #[arg(long)]
    http_addr: Option<String>,

    /// Data directory for the sled database
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Primary ledger node URL
    #[arg(long)]
    ledger_url: Option<String>,

    /// Checkpoint layer URL (defaults to the ledger URL)
    #[arg(long)]
    checkpoint_url: Option<String>,

    /// Peer node URL compared for divergence (repeatable)
    #[arg(long = "peer-url")]
    peer_urls: Vec<String>,

    /// Public webhook URL to register with the node
    #[arg(long)]
    webhook_callback_url: Option<String>,

    /// Seconds between confirmation ticks
    #[arg(long)]
    confirmation_interval_secs: Option<u64>,

    /// Seconds between fallback ticks
    #[arg(long)]
    fallback_interval_secs: Option<u64>,

    /// Materialization queue capacity
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Concurrent materializations
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Fiber to inspect (next-sequence mode)
    #[arg(long)]
    fiber_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(&self, config: &mut IndexerConfig) {
        if let Some(addr) = &self.http_addr {
            config.http_addr = addr.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(url) = &self.ledger_url {
            config.ledger_url = url.clone();
        }
        if let Some(url) = &self.checkpoint_url {
            config.checkpoint_url = Some(url.clone());
        }
        if !self.peer_urls.is_empty() {
            config.peer_urls = self.peer_urls.clone();
        }
        if let Some(url) = &self.webhook_callback_url {
            config.webhook_callback_url = Some(url.clone());
        }
        if let Some(secs) = self.confirmation_interval_secs {
            config.confirmation_interval_secs = secs;
        }
        if let Some(secs) = self.fallback_interval_secs {
            config.fallback_interval_secs = secs;
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = capacity;
        }
        if let Some(max) = self.max_concurrent {
            config.max_concurrent_materializations = max;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => IndexerConfig::load(path)?,
        None => IndexerConfig::default(),
    };
    args.apply(&mut config);

    match args.mode {
        Mode::Serve => run_serve(config).await,
        Mode::Reconcile => run_reconcile(config).await,
        Mode::NextSequence => {
            let fiber_id = args
                .fiber_id
                .ok_or_else(|| anyhow::anyhow!("--fiber-id is required in next-sequence mode"))?;
            run_next_sequence(config, &fiber_id).await
        }
    }
}

/// Ledger clients built from the config
struct Nodes {
    primary: Arc<dyn LedgerClient>,
    checkpoint: Arc<dyn LedgerClient>,
    peers: Vec<Arc<dyn LedgerClient>>,
}

impl Nodes {
    fn connect(config: &IndexerConfig) -> Result<Self> {
        let primary: Arc<dyn LedgerClient> = Arc::new(HttpLedgerClient::new(&config.ledger_url)?);
        let checkpoint: Arc<dyn LedgerClient> = if config.checkpoint_url() == config.ledger_url {
            primary.clone()
        } else {
            Arc::new(HttpLedgerClient::new(config.checkpoint_url())?)
        };
        let peers = config
            .peer_urls
            .iter()
            .map(|url| Ok(Arc::new(HttpLedgerClient::new(url)?) as Arc<dyn LedgerClient>))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            primary,
            checkpoint,
            peers,
        })
    }
}

fn open_store(config: &IndexerConfig) -> Result<(IndexerStore, RejectionLedger)> {
    std::fs::create_dir_all(&config.data_dir)?;
    let store = IndexerStore::open(config.store_path())?;
    let rejections = RejectionLedger::open(store.db())?;
    Ok((store, rejections))
}

/// Run the daemon until Ctrl+C
async fn run_serve(config: IndexerConfig) -> Result<()> {
    tracing::info!("Starting Metagraph Indexer");
    tracing::info!("  HTTP: {}", config.http_addr);
    tracing::info!("  Ledger: {}", config.ledger_url);
    tracing::info!("  Checkpoint layer: {}", config.checkpoint_url());
    tracing::info!("  Peers: {:?}", config.peer_urls);
    tracing::info!("  Data directory: {:?}", config.data_dir);

    let (store, rejections) = open_store(&config)?;
    let nodes = Nodes::connect(&config)?;

    match (store.last_indexed_ordinal()?, store.last_confirmed_ordinal()?) {
        (Some(indexed), confirmed) => tracing::info!(
            "Resuming: last indexed {}, last confirmed {:?}",
            indexed,
            confirmed
        ),
        (None, _) => tracing::info!("No indexed snapshots found, starting fresh"),
    }

    let shutdown = Shutdown::new();

    // Materializer pool
    let (pool, queue) = MaterializerPool::new(
        Materializer::new(store.clone(), nodes.primary.clone()),
        config.pool(),
    );
    let pool_handle = tokio::spawn(pool.run(shutdown.signal()));

    // Rows left unmaterialized by a previous run
    queue.requeue_unmaterialized(&store, config.sweep_batch)?;

    let ingestor = SnapshotIngestor::new(store.clone(), rejections, queue);

    // Pollers
    let confirmation = ConfirmationPoller::new(
        store.clone(),
        nodes.checkpoint.clone(),
        config.confirmation(),
    );
    let fallback = FallbackPoller::new(ingestor.clone(), nodes.primary.clone(), config.fallback())
        .with_peers(nodes.peers.clone());

    let context = AppContext::new(ingestor)
        .with_confirmation_health(confirmation.health())
        .with_fallback_health(fallback.health())
        .with_divergence(fallback.divergence());

    let confirmation_handle = tokio::spawn(confirmation.run(shutdown.signal()));
    let fallback_handle = tokio::spawn(fallback.run(shutdown.signal()));

    // HTTP server
    let http_addr = config.http_addr.clone();
    let http_signal = shutdown.signal();
    let http_server = tokio::spawn(async move {
        let server = WebhookServer::new(context);
        if let Err(e) = server.run(&http_addr, http_signal).await {
            tracing::error!("Webhook server error: {}", e);
        }
    });

    // Register the webhook once the server is accepting
    if let Some(callback_url) = config.webhook_callback_url.clone() {
        let registrar = WebhookRegistrar::new(nodes.primary.clone());
        tokio::spawn(async move {
            if let Err(e) = registrar.register(&callback_url).await {
                tracing::error!(
                    "Webhook registration failed, relying on fallback polling: {}",
                    e
                );
            }
        });
    }

    tracing::info!("Indexer running. Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    shutdown.trigger();

    for (name, handle) in [
        ("confirmation poller", confirmation_handle),
        ("fallback poller", fallback_handle),
        ("materializer pool", pool_handle),
        ("webhook server", http_server),
    ] {
        if let Err(e) = handle.await {
            tracing::error!("{} task failed: {}", name, e);
        }
    }

    let flushed = store.flush()?;
    tracing::info!("Flushed {} bytes to disk", flushed);
    tracing::info!("Indexer stopped");

    Ok(())
}

/// One reconciliation pass, for operators and cron jobs
async fn run_reconcile(config: IndexerConfig) -> Result<()> {
    let (store, rejections) = open_store(&config)?;
    let nodes = Nodes::connect(&config)?;

    let materializer = Materializer::new(store.clone(), nodes.primary.clone());
    // Rows are materialized inline below; the pool is never started and its
    // queue is sized so the fallback tick cannot overflow it
    let (_pool, queue) = MaterializerPool::new(
        Materializer::new(store.clone(), nodes.primary.clone()),
        config.reconcile_pool(),
    );
    let ingestor = SnapshotIngestor::new(store.clone(), rejections, queue);

    let fallback = FallbackPoller::new(ingestor, nodes.primary.clone(), config.fallback())
        .with_peers(nodes.peers.clone());
    if let Some(report) = fallback.tick().await {
        tracing::info!(
            "Fallback: latest {}, backfilled {:?}, divergence {:?}",
            report.latest,
            report.backfilled,
            report.divergence.map(|d| d.ordinal)
        );
    }

    let mut materialized = 0;
    for row in store.unmaterialized(usize::MAX)? {
        match materializer.materialize(row.ordinal, &row.hash).await {
            Ok(_) => materialized += 1,
            Err(e) => tracing::error!("Materialization of snapshot {} failed: {}", row.ordinal, e),
        }
    }
    tracing::info!("Materialized {} snapshots", materialized);

    let confirmation = ConfirmationPoller::new(store.clone(), nodes.checkpoint, config.confirmation());
    if let Some(report) = confirmation.tick().await {
        tracing::info!(
            "Confirmation at frontier {}: {} confirmed, {} orphaned, {} awaiting",
            report.frontier,
            report.confirmed,
            report.orphaned,
            report.awaiting
        );
    }

    let counts = store.status_counts()?;
    println!("{}", serde_json::to_string_pretty(&counts)?);
    store.flush()?;
    Ok(())
}

/// Print the next safe sequence number for a fiber
async fn run_next_sequence(config: IndexerConfig, fiber_id: &str) -> Result<()> {
    let nodes = Nodes::connect(&config)?;
    let coordinator = SequenceCoordinator::new(nodes.primary, config.sequence());

    let next = coordinator.next_sequence(fiber_id).await?;
    println!("{}", next);
    Ok(())
}
