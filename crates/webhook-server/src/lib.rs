//! Webhook Server - HTTP surface of the indexer
//!
//! Provides:
//! - `POST /webhook/snapshot`: snapshot and rejection notifications from the ledger
//! - Query endpoints for status, snapshots, fibers and rejections

pub mod handlers;
pub mod http_server;

pub use handlers::{ApiError, AppContext};
pub use http_server::WebhookServer;

/// Default HTTP bind address
pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:3030";

/// Default page size for list endpoints
pub const DEFAULT_LIMIT: usize = 50;

/// Largest page size accepted by list endpoints
pub const MAX_LIMIT: usize = 500;
