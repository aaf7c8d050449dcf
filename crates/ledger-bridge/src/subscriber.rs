//! Webhook Registrar - Subscribes our ingestion endpoint with the ledger node

use crate::client::{LedgerClient, LedgerError};
use crate::retry::RetryPolicy;
use ledger_types::SubscriptionAck;
use std::sync::Arc;

/// Registers the webhook callback URL, retrying while the node starts up
pub struct WebhookRegistrar {
    ledger: Arc<dyn LedgerClient>,
    retry: RetryPolicy,
}

impl WebhookRegistrar {
    /// Create a registrar with the default retry policy
    pub fn new(ledger: Arc<dyn LedgerClient>) -> Self {
        Self {
            ledger,
            retry: RetryPolicy::default(),
        }
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Register `callback_url` with the node
    pub async fn register(&self, callback_url: &str) -> Result<SubscriptionAck, LedgerError> {
        let ack = self
            .retry
            .run(|attempt| {
                if attempt > 0 {
                    tracing::info!(
                        "Retrying webhook registration with {} (attempt {})",
                        self.ledger.label(),
                        attempt + 1
                    );
                }
                self.ledger.subscribe_webhook(callback_url)
            })
            .await?;

        tracing::info!(
            "Registered webhook {} with {} (subscription {:?})",
            callback_url,
            self.ledger.label(),
            ack.id
        );
        Ok(ack)
    }
}
