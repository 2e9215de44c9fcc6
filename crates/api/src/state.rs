//! Application state

use std::sync::Arc;

use clubpass_billing::{BillingService, WebhookAuth, WebhookIngestor};
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Absent in tests that run against the in-memory ledger
    pub pool: Option<PgPool>,
    pub config: Config,
    pub ingestor: Arc<WebhookIngestor>,
}

impl AppState {
    /// Wire the billing engine over Postgres from environment variables
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        tracing::info!("Initializing billing service...");
        let billing = BillingService::from_env(pool.clone())?;

        let auth = WebhookAuth::from_env()?;
        tracing::info!(
            allowed_networks = auth.allowed_networks.len(),
            signature_verification = auth.signing_secret.is_some(),
            "Webhook authentication configured"
        );

        Ok(Self {
            pool: Some(pool),
            config,
            ingestor: Arc::new(billing.ingestor(auth)),
        })
    }

    pub fn with_ingestor(config: Config, ingestor: WebhookIngestor) -> Self {
        Self {
            pool: None,
            config,
            ingestor: Arc::new(ingestor),
        }
    }
}
