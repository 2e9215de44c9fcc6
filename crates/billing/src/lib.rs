// Billing crate clippy configuration
#![allow(clippy::too_many_arguments)]
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ClubPass Billing Engine
//!
//! Subscription lifecycle and payment reconciliation for a paid Telegram
//! community.
//!
//! ## Features
//!
//! - **Checkout**: Open a gateway payment for a tariff, with discounts applied
//! - **Webhooks**: Authenticate and parse gateway notifications
//! - **Reconciliation**: Apply each terminal payment result exactly once
//! - **Autopay**: Renew expired subscriptions against a saved payment method,
//!   with a capped retry schedule
//! - **Group Sync**: Keep group membership equal to the set of paying members
//! - **Loyalty & Referrals**: Tenure levels, one-shot benefits, referral credits
//! - **Polling**: Settle payments whose webhook never arrived
//! - **Invariants**: Read-only ledger consistency checks

pub mod autopay;
pub mod checkout;
pub mod client;
pub mod config;
pub mod error;
pub mod group;
pub mod group_sync;
pub mod invariants;
pub mod loyalty;
pub mod notify;
pub mod polling;
pub mod reconciler;
pub mod schedule;
pub mod store;
pub mod telegram;
pub mod webhooks;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;


// Autopay
pub use autopay::{AutopayCycleReport, AutopayScheduler, RenewalAttempt};

// Checkout
pub use checkout::{CheckoutService, CheckoutSession};

// Client
pub use client::{GatewayClient, GatewayConfig, GatewayError, PaymentGateway};

// Config
pub use config::{BillingConfig, Tariff, Tariffs};

// Error
pub use error::{BillingError, BillingResult};

// Group
pub use group::GroupMembership;
pub use group_sync::{GroupSyncReport, GroupSynchronizer, RemovalPass};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Loyalty
pub use loyalty::{BenefitOption, LoyaltyEngine, LoyaltySweepReport};

// Notifications
pub use notify::{LogNotifier, Notification, Notifier};

// Polling
pub use polling::{PendingPaymentPoller, PollReport};

// Reconciler
pub use reconciler::{ApplyOutcome, PaymentEvent, PaymentReconciler};

// Scheduling
pub use schedule::{JobLock, LocalJobLock, RedisJobLock, ScheduledTask};

// Store
pub use store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};

// Telegram
pub use telegram::{TelegramClient, TelegramConfig};

// Webhooks
pub use webhooks::{IngestOutcome, WebhookAuth, WebhookIngestor};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that wires every component over one store
#[derive(Clone)]
pub struct BillingService {
    pub config: Arc<BillingConfig>,
    pub store: Arc<dyn LedgerStore>,
    pub loyalty: Arc<LoyaltyEngine>,
    pub reconciler: Arc<PaymentReconciler>,
    pub autopay: Arc<AutopayScheduler>,
    pub group_sync: Arc<GroupSynchronizer>,
    pub checkout: Arc<CheckoutService>,
    pub poller: Arc<PendingPaymentPoller>,
    pub notifier: Arc<dyn Notifier>,
}

impl BillingService {
    /// Create a billing service from environment variables, backed by Postgres and Telegram
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        let gateway = Arc::new(GatewayClient::from_env()?);
        let telegram = Arc::new(TelegramClient::from_env()?);
        let store = Arc::new(PgLedgerStore::new(pool));

        Ok(Self::new(store, gateway, telegram.clone(), telegram, config))
    }

    /// Create a billing service with explicit collaborators
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        group: Arc<dyn GroupMembership>,
        notifier: Arc<dyn Notifier>,
        config: BillingConfig,
    ) -> Self {
        let config = Arc::new(config);

        let loyalty = Arc::new(LoyaltyEngine::new(
            store.clone(),
            notifier.clone(),
            config.clone(),
        ));
        let reconciler = Arc::new(PaymentReconciler::new(
            store.clone(),
            loyalty.clone(),
            notifier.clone(),
            config.clone(),
        ));
        let autopay = Arc::new(AutopayScheduler::new(
            store.clone(),
            gateway.clone(),
            reconciler.clone(),
            notifier.clone(),
            config.clone(),
        ));
        let group_sync = Arc::new(GroupSynchronizer::new(
            store.clone(),
            group,
            autopay.clone(),
            notifier.clone(),
            config.clone(),
        ));
        let checkout = Arc::new(CheckoutService::new(
            store.clone(),
            gateway.clone(),
            config.clone(),
        ));
        let poller = Arc::new(PendingPaymentPoller::new(
            store.clone(),
            gateway,
            reconciler.clone(),
            config.clone(),
        ));

        Self {
            config,
            store,
            loyalty,
            reconciler,
            autopay,
            group_sync,
            checkout,
            poller,
            notifier,
        }
    }

    /// Webhook entry point sharing this service's reconciler
    pub fn ingestor(&self, auth: WebhookAuth) -> WebhookIngestor {
        WebhookIngestor::new(self.reconciler.clone(), auth)
    }

    /// Member opt-out of automatic renewal
    pub async fn disable_autopay(&self, user_id: uuid::Uuid) -> BillingResult<()> {
        self.checkout.disable_autopay(user_id).await
    }
}
