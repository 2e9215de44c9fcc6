//! Pending-payment poller
//!
//! Webhook delivery is not guaranteed. Payments left pending past a grace
//! period are looked up at the gateway and terminal results go through the
//! reconciler, the same idempotent path a webhook takes.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::client::PaymentGateway;
use crate::config::BillingConfig;
use crate::error::BillingResult;
use crate::reconciler::{ApplyOutcome, PaymentEvent, PaymentReconciler, META_PAYMENT_LABEL};
use crate::store::LedgerStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub checked: usize,
    pub settled: usize,
    pub still_pending: usize,
    pub errors: usize,
}

pub struct PendingPaymentPoller {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    reconciler: Arc<PaymentReconciler>,
    config: Arc<BillingConfig>,
}

impl PendingPaymentPoller {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        reconciler: Arc<PaymentReconciler>,
        config: Arc<BillingConfig>,
    ) -> Self {
        Self {
            store,
            gateway,
            reconciler,
            config,
        }
    }

    pub async fn run_cycle(&self) -> BillingResult<PollReport> {
        self.run_cycle_at(OffsetDateTime::now_utc()).await
    }

    pub async fn run_cycle_at(&self, now: OffsetDateTime) -> BillingResult<PollReport> {
        let stale = self
            .store
            .stale_pending_payments(now - self.config.pending_poll_after, self.config.pending_poll_batch)
            .await?;
        let mut report = PollReport {
            checked: stale.len(),
            ..Default::default()
        };

        for record in stale {
            let Some(transaction_id) = record.transaction_id.as_deref() else {
                continue;
            };
            let payment = match self.gateway.get_payment(transaction_id).await {
                Ok(payment) => payment,
                Err(e) => {
                    tracing::warn!(
                        payment_label = %record.payment_label,
                        error = %e,
                        "Failed to poll payment status"
                    );
                    report.errors += 1;
                    continue;
                }
            };
            if !payment.status.is_terminal() {
                report.still_pending += 1;
                continue;
            }

            let mut event = PaymentEvent::from(payment);
            event
                .metadata
                .entry(META_PAYMENT_LABEL.to_string())
                .or_insert_with(|| record.payment_label.clone());

            match self.reconciler.apply_at(&event, now).await {
                Ok(ApplyOutcome::Applied { .. } | ApplyOutcome::Failed) => {
                    tracing::info!(
                        payment_label = %record.payment_label,
                        "Settled payment found by polling"
                    );
                    report.settled += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(
                        payment_label = %record.payment_label,
                        error = %e,
                        "Failed to reconcile polled payment"
                    );
                    report.errors += 1;
                }
            }
        }

        if report.checked > 0 {
            tracing::info!(
                checked = report.checked,
                settled = report.settled,
                still_pending = report.still_pending,
                errors = report.errors,
                "Pending payment poll finished"
            );
        }
        Ok(report)
    }
}
