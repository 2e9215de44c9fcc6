//! Autopay scheduler
//!
//! Per subscription: `ACTIVE -> expires -> RENEWAL_ATTEMPTED -> RENEWED |
//! RETRY_SCHEDULED -> ... -> RETRIES_EXHAUSTED`.
//!
//! An attempt first claims the subscription by moving `next_retry_attempt_at`
//! to a short lease with a compare-and-set, so two schedulers (or the group
//! synchronizer calling in) cannot both charge the same renewal. The payment
//! label is derived from the subscription, its end date and its failure
//! count; the gateway deduplicates on it.

use std::sync::Arc;

use clubpass_shared::{PaymentMethod, PaymentStatus, Subscription, User};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{AutopayOutcome, CreateAutopayment, Metadata, PaymentGateway};
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::notify::{Notification, Notifier};
use crate::reconciler::{
    PaymentEvent, PaymentReconciler, META_DAYS, META_ONE_TIME_DISCOUNT, META_PAYMENT_LABEL,
    META_SUBSCRIPTION_ID, META_USER_ID,
};
use crate::store::{CasOutcome, LedgerStore, NewPayment};

/// Result of one renewal attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalAttempt {
    /// Gateway charged synchronously and the renewal was applied
    Renewed,
    /// Gateway accepted; waiting for the webhook or the poller
    Pending,
    /// Attempt failed; `exhausted` once the retry cap is reached
    Failed { fail_count: i32, exhausted: bool },
    /// An earlier attempt with the same label already succeeded
    AlreadyRenewed,
    /// Another worker claimed the subscription first
    Skipped,
    /// Not due, or the owner cannot be charged
    NotEligible,
}

/// Counters for one scheduler pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutopayCycleReport {
    pub candidates: usize,
    pub renewed: usize,
    pub pending: usize,
    pub failed: usize,
    pub exhausted: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Deterministic idempotency key for one attempt
pub fn autopay_label(subscription: &Subscription) -> String {
    format!(
        "autopay:{}:{}:{}",
        subscription.id,
        subscription.end_date.unix_timestamp(),
        subscription.autopayment_fail_count
    )
}

fn is_due(subscription: &Subscription, now: OffsetDateTime, max_failures: i32) -> bool {
    subscription.is_expired_at(now)
        && subscription.autopayment_fail_count < max_failures
        && match subscription.next_retry_attempt_at {
            None => subscription.is_active,
            Some(at) => at <= now,
        }
}

/// Count a failed renewal against the retry budget.
///
/// Re-reads on a lost compare-and-set. Stops without writing when the
/// subscription has been renewed meanwhile or the budget is already spent.
/// Notifies the user only from the write that reaches the cap.
pub(crate) async fn register_renewal_failure(
    store: &dyn LedgerStore,
    notifier: &dyn Notifier,
    config: &BillingConfig,
    subscription_id: Uuid,
    now: OffsetDateTime,
) -> BillingResult<Option<RenewalAttempt>> {
    for _ in 0..=config.max_cas_retries {
        let Some(sub) = store.get_subscription(subscription_id).await? else {
            return Err(BillingError::SubscriptionNotFound(subscription_id.to_string()));
        };
        if (sub.is_active && sub.end_date > now)
            || sub.autopayment_fail_count >= config.autopay_max_failures
        {
            return Ok(None);
        }

        let fail_count = sub.autopayment_fail_count + 1;
        let exhausted = fail_count >= config.autopay_max_failures;
        let next_retry = (!exhausted).then(|| now + config.autopay_retry_cooldown);

        match store
            .record_autopay_failure(sub.id, sub.version, fail_count, next_retry)
            .await?
        {
            CasOutcome::Applied { .. } => {
                if exhausted {
                    tracing::warn!(
                        subscription_id = %sub.id,
                        user_id = %sub.user_id,
                        fail_count,
                        "Autopay retries exhausted; auto-renew stays enabled"
                    );
                    if let Some(user) = store.get_user(sub.user_id).await? {
                        notifier
                            .notify_user(
                                user.telegram_id,
                                &Notification::AutopayExhausted {
                                    attempts: fail_count,
                                },
                            )
                            .await;
                    }
                } else {
                    tracing::info!(
                        subscription_id = %sub.id,
                        fail_count,
                        next_retry_attempt_at = ?next_retry,
                        "Autopay retry scheduled"
                    );
                }
                return Ok(Some(RenewalAttempt::Failed {
                    fail_count,
                    exhausted,
                }));
            }
            CasOutcome::Conflict => continue,
        }
    }
    Err(BillingError::ConcurrentModification(format!(
        "subscription {} kept changing while recording autopay failure",
        subscription_id
    )))
}

pub struct AutopayScheduler {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    reconciler: Arc<PaymentReconciler>,
    notifier: Arc<dyn Notifier>,
    config: Arc<BillingConfig>,
}

impl AutopayScheduler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        reconciler: Arc<PaymentReconciler>,
        notifier: Arc<dyn Notifier>,
        config: Arc<BillingConfig>,
    ) -> Self {
        Self {
            store,
            gateway,
            reconciler,
            notifier,
            config,
        }
    }

    pub async fn run_cycle(&self) -> BillingResult<AutopayCycleReport> {
        self.run_cycle_at(OffsetDateTime::now_utc()).await
    }

    /// One pass over every subscription due a renewal attempt
    pub async fn run_cycle_at(&self, now: OffsetDateTime) -> BillingResult<AutopayCycleReport> {
        let candidates = self
            .store
            .autopay_candidates(now, self.config.autopay_max_failures)
            .await?;

        let mut report = AutopayCycleReport {
            candidates: candidates.len(),
            ..Default::default()
        };

        for sub in candidates {
            match self.attempt(&sub, now).await {
                Ok(RenewalAttempt::Renewed) | Ok(RenewalAttempt::AlreadyRenewed) => {
                    report.renewed += 1
                }
                Ok(RenewalAttempt::Pending) => report.pending += 1,
                Ok(RenewalAttempt::Failed { exhausted, .. }) => {
                    report.failed += 1;
                    if exhausted {
                        report.exhausted += 1;
                    }
                }
                Ok(RenewalAttempt::Skipped) | Ok(RenewalAttempt::NotEligible) => {
                    report.skipped += 1
                }
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(
                        subscription_id = %sub.id,
                        error = %e,
                        "Autopay attempt failed unexpectedly"
                    );
                }
            }
        }

        if report.candidates > 0 {
            tracing::info!(
                candidates = report.candidates,
                renewed = report.renewed,
                pending = report.pending,
                failed = report.failed,
                exhausted = report.exhausted,
                errors = report.errors,
                "Autopay cycle finished"
            );
        }
        Ok(report)
    }

    /// Attempt one subscription if it is due (used by the group synchronizer)
    pub async fn attempt_renewal(
        &self,
        subscription_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<RenewalAttempt> {
        let sub = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;
        if !is_due(&sub, now, self.config.autopay_max_failures) {
            return Ok(RenewalAttempt::NotEligible);
        }
        if let Some(active) = self.store.active_subscription(sub.user_id).await? {
            if active.id != sub.id {
                return Ok(RenewalAttempt::NotEligible);
            }
        }
        self.attempt(&sub, now).await
    }

    async fn attempt(&self, sub: &Subscription, now: OffsetDateTime) -> BillingResult<RenewalAttempt> {
        let Some(user) = self.store.get_user(sub.user_id).await? else {
            return Err(BillingError::UserNotFound(sub.user_id.to_string()));
        };
        let Some(token) = user.payment_method_token.clone().filter(|_| user.can_autopay()) else {
            return Ok(RenewalAttempt::NotEligible);
        };

        let (amount, days, one_time) = self.price_for(sub, &user);
        if amount <= 0 {
            return Err(BillingError::InvalidInput(
                "discount leaves nothing to charge".to_string(),
            ));
        }

        let version = match self
            .store
            .claim_renewal_attempt(sub.id, sub.version, now + self.config.renewal_lease)
            .await?
        {
            CasOutcome::Applied { version } => version,
            CasOutcome::Conflict => {
                tracing::debug!(subscription_id = %sub.id, "Renewal claimed elsewhere, skipping");
                return Ok(RenewalAttempt::Skipped);
            }
        };

        let label = autopay_label(sub);

        let record = self
            .store
            .insert_payment(NewPayment {
                user_id: user.id,
                subscription_id: Some(sub.id),
                amount,
                payment_method: PaymentMethod::Autopay,
                payment_label: label.clone(),
                days,
                created_at: now,
            })
            .await?;

        if record.is_confirmed {
            return match record.status {
                PaymentStatus::Success => {
                    self.mark_awaiting(sub.id, version).await?;
                    Ok(RenewalAttempt::AlreadyRenewed)
                }
                _ => self.fail(sub.id, now).await,
            };
        }

        let mut metadata = Metadata::new();
        metadata.insert(META_PAYMENT_LABEL.to_string(), label.clone());
        metadata.insert(META_USER_ID.to_string(), user.id.to_string());
        metadata.insert(META_DAYS.to_string(), days.to_string());
        metadata.insert(META_SUBSCRIPTION_ID.to_string(), sub.id.to_string());
        if one_time {
            metadata.insert(
                META_ONE_TIME_DISCOUNT.to_string(),
                user.one_time_discount_percent.to_string(),
            );
        }

        let request = CreateAutopayment {
            amount: record.amount,
            description: format!("Club access renewal, {} days", days),
            idempotency_key: label.clone(),
            payment_method_id: token,
            metadata,
        };
        let outcome = AutopayOutcome::from_result(self.gateway.create_autopayment(&request).await);

        let gateway_id = match &outcome {
            AutopayOutcome::Succeeded(p) | AutopayOutcome::Pending(p) => Some(p.id.as_str()),
            AutopayOutcome::Failed { payment_id, .. } => payment_id.as_deref(),
            AutopayOutcome::RetryableError(_) => None,
        };
        if let Some(gateway_id) = gateway_id {
            if let Err(e) = self.store.attach_transaction_id(record.id, gateway_id).await {
                tracing::error!(
                    payment_label = %label,
                    transaction_id = %gateway_id,
                    error = %e,
                    "Failed to link autopayment to gateway id"
                );
            }
        }

        match outcome {
            AutopayOutcome::Succeeded(payment) => {
                tracing::info!(subscription_id = %sub.id, payment_label = %label, "Autopayment succeeded");
                self.mark_awaiting(sub.id, version).await?;
                let mut event = PaymentEvent::from(payment);
                event
                    .metadata
                    .entry(META_PAYMENT_LABEL.to_string())
                    .or_insert_with(|| label.clone());
                self.reconciler.apply_at(&event, now).await?;
                Ok(RenewalAttempt::Renewed)
            }
            AutopayOutcome::Pending(_) => {
                tracing::info!(subscription_id = %sub.id, payment_label = %label, "Autopayment pending");
                self.mark_awaiting(sub.id, version).await?;
                Ok(RenewalAttempt::Pending)
            }
            AutopayOutcome::Failed { reason, .. } => {
                tracing::warn!(
                    subscription_id = %sub.id,
                    payment_label = %label,
                    reason = %reason,
                    "Autopayment declined"
                );
                self.store.settle_payment_failed(record.id).await?;
                self.fail(sub.id, now).await
            }
            AutopayOutcome::RetryableError(error) => {
                // Outcome unknown: the record stays pending so a late webhook can still settle it
                tracing::warn!(
                    subscription_id = %sub.id,
                    payment_label = %label,
                    error = %error,
                    "Autopayment request failed after retries"
                );
                self.fail(sub.id, now).await
            }
        }
    }

    fn price_for(&self, sub: &Subscription, user: &User) -> (i64, i32, bool) {
        let base = self
            .config
            .tariffs
            .for_days(sub.renewal_duration_days)
            .map(|t| t.price)
            .unwrap_or(sub.renewal_price);
        let percent = user.discount_percent();
        let amount = base * i64::from(100 - percent) / 100;
        let one_time = user.one_time_discount_percent > user.lifetime_discount_percent;
        (amount, sub.renewal_duration_days, one_time)
    }

    async fn mark_awaiting(&self, subscription_id: Uuid, version: i64) -> BillingResult<()> {
        if let CasOutcome::Conflict = self
            .store
            .mark_awaiting_renewal(subscription_id, version)
            .await?
        {
            // A webhook already applied the renewal, or another component moved the row
            tracing::debug!(
                subscription_id = %subscription_id,
                "Subscription changed before it could be marked awaiting renewal"
            );
        }
        Ok(())
    }

    async fn fail(&self, subscription_id: Uuid, now: OffsetDateTime) -> BillingResult<RenewalAttempt> {
        Ok(register_renewal_failure(
            self.store.as_ref(),
            self.notifier.as_ref(),
            &self.config,
            subscription_id,
            now,
        )
        .await?
        .unwrap_or(RenewalAttempt::Skipped))
    }
}
