//! Payment reconciler
//!
//! Applies a terminal gateway result to the ledger exactly once. The
//! PaymentRecord's `is_confirmed` flag is flipped in the same store
//! transaction that extends or opens the subscription, so a redelivered
//! event finds the record confirmed and becomes a no-op.

use std::sync::Arc;

use clubpass_shared::{PaymentMethod, PaymentRecord, Subscription, User};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::autopay::register_renewal_failure;
use crate::client::{GatewayPayment, GatewayStatus, Metadata, SavedMethod};
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::loyalty::LoyaltyEngine;
use crate::notify::{Notification, Notifier};
use crate::store::{LedgerStore, SettleOutcome, SettleSuccess, SubscriptionChange};

/// Metadata keys written at payment creation
pub const META_PAYMENT_LABEL: &str = "payment_label";
pub const META_USER_ID: &str = "user_id";
pub const META_DAYS: &str = "days";
pub const META_SUBSCRIPTION_ID: &str = "subscription_id";
pub const META_ONE_TIME_DISCOUNT: &str = "one_time_discount";

/// A gateway result to reconcile, from a webhook, a poll or a synchronous reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentEvent {
    pub gateway_payment_id: String,
    pub status: GatewayStatus,
    /// Minor currency units
    pub amount: i64,
    pub metadata: Metadata,
    pub payment_method: Option<SavedMethod>,
}

impl From<GatewayPayment> for PaymentEvent {
    fn from(payment: GatewayPayment) -> Self {
        Self {
            gateway_payment_id: payment.id,
            status: payment.status,
            amount: payment.amount,
            metadata: payment.metadata,
            payment_method: payment.payment_method,
        }
    }
}

impl PaymentEvent {
    pub fn payment_label(&self) -> Option<&str> {
        self.metadata
            .get(META_PAYMENT_LABEL)
            .map(String::as_str)
            .filter(|l| !l.is_empty())
    }
}

/// What an `apply` call did
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Payment confirmed and subscription extended or opened
    Applied {
        subscription_id: Uuid,
        end_date: OffsetDateTime,
        created: bool,
    },
    /// Payment confirmed as failed
    Failed,
    /// Record already confirmed by an earlier delivery
    Duplicate,
    /// No local record for this payment
    NotFound,
    /// Non-terminal status; nothing to do yet
    Ignored,
    /// Local state contradicts the event; left unconfirmed for an operator
    Inconsistent(String),
}

pub struct PaymentReconciler {
    store: Arc<dyn LedgerStore>,
    loyalty: Arc<LoyaltyEngine>,
    notifier: Arc<dyn Notifier>,
    config: Arc<BillingConfig>,
}

impl PaymentReconciler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        loyalty: Arc<LoyaltyEngine>,
        notifier: Arc<dyn Notifier>,
        config: Arc<BillingConfig>,
    ) -> Self {
        Self {
            store,
            loyalty,
            notifier,
            config,
        }
    }

    pub async fn apply(&self, event: &PaymentEvent) -> BillingResult<ApplyOutcome> {
        self.apply_at(event, OffsetDateTime::now_utc()).await
    }

    pub async fn apply_at(
        &self,
        event: &PaymentEvent,
        now: OffsetDateTime,
    ) -> BillingResult<ApplyOutcome> {
        if !event.status.is_terminal() {
            tracing::debug!(
                transaction_id = %event.gateway_payment_id,
                "Payment not terminal yet, nothing to reconcile"
            );
            return Ok(ApplyOutcome::Ignored);
        }

        let record = match self.find_record(event).await? {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!(
                    transaction_id = %event.gateway_payment_id,
                    payment_label = ?event.payment_label(),
                    "No payment record for gateway event"
                );
                return Ok(ApplyOutcome::NotFound);
            }
            Err(reason) => return Ok(self.inconsistent(event, reason).await),
        };

        if record.is_confirmed || record.status.is_terminal() {
            tracing::debug!(
                payment_label = %record.payment_label,
                status = %record.status,
                "Payment already confirmed, duplicate delivery"
            );
            return Ok(ApplyOutcome::Duplicate);
        }

        match event.status {
            GatewayStatus::Succeeded => self.apply_success(event, record, now).await,
            _ => self.apply_failure(record, now).await,
        }
    }

    /// Locate the record by gateway id, then by label; `Err` carries an inconsistency
    async fn find_record(
        &self,
        event: &PaymentEvent,
    ) -> BillingResult<Result<Option<PaymentRecord>, String>> {
        if let Some(record) = self
            .store
            .find_payment_by_transaction(&event.gateway_payment_id)
            .await?
        {
            return Ok(Ok(Some(record)));
        }

        let Some(label) = event.payment_label() else {
            return Ok(Ok(None));
        };
        let Some(record) = self.store.find_payment_by_label(label).await? else {
            return Ok(Ok(None));
        };

        match record.transaction_id.as_deref() {
            Some(existing) if existing != event.gateway_payment_id => Ok(Err(format!(
                "payment {} is linked to {}, event reports {}",
                record.payment_label, existing, event.gateway_payment_id
            ))),
            Some(_) => Ok(Ok(Some(record))),
            None => match self
                .store
                .attach_transaction_id(record.id, &event.gateway_payment_id)
                .await
            {
                Ok(_) => Ok(Ok(Some(record))),
                Err(BillingError::Inconsistent(reason)) => Ok(Err(reason)),
                Err(e) => Err(e),
            },
        }
    }

    async fn apply_failure(
        &self,
        record: PaymentRecord,
        now: OffsetDateTime,
    ) -> BillingResult<ApplyOutcome> {
        if !self.store.settle_payment_failed(record.id).await? {
            return Ok(ApplyOutcome::Duplicate);
        }
        tracing::info!(
            payment_label = %record.payment_label,
            user_id = %record.user_id,
            "Payment failed"
        );

        // A pending autopayment that is later canceled counts against the retry budget
        if record.payment_method == PaymentMethod::Autopay {
            if let Some(subscription_id) = record.subscription_id {
                if let Err(e) = register_renewal_failure(
                    self.store.as_ref(),
                    self.notifier.as_ref(),
                    &self.config,
                    subscription_id,
                    now,
                )
                .await
                {
                    tracing::error!(
                        subscription_id = %subscription_id,
                        error = %e,
                        "Failed to record asynchronous autopay failure"
                    );
                }
            }
        }
        Ok(ApplyOutcome::Failed)
    }

    async fn apply_success(
        &self,
        event: &PaymentEvent,
        record: PaymentRecord,
        now: OffsetDateTime,
    ) -> BillingResult<ApplyOutcome> {
        if event.amount != record.amount {
            let reason = format!(
                "amount mismatch for {}: recorded {}, gateway {}",
                record.payment_label, record.amount, event.amount
            );
            return Ok(self.inconsistent(event, reason).await);
        }

        let Some(user) = self.store.get_user(record.user_id).await? else {
            let reason = format!(
                "payment {} belongs to unknown user {}",
                record.payment_label, record.user_id
            );
            return Ok(self.inconsistent(event, reason).await);
        };

        if let Some(subscription_id) = record.subscription_id {
            if self.store.get_subscription(subscription_id).await?.is_none() {
                let reason = format!(
                    "payment {} references missing subscription {}",
                    record.payment_label, subscription_id
                );
                return Ok(self.inconsistent(event, reason).await);
            }
        }

        let renewal_price = self
            .config
            .tariffs
            .for_days(record.days)
            .map(|t| t.price)
            .unwrap_or(record.amount);
        let days = Duration::days(i64::from(record.days));

        let mut settled: Option<(Subscription, bool)> = None;
        for attempt in 0..=self.config.max_cas_retries {
            let change = match self.store.active_subscription(record.user_id).await? {
                Some(active) => SubscriptionChange::Extend {
                    subscription_id: active.id,
                    expected_version: active.version,
                    new_end: active.end_date.max(now) + days,
                    renewal_price,
                    renewal_duration_days: record.days,
                },
                None => SubscriptionChange::Create {
                    start: now,
                    end: now + days,
                    renewal_price,
                    renewal_duration_days: record.days,
                },
            };

            let outcome = self
                .store
                .settle_payment_success(SettleSuccess {
                    payment_id: record.id,
                    change,
                    increment_autopay_streak: record.payment_method == PaymentMethod::Autopay,
                    consume_one_time_discount: event.metadata.contains_key(META_ONE_TIME_DISCOUNT),
                })
                .await?;

            match outcome {
                SettleOutcome::Settled {
                    subscription,
                    created,
                } => {
                    settled = Some((subscription, created));
                    break;
                }
                SettleOutcome::AlreadySettled => return Ok(ApplyOutcome::Duplicate),
                SettleOutcome::Conflict => {
                    tracing::debug!(
                        payment_label = %record.payment_label,
                        attempt,
                        "Subscription changed during settle, re-reading"
                    );
                }
            }
        }

        let Some((subscription, created)) = settled else {
            return Err(BillingError::ConcurrentModification(format!(
                "subscription for user {} kept changing while settling {}",
                record.user_id, record.payment_label
            )));
        };

        tracing::info!(
            payment_label = %record.payment_label,
            user_id = %record.user_id,
            subscription_id = %subscription.id,
            end_date = %subscription.end_date,
            created,
            "Payment applied"
        );

        self.after_success(event, &user, &record, &subscription, created, now)
            .await;

        Ok(ApplyOutcome::Applied {
            subscription_id: subscription.id,
            end_date: subscription.end_date,
            created,
        })
    }

    /// Side effects that must not undo the settled payment
    async fn after_success(
        &self,
        event: &PaymentEvent,
        user: &User,
        record: &PaymentRecord,
        subscription: &Subscription,
        created: bool,
        now: OffsetDateTime,
    ) {
        if let Some(method) = event.payment_method.as_ref().filter(|m| m.saved) {
            match self.store.save_payment_method(user.id, &method.id).await {
                Ok(()) => tracing::info!(user_id = %user.id, "Saved payment method, auto-renew enabled"),
                Err(e) => tracing::error!(user_id = %user.id, error = %e, "Failed to save payment method"),
            }
        }

        let notification = if created {
            Notification::Welcome {
                end_date: subscription.end_date,
                invite_link: self.config.group_invite_link.clone(),
            }
        } else {
            Notification::Renewed {
                end_date: subscription.end_date,
                days: record.days,
            }
        };
        self.notifier
            .notify_user(user.telegram_id, &notification)
            .await;

        if let Err(e) = self.loyalty.evaluate_at(user.id, now).await {
            tracing::error!(user_id = %user.id, error = %e, "Loyalty evaluation failed - non-fatal");
        }
        if let Err(e) = self.loyalty.credit_referral(user, record).await {
            tracing::error!(user_id = %user.id, error = %e, "Referral credit failed - non-fatal");
        }
    }

    async fn inconsistent(&self, event: &PaymentEvent, reason: String) -> ApplyOutcome {
        tracing::error!(
            transaction_id = %event.gateway_payment_id,
            payment_label = ?event.payment_label(),
            reason = %reason,
            "RECONCILIATION NEEDED: payment event contradicts ledger"
        );
        self.notifier
            .notify_operators(&format!(
                "RECONCILIATION NEEDED\npayment: {}\n{}",
                event.gateway_payment_id, reason
            ))
            .await;
        ApplyOutcome::Inconsistent(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestHarness;
    use clubpass_shared::PaymentStatus;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2026-03-01 10:00 UTC);

    #[tokio::test]
    async fn test_first_payment_creates_subscription() {
        let h = TestHarness::new();
        let user = h.add_user(1, false).await;
        h.pending_payment(user.id, "lbl-1", 99_000, 30, PaymentMethod::Card, None)
            .await;

        let outcome = h
            .service
            .reconciler
            .apply_at(&h.success_event("pay-1", "lbl-1", 99_000), NOW)
            .await
            .unwrap();

        let ApplyOutcome::Applied {
            end_date, created, ..
        } = outcome
        else {
            panic!("expected applied, got {:?}", outcome);
        };
        assert!(created);
        assert_eq!(end_date, NOW + Duration::days(30));

        let record = h.store.find_payment_by_label("lbl-1").await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Success);
        assert!(record.is_confirmed);
        assert_eq!(record.transaction_id.as_deref(), Some("pay-1"));
        assert!(h
            .notifier
            .user_messages_for(1)
            .iter()
            .any(|n| matches!(n, Notification::Welcome { .. })));
    }

    #[tokio::test]
    async fn test_redelivery_is_noop() {
        let h = TestHarness::new();
        let user = h.add_user(1, false).await;
        h.pending_payment(user.id, "lbl-1", 99_000, 30, PaymentMethod::Card, None)
            .await;
        let event = h.success_event("pay-1", "lbl-1", 99_000);

        h.service.reconciler.apply_at(&event, NOW).await.unwrap();
        let again = h
            .service
            .reconciler
            .apply_at(&event, NOW + Duration::minutes(5))
            .await
            .unwrap();

        assert_eq!(again, ApplyOutcome::Duplicate);
        let active = h.store.active_subscription(user.id).await.unwrap().unwrap();
        assert_eq!(active.end_date, NOW + Duration::days(30));
    }

    #[tokio::test]
    async fn test_payment_extends_active_subscription() {
        let h = TestHarness::new();
        let user = h.add_user(1, false).await;
        let sub = h
            .add_subscription(user.id, NOW - Duration::days(20), NOW + Duration::days(10), true)
            .await;
        h.pending_payment(user.id, "lbl-2", 269_000, 90, PaymentMethod::Card, None)
            .await;

        h.service
            .reconciler
            .apply_at(&h.success_event("pay-2", "lbl-2", 269_000), NOW)
            .await
            .unwrap();

        let sub = h.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(sub.end_date, NOW + Duration::days(100));
        assert_eq!(sub.renewal_duration_days, 90);
        assert_eq!(h.store.all_subscriptions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_payment_touches_no_subscription() {
        let h = TestHarness::new();
        let user = h.add_user(1, false).await;
        h.pending_payment(user.id, "lbl-3", 99_000, 30, PaymentMethod::Card, None)
            .await;

        let outcome = h
            .service
            .reconciler
            .apply_at(&h.failed_event("pay-3", "lbl-3", 99_000), NOW)
            .await
            .unwrap();

        assert_eq!(outcome, ApplyOutcome::Failed);
        assert!(h.store.all_subscriptions().await.is_empty());
        let record = h.store.find_payment_by_label("lbl-3").await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_payment_is_noop() {
        let h = TestHarness::new();
        let outcome = h
            .service
            .reconciler
            .apply_at(&h.success_event("pay-x", "missing", 100), NOW)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_amount_mismatch_alerts_operators() {
        let h = TestHarness::new();
        let user = h.add_user(1, false).await;
        h.pending_payment(user.id, "lbl-4", 99_000, 30, PaymentMethod::Card, None)
            .await;

        let outcome = h
            .service
            .reconciler
            .apply_at(&h.success_event("pay-4", "lbl-4", 100), NOW)
            .await
            .unwrap();

        assert!(matches!(outcome, ApplyOutcome::Inconsistent(_)));
        let record = h.store.find_payment_by_label("lbl-4").await.unwrap().unwrap();
        assert!(!record.is_confirmed);
        assert!(h
            .notifier
            .operator_messages()
            .iter()
            .any(|m| m.contains("RECONCILIATION NEEDED")));
    }

    #[tokio::test]
    async fn test_saved_method_enables_autopay() {
        let h = TestHarness::new();
        let user = h.add_user(1, false).await;
        h.pending_payment(user.id, "lbl-5", 99_000, 30, PaymentMethod::Card, None)
            .await;
        let mut event = h.success_event("pay-5", "lbl-5", 99_000);
        event.payment_method = Some(SavedMethod {
            id: "pm-5".to_string(),
            saved: true,
        });

        h.service.reconciler.apply_at(&event, NOW).await.unwrap();

        let user = h.store.get_user(user.id).await.unwrap().unwrap();
        assert!(user.can_autopay());
        assert_eq!(user.payment_method_token.as_deref(), Some("pm-5"));
    }

    #[tokio::test]
    async fn test_one_time_discount_consumed() {
        let h = TestHarness::new();
        let mut user = h.add_user(1, false).await;
        user.one_time_discount_percent = 20;
        h.store.put_user(user.clone()).await;
        h.pending_payment(user.id, "lbl-6", 79_200, 30, PaymentMethod::Card, None)
            .await;
        let mut event = h.success_event("pay-6", "lbl-6", 79_200);
        event
            .metadata
            .insert(META_ONE_TIME_DISCOUNT.to_string(), "20".to_string());

        h.service.reconciler.apply_at(&event, NOW).await.unwrap();

        let user = h.store.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(user.one_time_discount_percent, 0);
    }

    #[tokio::test]
    async fn test_pending_status_ignored() {
        let h = TestHarness::new();
        let mut event = h.success_event("pay-7", "lbl-7", 100);
        event.status = GatewayStatus::Pending;
        assert_eq!(
            h.service.reconciler.apply_at(&event, NOW).await.unwrap(),
            ApplyOutcome::Ignored
        );
    }
}
