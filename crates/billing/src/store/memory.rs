//! In-process ledger store
//!
//! One mutex guards all tables, so every trait method is trivially atomic.
//! Conditional writes still check versions exactly like the Postgres adapter,
//! which keeps conflict handling in the engine honest under test.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use clubpass_shared::{
    LoyaltyEvent, LoyaltyEventKind, LoyaltyLevel, PaymentRecord, PaymentStatus, Subscription, User,
};
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    BenefitChoice, BenefitGrant, CasOutcome, GrantOutcome, LedgerStore, NewPayment,
    ReferralCredit, SettleOutcome, SettleSuccess, SubscriptionChange,
};
use crate::error::{BillingError, BillingResult};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    subscriptions: HashMap<Uuid, Subscription>,
    payments: HashMap<Uuid, PaymentRecord>,
    loyalty_events: Vec<LoyaltyEvent>,
    referral_keys: HashSet<(Uuid, Uuid, String)>,
}

impl Tables {
    fn active_for(&self, user_id: Uuid) -> Option<&Subscription> {
        self.subscriptions
            .values()
            .find(|s| s.user_id == user_id && s.is_active)
    }

    fn has_event(&self, user_id: Uuid, level: LoyaltyLevel, kind: LoyaltyEventKind) -> bool {
        self.loyalty_events
            .iter()
            .any(|e| e.user_id == user_id && e.level == level && e.kind == kind)
    }

    fn cas_subscription(
        &mut self,
        id: Uuid,
        expected_version: i64,
        apply: impl FnOnce(&mut Subscription),
    ) -> CasOutcome {
        match self.subscriptions.get_mut(&id) {
            Some(sub) if sub.version == expected_version => {
                apply(sub);
                sub.version += 1;
                CasOutcome::Applied {
                    version: sub.version,
                }
            }
            _ => CasOutcome::Conflict,
        }
    }
}

/// Ledger store held entirely in memory
#[derive(Default)]
pub struct MemoryLedgerStore {
    tables: Mutex<Tables>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a subscription row as-is
    pub async fn insert_subscription(&self, subscription: Subscription) {
        self.tables
            .lock()
            .await
            .subscriptions
            .insert(subscription.id, subscription);
    }

    /// Overwrite a user row as-is (admin override)
    pub async fn put_user(&self, user: User) {
        self.tables.lock().await.users.insert(user.id, user);
    }

    pub async fn all_subscriptions(&self) -> Vec<Subscription> {
        self.tables
            .lock()
            .await
            .subscriptions
            .values()
            .cloned()
            .collect()
    }

    pub async fn all_payments(&self) -> Vec<PaymentRecord> {
        self.tables
            .lock()
            .await
            .payments
            .values()
            .cloned()
            .collect()
    }

    pub async fn referral_credit_count(&self) -> usize {
        self.tables.lock().await.referral_keys.len()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert_user(&self, user: &User) -> BillingResult<()> {
        let mut t = self.tables.lock().await;
        if t.users.values().any(|u| u.telegram_id == user.telegram_id) {
            return Err(BillingError::InvalidInput(format!(
                "telegram_id {} already registered",
                user.telegram_id
            )));
        }
        t.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<User>> {
        Ok(self.tables.lock().await.users.get(&user_id).cloned())
    }

    async fn users_without_active_subscription(&self) -> BillingResult<Vec<User>> {
        let t = self.tables.lock().await;
        Ok(t.users
            .values()
            .filter(|u| t.active_for(u.id).is_none())
            .cloned()
            .collect())
    }

    async fn users_with_active_subscription(&self) -> BillingResult<Vec<User>> {
        let t = self.tables.lock().await;
        Ok(t.users
            .values()
            .filter(|u| t.active_for(u.id).is_some())
            .cloned()
            .collect())
    }

    async fn save_payment_method(&self, user_id: Uuid, token: &str) -> BillingResult<()> {
        let mut t = self.tables.lock().await;
        let user = t
            .users
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;
        user.payment_method_token = Some(token.to_string());
        user.is_recurring_active = true;
        Ok(())
    }

    async fn set_recurring_active(&self, user_id: Uuid, active: bool) -> BillingResult<()> {
        let mut t = self.tables.lock().await;
        let user = t
            .users
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;
        user.is_recurring_active = active;
        Ok(())
    }

    async fn reset_autopay_streak_if_disabled(&self, user_id: Uuid) -> BillingResult<bool> {
        let mut t = self.tables.lock().await;
        match t.users.get_mut(&user_id) {
            Some(user) if !user.is_recurring_active && user.autopay_streak != 0 => {
                user.autopay_streak = 0;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.tables.lock().await.subscriptions.get(&id).cloned())
    }

    async fn active_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.tables.lock().await.active_for(user_id).cloned())
    }

    async fn subscriptions_for_user(&self, user_id: Uuid) -> BillingResult<Vec<Subscription>> {
        let t = self.tables.lock().await;
        let mut subs: Vec<Subscription> = t
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.start_date);
        Ok(subs)
    }

    async fn expired_active_subscriptions(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        let t = self.tables.lock().await;
        let mut subs: Vec<Subscription> = t
            .subscriptions
            .values()
            .filter(|s| s.is_active && s.end_date <= now)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.end_date);
        Ok(subs)
    }

    async fn autopay_candidates(
        &self,
        now: OffsetDateTime,
        max_failures: i32,
    ) -> BillingResult<Vec<Subscription>> {
        let t = self.tables.lock().await;
        let mut subs: Vec<Subscription> = t
            .subscriptions
            .values()
            .filter(|s| s.end_date <= now && s.autopayment_fail_count < max_failures)
            .filter(|s| match s.next_retry_attempt_at {
                None => s.is_active,
                Some(at) => at <= now,
            })
            .filter(|s| t.users.get(&s.user_id).is_some_and(|u| u.can_autopay()))
            .filter(|s| t.active_for(s.user_id).map_or(true, |a| a.id == s.id))
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.end_date);
        Ok(subs)
    }

    async fn claim_renewal_attempt(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
        lease_until: OffsetDateTime,
    ) -> BillingResult<CasOutcome> {
        let mut t = self.tables.lock().await;
        Ok(t.cas_subscription(subscription_id, expected_version, |s| {
            s.next_retry_attempt_at = Some(lease_until);
        }))
    }

    async fn record_autopay_failure(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
        fail_count: i32,
        next_retry_attempt_at: Option<OffsetDateTime>,
    ) -> BillingResult<CasOutcome> {
        let mut t = self.tables.lock().await;
        Ok(t.cas_subscription(subscription_id, expected_version, |s| {
            s.autopayment_fail_count = fail_count;
            s.next_retry_attempt_at = next_retry_attempt_at;
        }))
    }

    async fn mark_awaiting_renewal(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
    ) -> BillingResult<CasOutcome> {
        let mut t = self.tables.lock().await;
        Ok(t.cas_subscription(subscription_id, expected_version, |s| {
            s.is_active = false;
            s.next_retry_attempt_at = None;
        }))
    }

    async fn deactivate_subscription(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
    ) -> BillingResult<CasOutcome> {
        let mut t = self.tables.lock().await;
        Ok(t.cas_subscription(subscription_id, expected_version, |s| {
            s.is_active = false;
        }))
    }

    async fn insert_payment(&self, payment: NewPayment) -> BillingResult<PaymentRecord> {
        let mut t = self.tables.lock().await;
        if let Some(existing) = t
            .payments
            .values()
            .find(|p| p.payment_label == payment.payment_label)
        {
            return Ok(existing.clone());
        }

        let record = PaymentRecord {
            id: Uuid::new_v4(),
            user_id: payment.user_id,
            subscription_id: payment.subscription_id,
            amount: payment.amount,
            status: PaymentStatus::Pending,
            payment_method: payment.payment_method,
            transaction_id: None,
            payment_label: payment.payment_label,
            is_confirmed: false,
            days: payment.days,
            created_at: payment.created_at,
        };
        t.payments.insert(record.id, record.clone());
        Ok(record)
    }

    async fn attach_transaction_id(
        &self,
        payment_id: Uuid,
        transaction_id: &str,
    ) -> BillingResult<bool> {
        let mut t = self.tables.lock().await;
        let taken = t
            .payments
            .values()
            .any(|p| p.id != payment_id && p.transaction_id.as_deref() == Some(transaction_id));
        if taken {
            return Err(BillingError::Inconsistent(format!(
                "transaction {} already linked to another payment",
                transaction_id
            )));
        }
        match t.payments.get_mut(&payment_id) {
            Some(p) if p.transaction_id.is_none() => {
                p.transaction_id = Some(transaction_id.to_string());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(BillingError::PaymentNotFound(payment_id.to_string())),
        }
    }

    async fn find_payment_by_label(&self, label: &str) -> BillingResult<Option<PaymentRecord>> {
        let t = self.tables.lock().await;
        Ok(t.payments
            .values()
            .find(|p| p.payment_label == label)
            .cloned())
    }

    async fn find_payment_by_transaction(
        &self,
        transaction_id: &str,
    ) -> BillingResult<Option<PaymentRecord>> {
        let t = self.tables.lock().await;
        Ok(t.payments
            .values()
            .find(|p| p.transaction_id.as_deref() == Some(transaction_id))
            .cloned())
    }

    async fn stale_pending_payments(
        &self,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<PaymentRecord>> {
        let t = self.tables.lock().await;
        let mut payments: Vec<PaymentRecord> = t
            .payments
            .values()
            .filter(|p| {
                p.status == PaymentStatus::Pending
                    && !p.is_confirmed
                    && p.transaction_id.is_some()
                    && p.created_at < created_before
            })
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        payments.truncate(limit.max(0) as usize);
        Ok(payments)
    }

    async fn count_successful_payments(&self, user_id: Uuid) -> BillingResult<i64> {
        let t = self.tables.lock().await;
        Ok(t.payments
            .values()
            .filter(|p| p.user_id == user_id && p.status == PaymentStatus::Success)
            .count() as i64)
    }

    async fn settle_payment_success(&self, settle: SettleSuccess) -> BillingResult<SettleOutcome> {
        let mut t = self.tables.lock().await;

        let payment = t
            .payments
            .get(&settle.payment_id)
            .cloned()
            .ok_or_else(|| BillingError::PaymentNotFound(settle.payment_id.to_string()))?;
        if payment.is_confirmed || payment.status.is_terminal() {
            return Ok(SettleOutcome::AlreadySettled);
        }

        let (subscription, created) = match settle.change {
            SubscriptionChange::Extend {
                subscription_id,
                expected_version,
                new_end,
                renewal_price,
                renewal_duration_days,
            } => {
                let current = t.subscriptions.get(&subscription_id);
                let still_active = current.is_some_and(|s| s.is_active);
                if !still_active {
                    return Ok(SettleOutcome::Conflict);
                }
                let outcome = t.cas_subscription(subscription_id, expected_version, |s| {
                    s.end_date = s.end_date.max(new_end);
                    s.renewal_price = renewal_price;
                    s.renewal_duration_days = renewal_duration_days;
                    s.autopayment_fail_count = 0;
                    s.next_retry_attempt_at = None;
                });
                if !outcome.is_applied() {
                    return Ok(SettleOutcome::Conflict);
                }
                match t.subscriptions.get(&subscription_id) {
                    Some(s) => (s.clone(), false),
                    None => return Ok(SettleOutcome::Conflict),
                }
            }
            SubscriptionChange::Create {
                start,
                end,
                renewal_price,
                renewal_duration_days,
            } => {
                if t.active_for(payment.user_id).is_some() {
                    return Ok(SettleOutcome::Conflict);
                }
                for s in t.subscriptions.values_mut() {
                    if s.user_id == payment.user_id
                        && (s.next_retry_attempt_at.is_some() || s.autopayment_fail_count != 0)
                    {
                        s.next_retry_attempt_at = None;
                        s.autopayment_fail_count = 0;
                        s.version += 1;
                    }
                }
                let sub = Subscription {
                    id: Uuid::new_v4(),
                    user_id: payment.user_id,
                    start_date: start,
                    end_date: end,
                    is_active: true,
                    autopayment_fail_count: 0,
                    next_retry_attempt_at: None,
                    renewal_price,
                    renewal_duration_days,
                    version: 0,
                };
                t.subscriptions.insert(sub.id, sub.clone());
                (sub, true)
            }
        };

        if let Some(p) = t.payments.get_mut(&settle.payment_id) {
            p.status = PaymentStatus::Success;
            p.is_confirmed = true;
            p.subscription_id = Some(subscription.id);
        }
        if let Some(user) = t.users.get_mut(&payment.user_id) {
            if settle.increment_autopay_streak {
                user.autopay_streak += 1;
            }
            if settle.consume_one_time_discount {
                user.one_time_discount_percent = 0;
            }
        }

        Ok(SettleOutcome::Settled {
            subscription,
            created,
        })
    }

    async fn settle_payment_failed(&self, payment_id: Uuid) -> BillingResult<bool> {
        let mut t = self.tables.lock().await;
        let payment = t
            .payments
            .get_mut(&payment_id)
            .ok_or_else(|| BillingError::PaymentNotFound(payment_id.to_string()))?;
        if payment.is_confirmed || payment.status.is_terminal() {
            return Ok(false);
        }
        payment.status = PaymentStatus::Failed;
        payment.is_confirmed = true;
        Ok(true)
    }

    async fn has_loyalty_event(
        &self,
        user_id: Uuid,
        level: LoyaltyLevel,
        kind: LoyaltyEventKind,
    ) -> BillingResult<bool> {
        Ok(self.tables.lock().await.has_event(user_id, level, kind))
    }

    async fn advance_loyalty_level(
        &self,
        user_id: Uuid,
        level: LoyaltyLevel,
        offer: bool,
        payload: serde_json::Value,
    ) -> BillingResult<bool> {
        let mut t = self.tables.lock().await;
        let user = t
            .users
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;
        if user.current_loyalty_level >= level {
            return Ok(false);
        }
        user.current_loyalty_level = level;
        if offer {
            user.pending_loyalty_reward = Some(level);
        }

        if t.has_event(user_id, level, LoyaltyEventKind::LevelReached) {
            return Ok(false);
        }
        t.loyalty_events.push(LoyaltyEvent {
            id: Uuid::new_v4(),
            user_id,
            kind: LoyaltyEventKind::LevelReached,
            level,
            payload,
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(true)
    }

    async fn grant_loyalty_benefit(&self, grant: BenefitGrant) -> BillingResult<GrantOutcome> {
        let mut t = self.tables.lock().await;
        if !t.users.contains_key(&grant.user_id) {
            return Err(BillingError::UserNotFound(grant.user_id.to_string()));
        }
        if t.has_event(grant.user_id, grant.level, LoyaltyEventKind::BenefitChosen) {
            return Ok(GrantOutcome::AlreadyChosen);
        }

        let mut subscription_end = None;
        match grant.choice {
            BenefitChoice::Discount(percent) => {
                if let Some(user) = t.users.get_mut(&grant.user_id) {
                    user.lifetime_discount_percent = user.lifetime_discount_percent.max(percent);
                }
            }
            BenefitChoice::BonusDays(days) => {
                let bonus = Duration::days(i64::from(days));
                let active_id = t.active_for(grant.user_id).map(|s| s.id);
                match active_id.and_then(|id| t.subscriptions.get_mut(&id)) {
                    Some(sub) => {
                        sub.end_date = sub.end_date.max(grant.now) + bonus;
                        sub.version += 1;
                        subscription_end = Some(sub.end_date);
                    }
                    None => {
                        let sub = Subscription {
                            id: Uuid::new_v4(),
                            user_id: grant.user_id,
                            start_date: grant.now,
                            end_date: grant.now + bonus,
                            is_active: true,
                            autopayment_fail_count: 0,
                            next_retry_attempt_at: None,
                            renewal_price: grant.promo_renewal_price,
                            renewal_duration_days: grant.promo_renewal_days,
                            version: 0,
                        };
                        subscription_end = Some(sub.end_date);
                        t.subscriptions.insert(sub.id, sub);
                    }
                }
            }
        }

        let lifetime_discount_percent = match t.users.get_mut(&grant.user_id) {
            Some(user) => {
                if user.pending_loyalty_reward == Some(grant.level) {
                    user.pending_loyalty_reward = None;
                }
                user.lifetime_discount_percent
            }
            None => 0,
        };

        t.loyalty_events.push(LoyaltyEvent {
            id: Uuid::new_v4(),
            user_id: grant.user_id,
            kind: LoyaltyEventKind::BenefitChosen,
            level: grant.level,
            payload: grant.payload,
            created_at: grant.now,
        });

        Ok(GrantOutcome::Granted {
            subscription_end,
            lifetime_discount_percent,
        })
    }

    async fn loyalty_events(&self, user_id: Uuid) -> BillingResult<Vec<LoyaltyEvent>> {
        let t = self.tables.lock().await;
        Ok(t.loyalty_events
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn credit_referral(&self, credit: ReferralCredit) -> BillingResult<bool> {
        let mut t = self.tables.lock().await;
        if !t.users.contains_key(&credit.referrer_id) {
            return Err(BillingError::UserNotFound(credit.referrer_id.to_string()));
        }
        let key = (credit.referrer_id, credit.referred_user_id, credit.reason);
        if !t.referral_keys.insert(key) {
            return Ok(false);
        }
        if let Some(referrer) = t.users.get_mut(&credit.referrer_id) {
            referrer.referral_balance += credit.amount;
            referrer.total_earned_referral += credit.amount;
        }
        Ok(true)
    }
}
