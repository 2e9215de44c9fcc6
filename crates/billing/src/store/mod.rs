//! Ledger store port
//!
//! Every mutation the engine makes goes through this trait. Writes that can
//! race with another component are conditional: either they carry the
//! `version` the caller read (compare-and-set) or they check the row state
//! they are about to change inside one transaction. A losing writer gets
//! [`CasOutcome::Conflict`] / [`SettleOutcome::Conflict`] and must re-read.
//!
//! Two adapters exist: [`PgLedgerStore`] for production and
//! [`MemoryLedgerStore`] for tests and local development.

mod memory;
mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

use async_trait::async_trait;
use clubpass_shared::{
    LoyaltyEvent, LoyaltyEventKind, LoyaltyLevel, PaymentMethod, PaymentRecord, Subscription, User,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of a compare-and-set write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// Write applied; the row now carries `version`
    Applied { version: i64 },
    /// Row changed (or vanished) since it was read
    Conflict,
}

impl CasOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied { .. })
    }
}

/// A payment about to be handed to the gateway
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub user_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub amount: i64,
    pub payment_method: PaymentMethod,
    pub payment_label: String,
    pub days: i32,
    pub created_at: OffsetDateTime,
}

/// How a successful payment changes the user's subscription
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionChange {
    /// Push the active subscription's end date out
    Extend {
        subscription_id: Uuid,
        expected_version: i64,
        new_end: OffsetDateTime,
        renewal_price: i64,
        renewal_duration_days: i32,
    },
    /// Open a new active subscription; fails if one is already active
    Create {
        start: OffsetDateTime,
        end: OffsetDateTime,
        renewal_price: i64,
        renewal_duration_days: i32,
    },
}

/// Everything that must commit together when a payment succeeds
#[derive(Debug, Clone)]
pub struct SettleSuccess {
    pub payment_id: Uuid,
    pub change: SubscriptionChange,
    pub increment_autopay_streak: bool,
    pub consume_one_time_discount: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettleOutcome {
    Settled {
        subscription: Subscription,
        created: bool,
    },
    /// Payment was confirmed by an earlier delivery
    AlreadySettled,
    /// Subscription state moved under us; re-read and plan again
    Conflict,
}

/// What the user picked when offered a loyalty benefit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenefitChoice {
    /// Permanent discount, in percent
    Discount(i32),
    /// Extra access days
    BonusDays(i32),
}

#[derive(Debug, Clone)]
pub struct BenefitGrant {
    pub user_id: Uuid,
    pub level: LoyaltyLevel,
    pub choice: BenefitChoice,
    pub payload: serde_json::Value,
    pub now: OffsetDateTime,
    /// Renewal terms for a promo subscription if bonus days land on a lapsed user
    pub promo_renewal_price: i64,
    pub promo_renewal_days: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GrantOutcome {
    Granted {
        subscription_end: Option<OffsetDateTime>,
        lifetime_discount_percent: i32,
    },
    AlreadyChosen,
}

#[derive(Debug, Clone)]
pub struct ReferralCredit {
    pub referrer_id: Uuid,
    pub referred_user_id: Uuid,
    pub reason: String,
    pub amount: i64,
    pub payment_label: String,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ---------------------------------------------------------------------
    // Users
    // ---------------------------------------------------------------------

    async fn insert_user(&self, user: &User) -> BillingResult<()>;

    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<User>>;

    /// Users with no active subscription (group consistency sweep)
    async fn users_without_active_subscription(&self) -> BillingResult<Vec<User>>;

    /// Users holding an active subscription (loyalty sweep)
    async fn users_with_active_subscription(&self) -> BillingResult<Vec<User>>;

    /// Store a saved payment method and enable auto-renew
    async fn save_payment_method(&self, user_id: Uuid, token: &str) -> BillingResult<()>;

    async fn set_recurring_active(&self, user_id: Uuid, active: bool) -> BillingResult<()>;

    /// Reset the streak only while auto-renew is still disabled; returns whether it changed
    async fn reset_autopay_streak_if_disabled(&self, user_id: Uuid) -> BillingResult<bool>;

    // ---------------------------------------------------------------------
    // Subscriptions
    // ---------------------------------------------------------------------

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>>;

    async fn active_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>>;

    async fn subscriptions_for_user(&self, user_id: Uuid) -> BillingResult<Vec<Subscription>>;

    /// Active subscriptions whose end date has passed
    async fn expired_active_subscriptions(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>>;

    /// Expired subscriptions due an automatic renewal attempt
    async fn autopay_candidates(
        &self,
        now: OffsetDateTime,
        max_failures: i32,
    ) -> BillingResult<Vec<Subscription>>;

    /// Reserve the next attempt by moving `next_retry_attempt_at` to `lease_until`
    async fn claim_renewal_attempt(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
        lease_until: OffsetDateTime,
    ) -> BillingResult<CasOutcome>;

    async fn record_autopay_failure(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
        fail_count: i32,
        next_retry_attempt_at: Option<OffsetDateTime>,
    ) -> BillingResult<CasOutcome>;

    /// Deactivate after a renewal attempt went through and clear the retry time
    async fn mark_awaiting_renewal(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
    ) -> BillingResult<CasOutcome>;

    /// Deactivate an expired subscription after group removal
    async fn deactivate_subscription(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
    ) -> BillingResult<CasOutcome>;

    // ---------------------------------------------------------------------
    // Payments
    // ---------------------------------------------------------------------

    /// Insert a pending payment; returns the existing row if the label is taken
    async fn insert_payment(&self, payment: NewPayment) -> BillingResult<PaymentRecord>;

    /// Attach the gateway id; no-op if the record already carries one
    async fn attach_transaction_id(
        &self,
        payment_id: Uuid,
        transaction_id: &str,
    ) -> BillingResult<bool>;

    async fn find_payment_by_label(&self, label: &str) -> BillingResult<Option<PaymentRecord>>;

    async fn find_payment_by_transaction(
        &self,
        transaction_id: &str,
    ) -> BillingResult<Option<PaymentRecord>>;

    /// Unconfirmed pending payments with a gateway id, created before `created_before`
    async fn stale_pending_payments(
        &self,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<PaymentRecord>>;

    async fn count_successful_payments(&self, user_id: Uuid) -> BillingResult<i64>;

    /// Confirm a payment as successful and apply its subscription change atomically
    async fn settle_payment_success(&self, settle: SettleSuccess) -> BillingResult<SettleOutcome>;

    /// Confirm a payment as failed; returns false if it was already confirmed
    async fn settle_payment_failed(&self, payment_id: Uuid) -> BillingResult<bool>;

    // ---------------------------------------------------------------------
    // Loyalty & referral
    // ---------------------------------------------------------------------

    async fn has_loyalty_event(
        &self,
        user_id: Uuid,
        level: LoyaltyLevel,
        kind: LoyaltyEventKind,
    ) -> BillingResult<bool>;

    /// Raise the user's level (never lowers it) and record `level_reached`.
    /// With `offer`, the level is also parked as the pending reward.
    /// Returns true only when this call recorded the level for the first time.
    async fn advance_loyalty_level(
        &self,
        user_id: Uuid,
        level: LoyaltyLevel,
        offer: bool,
        payload: serde_json::Value,
    ) -> BillingResult<bool>;

    /// Grant a benefit and record `benefit_chosen` as one unit
    async fn grant_loyalty_benefit(&self, grant: BenefitGrant) -> BillingResult<GrantOutcome>;

    async fn loyalty_events(&self, user_id: Uuid) -> BillingResult<Vec<LoyaltyEvent>>;

    /// Credit the referrer once per (referrer, referred, reason)
    async fn credit_referral(&self, credit: ReferralCredit) -> BillingResult<bool>;
}
