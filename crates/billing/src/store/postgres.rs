//! Postgres ledger store
//!
//! Conditional writes use `WHERE version = $n` and report zero affected rows
//! as a conflict. Multi-row changes run in one transaction with the payment
//! row locked `FOR UPDATE`, so concurrent deliveries of the same payment
//! serialize on that lock.

use async_trait::async_trait;
use clubpass_shared::{
    LoyaltyEvent, LoyaltyEventKind, LoyaltyLevel, PaymentRecord, PaymentStatus, Subscription, User,
};
use sqlx::{PgPool, Postgres, Transaction};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use super::{
    BenefitChoice, BenefitGrant, CasOutcome, GrantOutcome, LedgerStore, NewPayment,
    ReferralCredit, SettleOutcome, SettleSuccess, SubscriptionChange,
};
use crate::error::{BillingError, BillingResult};

const USER_COLUMNS: &str = "id, telegram_id, is_recurring_active, payment_method_token, \
    autopay_streak, current_loyalty_level, pending_loyalty_reward, one_time_discount_percent, \
    lifetime_discount_percent, referral_balance, total_earned_referral, referrer_id";

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, start_date, end_date, is_active, \
    autopayment_fail_count, next_retry_attempt_at, renewal_price, renewal_duration_days, version";

const PAYMENT_COLUMNS: &str = "id, user_id, subscription_id, amount, status, payment_method, \
    transaction_id, payment_label, is_confirmed, days, created_at";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Ledger store backed by the Postgres schema in `migrations/`
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn cas(
        &self,
        sql: &str,
        subscription_id: Uuid,
        expected_version: i64,
    ) -> BillingResult<CasOutcome> {
        let row: Option<(i64,)> = sqlx::query_as(sql)
            .bind(subscription_id)
            .bind(expected_version)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some((version,)) => CasOutcome::Applied { version },
            None => CasOutcome::Conflict,
        })
    }

    async fn lock_payment(
        tx: &mut Transaction<'_, Postgres>,
        payment_id: Uuid,
    ) -> BillingResult<PaymentRecord> {
        let sql = format!(
            "SELECT {} FROM payment_records WHERE id = $1 FOR UPDATE",
            PAYMENT_COLUMNS
        );
        sqlx::query_as::<_, PaymentRecord>(&sql)
            .bind(payment_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| BillingError::PaymentNotFound(payment_id.to_string()))
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn insert_user(&self, user: &User) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO users (
                id, telegram_id, is_recurring_active, payment_method_token, autopay_streak,
                current_loyalty_level, pending_loyalty_reward, one_time_discount_percent,
                lifetime_discount_percent, referral_balance, total_earned_referral, referrer_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(user.id)
        .bind(user.telegram_id)
        .bind(user.is_recurring_active)
        .bind(&user.payment_method_token)
        .bind(user.autopay_streak)
        .bind(user.current_loyalty_level)
        .bind(user.pending_loyalty_reward)
        .bind(user.one_time_discount_percent)
        .bind(user.lifetime_discount_percent)
        .bind(user.referral_balance)
        .bind(user.total_earned_referral)
        .bind(user.referrer_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(BillingError::InvalidInput(format!(
                "telegram_id {} already registered",
                user.telegram_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS);
        Ok(sqlx::query_as::<_, User>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn users_without_active_subscription(&self) -> BillingResult<Vec<User>> {
        let sql = format!(
            "SELECT {} FROM users u WHERE NOT EXISTS \
             (SELECT 1 FROM subscriptions s WHERE s.user_id = u.id AND s.is_active)",
            USER_COLUMNS
        );
        Ok(sqlx::query_as::<_, User>(&sql)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn users_with_active_subscription(&self) -> BillingResult<Vec<User>> {
        let sql = format!(
            "SELECT {} FROM users u WHERE EXISTS \
             (SELECT 1 FROM subscriptions s WHERE s.user_id = u.id AND s.is_active)",
            USER_COLUMNS
        );
        Ok(sqlx::query_as::<_, User>(&sql)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn save_payment_method(&self, user_id: Uuid, token: &str) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE users SET payment_method_token = $2, is_recurring_active = TRUE WHERE id = $1",
        )
        .bind(user_id)
        .bind(token)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::UserNotFound(user_id.to_string()));
        }
        Ok(())
    }

    async fn set_recurring_active(&self, user_id: Uuid, active: bool) -> BillingResult<()> {
        let result = sqlx::query("UPDATE users SET is_recurring_active = $2 WHERE id = $1")
            .bind(user_id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::UserNotFound(user_id.to_string()));
        }
        Ok(())
    }

    async fn reset_autopay_streak_if_disabled(&self, user_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE users SET autopay_streak = 0 \
             WHERE id = $1 AND NOT is_recurring_active AND autopay_streak <> 0",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        );
        Ok(sqlx::query_as::<_, Subscription>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn active_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 AND is_active",
            SUBSCRIPTION_COLUMNS
        );
        Ok(sqlx::query_as::<_, Subscription>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn subscriptions_for_user(&self, user_id: Uuid) -> BillingResult<Vec<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 ORDER BY start_date",
            SUBSCRIPTION_COLUMNS
        );
        Ok(sqlx::query_as::<_, Subscription>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn expired_active_subscriptions(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE is_active AND end_date <= $1 ORDER BY end_date",
            SUBSCRIPTION_COLUMNS
        );
        Ok(sqlx::query_as::<_, Subscription>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn autopay_candidates(
        &self,
        now: OffsetDateTime,
        max_failures: i32,
    ) -> BillingResult<Vec<Subscription>> {
        let sql = format!(
            r#"
            SELECT {cols} FROM subscriptions s
            WHERE s.end_date <= $1
              AND s.autopayment_fail_count < $2
              AND (
                    (s.is_active AND s.next_retry_attempt_at IS NULL)
                 OR (s.next_retry_attempt_at IS NOT NULL AND s.next_retry_attempt_at <= $1)
              )
              AND EXISTS (
                    SELECT 1 FROM users u
                    WHERE u.id = s.user_id
                      AND u.is_recurring_active
                      AND COALESCE(u.payment_method_token, '') <> ''
              )
              AND NOT EXISTS (
                    SELECT 1 FROM subscriptions o
                    WHERE o.user_id = s.user_id AND o.is_active AND o.id <> s.id
              )
            ORDER BY s.end_date
            "#,
            cols = SUBSCRIPTION_COLUMNS
                .split(", ")
                .map(|c| format!("s.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(sqlx::query_as::<_, Subscription>(&sql)
            .bind(now)
            .bind(max_failures)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn claim_renewal_attempt(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
        lease_until: OffsetDateTime,
    ) -> BillingResult<CasOutcome> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET next_retry_attempt_at = $3, version = version + 1, updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING version
            "#,
        )
        .bind(subscription_id)
        .bind(expected_version)
        .bind(lease_until)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map_or(CasOutcome::Conflict, |(version,)| CasOutcome::Applied {
            version,
        }))
    }

    async fn record_autopay_failure(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
        fail_count: i32,
        next_retry_attempt_at: Option<OffsetDateTime>,
    ) -> BillingResult<CasOutcome> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET autopayment_fail_count = $3,
                next_retry_attempt_at = $4,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING version
            "#,
        )
        .bind(subscription_id)
        .bind(expected_version)
        .bind(fail_count)
        .bind(next_retry_attempt_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map_or(CasOutcome::Conflict, |(version,)| CasOutcome::Applied {
            version,
        }))
    }

    async fn mark_awaiting_renewal(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
    ) -> BillingResult<CasOutcome> {
        self.cas(
            r#"
            UPDATE subscriptions
            SET is_active = FALSE, next_retry_attempt_at = NULL,
                version = version + 1, updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING version
            "#,
            subscription_id,
            expected_version,
        )
        .await
    }

    async fn deactivate_subscription(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
    ) -> BillingResult<CasOutcome> {
        self.cas(
            r#"
            UPDATE subscriptions
            SET is_active = FALSE, version = version + 1, updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING version
            "#,
            subscription_id,
            expected_version,
        )
        .await
    }

    async fn insert_payment(&self, payment: NewPayment) -> BillingResult<PaymentRecord> {
        // Label is the idempotency key: a second insert returns the first row
        let sql = format!(
            r#"
            INSERT INTO payment_records (
                id, user_id, subscription_id, amount, status, payment_method,
                payment_label, is_confirmed, days, created_at
            )
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, FALSE, $7, $8)
            ON CONFLICT (payment_label) DO NOTHING
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        );
        let inserted = sqlx::query_as::<_, PaymentRecord>(&sql)
            .bind(Uuid::new_v4())
            .bind(payment.user_id)
            .bind(payment.subscription_id)
            .bind(payment.amount)
            .bind(payment.payment_method)
            .bind(&payment.payment_label)
            .bind(payment.days)
            .bind(payment.created_at)
            .fetch_optional(&self.pool)
            .await?;

        match inserted {
            Some(record) => Ok(record),
            None => self
                .find_payment_by_label(&payment.payment_label)
                .await?
                .ok_or_else(|| BillingError::PaymentNotFound(payment.payment_label.clone())),
        }
    }

    async fn attach_transaction_id(
        &self,
        payment_id: Uuid,
        transaction_id: &str,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE payment_records SET transaction_id = $2, updated_at = NOW() \
             WHERE id = $1 AND transaction_id IS NULL",
        )
        .bind(payment_id)
        .bind(transaction_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) => Ok(r.rows_affected() > 0),
            Err(e) if is_unique_violation(&e) => Err(BillingError::Inconsistent(format!(
                "transaction {} already linked to another payment",
                transaction_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_payment_by_label(&self, label: &str) -> BillingResult<Option<PaymentRecord>> {
        let sql = format!(
            "SELECT {} FROM payment_records WHERE payment_label = $1",
            PAYMENT_COLUMNS
        );
        Ok(sqlx::query_as::<_, PaymentRecord>(&sql)
            .bind(label)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_payment_by_transaction(
        &self,
        transaction_id: &str,
    ) -> BillingResult<Option<PaymentRecord>> {
        let sql = format!(
            "SELECT {} FROM payment_records WHERE transaction_id = $1",
            PAYMENT_COLUMNS
        );
        Ok(sqlx::query_as::<_, PaymentRecord>(&sql)
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn stale_pending_payments(
        &self,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<PaymentRecord>> {
        let sql = format!(
            "SELECT {} FROM payment_records \
             WHERE status = 'pending' AND NOT is_confirmed AND transaction_id IS NOT NULL \
               AND created_at < $1 \
             ORDER BY created_at LIMIT $2",
            PAYMENT_COLUMNS
        );
        Ok(sqlx::query_as::<_, PaymentRecord>(&sql)
            .bind(created_before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn count_successful_payments(&self, user_id: Uuid) -> BillingResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM payment_records WHERE user_id = $1 AND status = 'success'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn settle_payment_success(&self, settle: SettleSuccess) -> BillingResult<SettleOutcome> {
        let mut tx = self.pool.begin().await?;

        let payment = Self::lock_payment(&mut tx, settle.payment_id).await?;
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
                let sql = format!(
                    r#"
                    UPDATE subscriptions
                    SET end_date = GREATEST(end_date, $3),
                        renewal_price = $4,
                        renewal_duration_days = $5,
                        autopayment_fail_count = 0,
                        next_retry_attempt_at = NULL,
                        version = version + 1,
                        updated_at = NOW()
                    WHERE id = $1 AND version = $2 AND is_active
                    RETURNING {}
                    "#,
                    SUBSCRIPTION_COLUMNS
                );
                let updated = sqlx::query_as::<_, Subscription>(&sql)
                    .bind(subscription_id)
                    .bind(expected_version)
                    .bind(new_end)
                    .bind(renewal_price)
                    .bind(renewal_duration_days)
                    .fetch_optional(&mut *tx)
                    .await?;
                match updated {
                    Some(sub) => (sub, false),
                    None => return Ok(SettleOutcome::Conflict),
                }
            }
            SubscriptionChange::Create {
                start,
                end,
                renewal_price,
                renewal_duration_days,
            } => {
                sqlx::query(
                    r#"
                    UPDATE subscriptions
                    SET autopayment_fail_count = 0, next_retry_attempt_at = NULL,
                        version = version + 1, updated_at = NOW()
                    WHERE user_id = $1
                      AND (next_retry_attempt_at IS NOT NULL OR autopayment_fail_count <> 0)
                    "#,
                )
                .bind(payment.user_id)
                .execute(&mut *tx)
                .await?;

                let sql = format!(
                    r#"
                    INSERT INTO subscriptions (
                        id, user_id, start_date, end_date, is_active,
                        autopayment_fail_count, renewal_price, renewal_duration_days, version
                    )
                    VALUES ($1, $2, $3, $4, TRUE, 0, $5, $6, 0)
                    RETURNING {}
                    "#,
                    SUBSCRIPTION_COLUMNS
                );
                let inserted = sqlx::query_as::<_, Subscription>(&sql)
                    .bind(Uuid::new_v4())
                    .bind(payment.user_id)
                    .bind(start)
                    .bind(end)
                    .bind(renewal_price)
                    .bind(renewal_duration_days)
                    .fetch_one(&mut *tx)
                    .await;
                match inserted {
                    Ok(sub) => (sub, true),
                    // Partial unique index: another active subscription won the race
                    Err(e) if is_unique_violation(&e) => return Ok(SettleOutcome::Conflict),
                    Err(e) => return Err(e.into()),
                }
            }
        };

        sqlx::query(
            r#"
            UPDATE payment_records
            SET status = 'success', is_confirmed = TRUE, subscription_id = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(settle.payment_id)
        .bind(subscription.id)
        .execute(&mut *tx)
        .await?;

        if settle.increment_autopay_streak || settle.consume_one_time_discount {
            sqlx::query(
                r#"
                UPDATE users
                SET autopay_streak = autopay_streak + CASE WHEN $2 THEN 1 ELSE 0 END,
                    one_time_discount_percent =
                        CASE WHEN $3 THEN 0 ELSE one_time_discount_percent END
                WHERE id = $1
                "#,
            )
            .bind(payment.user_id)
            .bind(settle.increment_autopay_streak)
            .bind(settle.consume_one_time_discount)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(SettleOutcome::Settled {
            subscription,
            created,
        })
    }

    async fn settle_payment_failed(&self, payment_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payment_records
            SET status = 'failed', is_confirmed = TRUE, updated_at = NOW()
            WHERE id = $1 AND status = 'pending' AND NOT is_confirmed
            "#,
        )
        .bind(payment_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }
        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM payment_records WHERE id = $1")
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(BillingError::PaymentNotFound(payment_id.to_string())),
        }
    }

    async fn has_loyalty_event(
        &self,
        user_id: Uuid,
        level: LoyaltyLevel,
        kind: LoyaltyEventKind,
    ) -> BillingResult<bool> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM loyalty_events WHERE user_id = $1 AND level = $2 AND kind = $3",
        )
        .bind(user_id)
        .bind(level)
        .bind(kind)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn advance_loyalty_level(
        &self,
        user_id: Uuid,
        level: LoyaltyLevel,
        offer: bool,
        payload: serde_json::Value,
    ) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(LoyaltyLevel,)> =
            sqlx::query_as("SELECT current_loyalty_level FROM users WHERE id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
        let (current,) = current.ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;
        if current >= level {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE users
            SET current_loyalty_level = $2,
                pending_loyalty_reward = CASE WHEN $3 THEN $2 ELSE pending_loyalty_reward END
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(level)
        .bind(offer)
        .execute(&mut *tx)
        .await?;

        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO loyalty_events (id, user_id, kind, level, payload)
            VALUES ($1, $2, 'level_reached', $3, $4)
            ON CONFLICT (user_id, level, kind) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(level)
        .bind(payload)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted.is_some())
    }

    async fn grant_loyalty_benefit(&self, grant: BenefitGrant) -> BillingResult<GrantOutcome> {
        let mut tx = self.pool.begin().await?;

        let locked: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(grant.user_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(BillingError::UserNotFound(grant.user_id.to_string()));
        }

        // The unique index makes the audit row the claim
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO loyalty_events (id, user_id, kind, level, payload, created_at)
            VALUES ($1, $2, 'benefit_chosen', $3, $4, $5)
            ON CONFLICT (user_id, level, kind) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(grant.user_id)
        .bind(grant.level)
        .bind(&grant.payload)
        .bind(grant.now)
        .fetch_optional(&mut *tx)
        .await?;
        if claimed.is_none() {
            return Ok(GrantOutcome::AlreadyChosen);
        }

        let mut subscription_end = None;
        match grant.choice {
            BenefitChoice::Discount(percent) => {
                sqlx::query(
                    "UPDATE users SET lifetime_discount_percent = GREATEST(lifetime_discount_percent, $2) \
                     WHERE id = $1",
                )
                .bind(grant.user_id)
                .bind(percent)
                .execute(&mut *tx)
                .await?;
            }
            BenefitChoice::BonusDays(days) => {
                let bonus = Duration::days(i64::from(days));
                let extended: Option<(OffsetDateTime,)> = sqlx::query_as(
                    r#"
                    UPDATE subscriptions
                    SET end_date = GREATEST(end_date, $2) + make_interval(days => $3),
                        version = version + 1,
                        updated_at = NOW()
                    WHERE user_id = $1 AND is_active
                    RETURNING end_date
                    "#,
                )
                .bind(grant.user_id)
                .bind(grant.now)
                .bind(days)
                .fetch_optional(&mut *tx)
                .await?;

                subscription_end = match extended {
                    Some((end,)) => Some(end),
                    None => {
                        let (end,): (OffsetDateTime,) = sqlx::query_as(
                            r#"
                            INSERT INTO subscriptions (
                                id, user_id, start_date, end_date, is_active,
                                autopayment_fail_count, renewal_price, renewal_duration_days, version
                            )
                            VALUES ($1, $2, $3, $4, TRUE, 0, $5, $6, 0)
                            RETURNING end_date
                            "#,
                        )
                        .bind(Uuid::new_v4())
                        .bind(grant.user_id)
                        .bind(grant.now)
                        .bind(grant.now + bonus)
                        .bind(grant.promo_renewal_price)
                        .bind(grant.promo_renewal_days)
                        .fetch_one(&mut *tx)
                        .await?;
                        Some(end)
                    }
                };
            }
        }

        let (lifetime_discount_percent,): (i32,) = sqlx::query_as(
            r#"
            UPDATE users
            SET pending_loyalty_reward =
                CASE WHEN pending_loyalty_reward = $2 THEN NULL ELSE pending_loyalty_reward END
            WHERE id = $1
            RETURNING lifetime_discount_percent
            "#,
        )
        .bind(grant.user_id)
        .bind(grant.level)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(GrantOutcome::Granted {
            subscription_end,
            lifetime_discount_percent,
        })
    }

    async fn loyalty_events(&self, user_id: Uuid) -> BillingResult<Vec<LoyaltyEvent>> {
        Ok(sqlx::query_as::<_, LoyaltyEvent>(
            "SELECT id, user_id, kind, level, payload, created_at FROM loyalty_events \
             WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn credit_referral(&self, credit: ReferralCredit) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO referral_credits (id, referrer_id, referred_user_id, reason, amount, payment_label)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (referrer_id, referred_user_id, reason) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(credit.referrer_id)
        .bind(credit.referred_user_id)
        .bind(&credit.reason)
        .bind(credit.amount)
        .bind(&credit.payment_label)
        .fetch_optional(&mut *tx)
        .await?;
        if inserted.is_none() {
            return Ok(false);
        }

        let result = sqlx::query(
            r#"
            UPDATE users
            SET referral_balance = referral_balance + $2,
                total_earned_referral = total_earned_referral + $2
            WHERE id = $1
            "#,
        )
        .bind(credit.referrer_id)
        .bind(credit.amount)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::UserNotFound(credit.referrer_id.to_string()));
        }

        tx.commit().await?;
        Ok(true)
    }
}
