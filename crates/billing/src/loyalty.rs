//! Loyalty tiers and referral credit
//!
//! Tenure is the number of calendar days covered by the union of the user's
//! subscription intervals, each clipped at `now`. Gaps do not count and
//! overlaps count once. Levels only move up; the `level_reached` and
//! `benefit_chosen` audit rows are the at-most-once guards.

use std::sync::Arc;

use clubpass_shared::{LoyaltyEventKind, LoyaltyLevel, PaymentRecord, Subscription, User};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::notify::{Notification, Notifier};
use crate::store::{BenefitChoice, BenefitGrant, GrantOutcome, LedgerStore, ReferralCredit};

pub const REFERRAL_REASON_FIRST_PAYMENT: &str = "first_payment";

/// `(discount percent, bonus days)` on offer at each level
pub fn benefits_for(level: LoyaltyLevel) -> (i32, i32) {
    match level {
        LoyaltyLevel::None => (0, 0),
        LoyaltyLevel::Silver => (5, 7),
        LoyaltyLevel::Gold => (10, 14),
        LoyaltyLevel::Platinum => (15, 30),
    }
}

/// Calendar days covered by the subscriptions up to `now`
pub fn tenure_days(subscriptions: &[Subscription], now: OffsetDateTime) -> i64 {
    let today = now.date();
    let mut spans: Vec<(Date, Date)> = subscriptions
        .iter()
        .filter_map(|s| {
            let start = s.start_date.date();
            let end = s.end_date.min(now).date().min(today);
            (end > start).then_some((start, end))
        })
        .collect();
    spans.sort();

    let mut total = 0_i64;
    let mut current: Option<(Date, Date)> = None;
    for (start, end) in spans {
        current = match current {
            Some((cs, ce)) if start <= ce => Some((cs, ce.max(end))),
            Some((cs, ce)) => {
                total += (ce - cs).whole_days();
                Some((start, end))
            }
            None => Some((start, end)),
        };
    }
    if let Some((cs, ce)) = current {
        total += (ce - cs).whole_days();
    }
    total
}

/// What the member picked from an offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenefitOption {
    Discount,
    BonusDays,
}

impl std::str::FromStr for BenefitOption {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discount" => Ok(BenefitOption::Discount),
            "bonus_days" | "days" => Ok(BenefitOption::BonusDays),
            other => Err(BillingError::InvalidInput(format!(
                "unknown benefit option '{}'",
                other
            ))),
        }
    }
}

/// Counters for one loyalty sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoyaltySweepReport {
    pub checked: usize,
    pub promoted: usize,
    pub errors: usize,
}

pub struct LoyaltyEngine {
    store: Arc<dyn LedgerStore>,
    notifier: Arc<dyn Notifier>,
    config: Arc<BillingConfig>,
}

impl LoyaltyEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        notifier: Arc<dyn Notifier>,
        config: Arc<BillingConfig>,
    ) -> Self {
        Self {
            store,
            notifier,
            config,
        }
    }

    pub async fn run_cycle(&self) -> BillingResult<LoyaltySweepReport> {
        self.run_cycle_at(OffsetDateTime::now_utc()).await
    }

    /// Re-evaluate every member holding an active subscription
    pub async fn run_cycle_at(&self, now: OffsetDateTime) -> BillingResult<LoyaltySweepReport> {
        let users = self.store.users_with_active_subscription().await?;
        let mut report = LoyaltySweepReport {
            checked: users.len(),
            ..Default::default()
        };

        for user in users {
            match self.evaluate_at(user.id, now).await {
                Ok(Some(_)) => report.promoted += 1,
                Ok(None) => {}
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(user_id = %user.id, error = %e, "Loyalty evaluation failed");
                }
            }
        }

        if report.promoted > 0 || report.errors > 0 {
            tracing::info!(
                checked = report.checked,
                promoted = report.promoted,
                errors = report.errors,
                "Loyalty sweep finished"
            );
        }
        Ok(report)
    }

    pub async fn evaluate(&self, user_id: Uuid) -> BillingResult<Option<LoyaltyLevel>> {
        self.evaluate_at(user_id, OffsetDateTime::now_utc()).await
    }

    /// Raise the user's level if tenure crossed a new threshold.
    /// Returns the level reached by this call, if any.
    pub async fn evaluate_at(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<LoyaltyLevel>> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;

        let subscriptions = self.store.subscriptions_for_user(user_id).await?;
        let tenure = tenure_days(&subscriptions, now);
        let target = LoyaltyLevel::for_tenure(tenure);
        if target <= user.current_loyalty_level {
            return Ok(None);
        }

        let already_chosen = self
            .store
            .has_loyalty_event(user_id, target, LoyaltyEventKind::BenefitChosen)
            .await?;
        let offer = !already_chosen;

        let payload = serde_json::json!({
            "tenure_days": tenure,
            "previous_level": user.current_loyalty_level,
        });
        let first_time = self
            .store
            .advance_loyalty_level(user_id, target, offer, payload)
            .await?;

        tracing::info!(
            user_id = %user_id,
            level = %target,
            tenure_days = tenure,
            first_time,
            "Loyalty level reached"
        );

        if first_time && offer {
            self.notifier
                .notify_user(user.telegram_id, &Notification::LoyaltyOffer { level: target })
                .await;
        }

        Ok(first_time.then_some(target))
    }

    pub async fn choose_benefit(
        &self,
        user_id: Uuid,
        level: LoyaltyLevel,
        option: BenefitOption,
    ) -> BillingResult<GrantOutcome> {
        self.choose_benefit_at(user_id, level, option, OffsetDateTime::now_utc())
            .await
    }

    /// Apply the picked benefit once per `(user, level)`
    pub async fn choose_benefit_at(
        &self,
        user_id: Uuid,
        level: LoyaltyLevel,
        option: BenefitOption,
        now: OffsetDateTime,
    ) -> BillingResult<GrantOutcome> {
        if level == LoyaltyLevel::None {
            return Err(BillingError::InvalidInput(
                "no benefit at level none".to_string(),
            ));
        }

        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;
        if user.current_loyalty_level < level {
            return Err(BillingError::InvalidInput(format!(
                "user holds {} and cannot claim {}",
                user.current_loyalty_level, level
            )));
        }

        if self
            .store
            .has_loyalty_event(user_id, level, LoyaltyEventKind::BenefitChosen)
            .await?
        {
            tracing::debug!(user_id = %user_id, level = %level, "Benefit already chosen");
            return Ok(GrantOutcome::AlreadyChosen);
        }

        let (discount, days) = benefits_for(level);
        let choice = match option {
            BenefitOption::Discount => BenefitChoice::Discount(discount),
            BenefitOption::BonusDays => BenefitChoice::BonusDays(days),
        };
        let promo = self
            .config
            .tariffs
            .all()
            .first()
            .copied()
            .unwrap_or(crate::config::Tariff {
                days: 30,
                price: 0,
            });

        let outcome = self
            .store
            .grant_loyalty_benefit(BenefitGrant {
                user_id,
                level,
                choice,
                payload: serde_json::json!({ "choice": format!("{:?}", choice) }),
                now,
                promo_renewal_price: promo.price,
                promo_renewal_days: promo.days,
            })
            .await?;

        if let GrantOutcome::Granted {
            subscription_end,
            lifetime_discount_percent,
        } = &outcome
        {
            let summary = match (choice, subscription_end) {
                (BenefitChoice::BonusDays(d), Some(end)) => {
                    format!("{} bonus days, access until {}", d, end.date())
                }
                _ => format!("lifetime discount {}%", lifetime_discount_percent),
            };
            tracing::info!(user_id = %user_id, level = %level, choice = ?choice, "Loyalty benefit granted");
            self.notifier
                .notify_user(
                    user.telegram_id,
                    &Notification::LoyaltyBenefitApplied { level, summary },
                )
                .await;
        }

        Ok(outcome)
    }

    /// Credit the referrer for the referred user's first successful payment
    pub async fn credit_referral(&self, user: &User, payment: &PaymentRecord) -> BillingResult<bool> {
        let Some(referrer_id) = user.referrer_id else {
            return Ok(false);
        };
        if self.store.count_successful_payments(user.id).await? != 1 {
            return Ok(false);
        }
        let amount = self.config.referral_bonus(payment.amount);
        if amount <= 0 {
            return Ok(false);
        }

        let credited = self
            .store
            .credit_referral(ReferralCredit {
                referrer_id,
                referred_user_id: user.id,
                reason: REFERRAL_REASON_FIRST_PAYMENT.to_string(),
                amount,
                payment_label: payment.payment_label.clone(),
            })
            .await?;

        if credited {
            tracing::info!(
                referrer_id = %referrer_id,
                referred_user_id = %user.id,
                amount,
                "Referral bonus credited"
            );
            if let Some(referrer) = self.store.get_user(referrer_id).await? {
                self.notifier
                    .notify_user(referrer.telegram_id, &Notification::ReferralCredited { amount })
                    .await;
            }
        }
        Ok(credited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestHarness;
    use time::macros::datetime;
    use time::Duration;

    fn sub(start: OffsetDateTime, days: i64) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            user_id: Uuid::nil(),
            start_date: start,
            end_date: start + Duration::days(days),
            is_active: false,
            autopayment_fail_count: 0,
            next_retry_attempt_at: None,
            renewal_price: 0,
            renewal_duration_days: 30,
            version: 0,
        }
    }

    #[test]
    fn test_tenure_ignores_gaps_and_future() {
        let now = datetime!(2026-06-01 12:00 UTC);
        let subs = vec![
            sub(datetime!(2026-01-01 00:00 UTC), 30),
            // lapse in February
            sub(datetime!(2026-03-01 00:00 UTC), 30),
            // still running: only days up to now count
            sub(datetime!(2026-05-20 00:00 UTC), 30),
        ];
        assert_eq!(tenure_days(&subs, now), 30 + 30 + 12);
    }

    #[test]
    fn test_tenure_counts_overlaps_once() {
        let now = datetime!(2026-12-31 00:00 UTC);
        let subs = vec![
            sub(datetime!(2026-01-01 00:00 UTC), 60),
            sub(datetime!(2026-01-31 00:00 UTC), 60),
        ];
        assert_eq!(tenure_days(&subs, now), 90);
    }

    #[test]
    fn test_benefit_table() {
        assert_eq!(benefits_for(LoyaltyLevel::Silver), (5, 7));
        assert_eq!(benefits_for(LoyaltyLevel::Gold), (10, 14));
        assert_eq!(benefits_for(LoyaltyLevel::Platinum), (15, 30));
    }

    #[tokio::test]
    async fn test_evaluate_offers_once() {
        let h = TestHarness::new();
        let now = datetime!(2026-06-01 00:00 UTC);
        let user = h.add_user(100, false).await;
        h.add_subscription(user.id, now - Duration::days(95), now + Duration::days(5), true)
            .await;

        let first = h.service.loyalty.evaluate_at(user.id, now).await.unwrap();
        let second = h.service.loyalty.evaluate_at(user.id, now).await.unwrap();

        assert_eq!(first, Some(LoyaltyLevel::Silver));
        assert_eq!(second, None);
        let offers = h
            .notifier
            .user_messages_for(100)
            .into_iter()
            .filter(|n| matches!(n, Notification::LoyaltyOffer { .. }))
            .count();
        assert_eq!(offers, 1);

        let user = h.store.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(user.current_loyalty_level, LoyaltyLevel::Silver);
        assert_eq!(user.pending_loyalty_reward, Some(LoyaltyLevel::Silver));
    }

    #[tokio::test]
    async fn test_sweep_promotes_mid_period_without_payment() {
        let h = TestHarness::new();
        let now = datetime!(2026-06-01 00:00 UTC);
        let member = h.add_user(100, false).await;
        h.add_subscription(member.id, now - Duration::days(200), now + Duration::days(165), true)
            .await;
        let lapsed = h.add_user(101, false).await;
        h.add_subscription(lapsed.id, now - Duration::days(300), now - Duration::days(10), false)
            .await;

        let report = h.service.loyalty.run_cycle_at(now).await.unwrap();
        let again = h.service.loyalty.run_cycle_at(now).await.unwrap();

        assert_eq!(report.checked, 1);
        assert_eq!(report.promoted, 1);
        assert_eq!(again.promoted, 0);
        let member = h.store.get_user(member.id).await.unwrap().unwrap();
        assert_eq!(member.current_loyalty_level, LoyaltyLevel::Gold);
        assert_eq!(
            h.notifier.user_messages_for(100),
            vec![Notification::LoyaltyOffer {
                level: LoyaltyLevel::Gold
            }]
        );
        let lapsed = h.store.get_user(lapsed.id).await.unwrap().unwrap();
        assert_eq!(lapsed.current_loyalty_level, LoyaltyLevel::None);
    }

    #[tokio::test]
    async fn test_choose_benefit_twice_grants_once() {
        let h = TestHarness::new();
        let now = datetime!(2026-06-01 00:00 UTC);
        let user = h.add_user(100, false).await;
        let sub = h
            .add_subscription(user.id, now - Duration::days(100), now + Duration::days(10), true)
            .await;
        h.service.loyalty.evaluate_at(user.id, now).await.unwrap();

        let first = h
            .service
            .loyalty
            .choose_benefit_at(user.id, LoyaltyLevel::Silver, BenefitOption::BonusDays, now)
            .await
            .unwrap();
        let second = h
            .service
            .loyalty
            .choose_benefit_at(user.id, LoyaltyLevel::Silver, BenefitOption::BonusDays, now)
            .await
            .unwrap();

        assert!(matches!(first, GrantOutcome::Granted { .. }));
        assert_eq!(second, GrantOutcome::AlreadyChosen);
        let sub = h.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(sub.end_date, now + Duration::days(17));

        let chosen = h
            .store
            .loyalty_events(user.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == LoyaltyEventKind::BenefitChosen)
            .count();
        assert_eq!(chosen, 1);
    }

    #[tokio::test]
    async fn test_discount_never_lowers_existing() {
        let h = TestHarness::new();
        let now = datetime!(2026-06-01 00:00 UTC);
        let mut user = h.add_user(100, false).await;
        user.lifetime_discount_percent = 8;
        user.current_loyalty_level = LoyaltyLevel::Silver;
        h.store.put_user(user.clone()).await;

        h.service
            .loyalty
            .choose_benefit_at(user.id, LoyaltyLevel::Silver, BenefitOption::Discount, now)
            .await
            .unwrap();

        let user = h.store.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(user.lifetime_discount_percent, 8);
    }

    #[tokio::test]
    async fn test_bonus_days_for_lapsed_user_open_promo_subscription() {
        let h = TestHarness::new();
        let now = datetime!(2026-06-01 00:00 UTC);
        let mut user = h.add_user(100, false).await;
        user.current_loyalty_level = LoyaltyLevel::Gold;
        h.store.put_user(user.clone()).await;

        let outcome = h
            .service
            .loyalty
            .choose_benefit_at(user.id, LoyaltyLevel::Gold, BenefitOption::BonusDays, now)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            GrantOutcome::Granted {
                subscription_end: Some(now + Duration::days(14)),
                lifetime_discount_percent: 0,
            }
        );
        let active = h.store.active_subscription(user.id).await.unwrap().unwrap();
        assert_eq!(active.start_date, now);
    }

    #[tokio::test]
    async fn test_cannot_claim_unreached_level() {
        let h = TestHarness::new();
        let user = h.add_user(100, false).await;

        let err = h
            .service
            .loyalty
            .choose_benefit(user.id, LoyaltyLevel::Platinum, BenefitOption::Discount)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }

    #[test]
    fn test_benefit_option_parse() {
        assert_eq!("discount".parse::<BenefitOption>().unwrap(), BenefitOption::Discount);
        assert_eq!("bonus_days".parse::<BenefitOption>().unwrap(), BenefitOption::BonusDays);
        assert!("cash".parse::<BenefitOption>().is_err());
    }
}
