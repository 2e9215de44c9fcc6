//! Ledger invariants
//!
//! Read-only consistency checks over the Postgres ledger. The worker runs
//! them daily and forwards violations to the operator chat; they can also
//! be run after a manual repair or a webhook replay.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub user_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money or access is wrong right now
    Critical,
    High,
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checked_at: OffsetDateTime, violations: Vec<InvariantViolation>) -> Self {
        let checks_run = InvariantChecker::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }

    /// Operator-facing report; `None` when everything passed
    pub fn report(&self) -> Option<String> {
        if self.healthy {
            return None;
        }
        let mut text = format!(
            "Ledger check: {} of {} invariants failed",
            self.checks_failed, self.checks_run
        );
        for v in &self.violations {
            text.push_str(&format!("\n[{}] {}: {}", v.severity, v.invariant, v.description));
        }
        Some(text)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleActiveRow {
    user_id: Uuid,
    active_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct ConfirmedPendingRow {
    id: Uuid,
    user_id: Uuid,
    payment_label: String,
}

#[derive(Debug, sqlx::FromRow)]
struct FailCountRow {
    id: Uuid,
    user_id: Uuid,
    autopayment_fail_count: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct StaleActiveRow {
    id: Uuid,
    user_id: Uuid,
    end_date: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct ReferralMismatchRow {
    user_id: Uuid,
    total_earned_referral: i64,
    credited: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateBenefitRow {
    user_id: Uuid,
    level: String,
    grants: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct UnrecordedLevelRow {
    user_id: Uuid,
    current_loyalty_level: String,
}

pub struct InvariantChecker {
    pool: PgPool,
    autopay_max_failures: i32,
    /// How long an expired subscription may stay active before it counts as missed
    expiry_grace: Duration,
}

impl InvariantChecker {
    pub fn new(pool: PgPool, autopay_max_failures: i32, expiry_grace: Duration) -> Self {
        Self {
            pool,
            autopay_max_failures,
            expiry_grace,
        }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_active_subscription().await?);
        violations.extend(self.check_confirmed_payment_terminal().await?);
        violations.extend(self.check_fail_count_within_cap().await?);
        violations.extend(self.check_expired_access_revoked(now).await?);
        violations.extend(self.check_referral_totals().await?);
        violations.extend(self.check_single_benefit_per_level().await?);
        violations.extend(self.check_loyalty_level_recorded().await?);

        let summary = InvariantCheckSummary::from_violations(now, violations);
        if summary.healthy {
            tracing::info!(checks = summary.checks_run, "Ledger invariants hold");
        } else {
            tracing::warn!(
                failed = summary.checks_failed,
                violations = summary.violations.len(),
                "Ledger invariant violations found"
            );
        }
        Ok(summary)
    }

    /// At most one active subscription per user
    async fn check_single_active_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleActiveRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) AS active_count
            FROM subscriptions
            WHERE is_active
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!("User has {} active subscriptions", row.active_count),
                context: serde_json::json!({ "active_count": row.active_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// A confirmed payment carries a terminal status
    async fn check_confirmed_payment_terminal(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ConfirmedPendingRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, payment_label
            FROM payment_records
            WHERE is_confirmed AND status = 'pending'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "confirmed_payment_terminal".to_string(),
                user_ids: vec![row.user_id],
                description: format!("Payment '{}' is confirmed but still pending", row.payment_label),
                context: serde_json::json!({
                    "payment_id": row.id,
                    "payment_label": row.payment_label,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_fail_count_within_cap(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<FailCountRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, autopayment_fail_count
            FROM subscriptions
            WHERE autopayment_fail_count > $1
            "#,
        )
        .bind(self.autopay_max_failures)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "fail_count_within_cap".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Subscription was charged {} times, cap is {}",
                    row.autopayment_fail_count, self.autopay_max_failures
                ),
                context: serde_json::json!({
                    "subscription_id": row.id,
                    "fail_count": row.autopayment_fail_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Expired subscriptions are deactivated by the group sweep within the grace period
    async fn check_expired_access_revoked(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleActiveRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, end_date
            FROM subscriptions
            WHERE is_active AND end_date < $1
            "#,
        )
        .bind(now - self.expiry_grace)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "expired_access_revoked".to_string(),
                user_ids: vec![row.user_id],
                description: format!("Subscription ended at {} but is still active", row.end_date),
                context: serde_json::json!({
                    "subscription_id": row.id,
                    "end_date": row.end_date,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Lifetime referral earnings equal the sum of recorded credits
    async fn check_referral_totals(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ReferralMismatchRow> = sqlx::query_as(
            r#"
            SELECT u.id AS user_id,
                   u.total_earned_referral,
                   COALESCE(SUM(r.amount), 0)::BIGINT AS credited
            FROM users u
            LEFT JOIN referral_credits r ON r.referrer_id = u.id
            GROUP BY u.id, u.total_earned_referral
            HAVING u.total_earned_referral <> COALESCE(SUM(r.amount), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "referral_totals".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Referral earnings {} differ from credited {}",
                    row.total_earned_referral, row.credited
                ),
                context: serde_json::json!({
                    "total_earned_referral": row.total_earned_referral,
                    "credited": row.credited,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// One `benefit_chosen` event per user and level
    async fn check_single_benefit_per_level(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateBenefitRow> = sqlx::query_as(
            r#"
            SELECT user_id, level, COUNT(*) AS grants
            FROM loyalty_events
            WHERE kind = 'benefit_chosen'
            GROUP BY user_id, level
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_benefit_per_level".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Benefit for level '{}' granted {} times",
                    row.level, row.grants
                ),
                context: serde_json::json!({ "level": row.level, "grants": row.grants }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_loyalty_level_recorded(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnrecordedLevelRow> = sqlx::query_as(
            r#"
            SELECT u.id AS user_id, u.current_loyalty_level
            FROM users u
            WHERE u.current_loyalty_level <> 'none'
              AND NOT EXISTS (
                  SELECT 1 FROM loyalty_events e
                  WHERE e.user_id = u.id
                    AND e.level = u.current_loyalty_level
                    AND e.kind = 'level_reached'
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "loyalty_level_recorded".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User holds level '{}' with no level_reached event",
                    row.current_loyalty_level
                ),
                context: serde_json::json!({ "level": row.current_loyalty_level }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_active_subscription" => self.check_single_active_subscription().await,
            "confirmed_payment_terminal" => self.check_confirmed_payment_terminal().await,
            "fail_count_within_cap" => self.check_fail_count_within_cap().await,
            "expired_access_revoked" => {
                self.check_expired_access_revoked(OffsetDateTime::now_utc()).await
            }
            "referral_totals" => self.check_referral_totals().await,
            "single_benefit_per_level" => self.check_single_benefit_per_level().await,
            "loyalty_level_recorded" => self.check_loyalty_level_recorded().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_active_subscription",
            "confirmed_payment_terminal",
            "fail_count_within_cap",
            "expired_access_revoked",
            "referral_totals",
            "single_benefit_per_level",
            "loyalty_level_recorded",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn violation(invariant: &str, severity: ViolationSeverity) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            user_ids: vec![Uuid::new_v4()],
            description: "broken".to_string(),
            context: serde_json::json!({}),
            severity,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 7);
        assert!(checks.contains(&"single_active_subscription"));
        assert!(checks.contains(&"fail_count_within_cap"));
    }

    #[test]
    fn test_summary_counts_failed_invariants_not_rows() {
        let summary = InvariantCheckSummary::from_violations(
            datetime!(2026-01-01 00:00 UTC),
            vec![
                violation("single_active_subscription", ViolationSeverity::Critical),
                violation("single_active_subscription", ViolationSeverity::Critical),
                violation("referral_totals", ViolationSeverity::Medium),
            ],
        );
        assert!(!summary.healthy);
        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 5);

        let report = summary.report().unwrap();
        assert!(report.starts_with("Ledger check: 2 of 7 invariants failed"));
        assert_eq!(report.lines().count(), 4);
    }

    #[test]
    fn test_healthy_summary_has_no_report() {
        let summary = InvariantCheckSummary::from_violations(datetime!(2026-01-01 00:00 UTC), vec![]);
        assert!(summary.healthy);
        assert!(summary.report().is_none());
    }
}
