//! Job bodies run by the scheduler
//!
//! Each job goes through its own [`ScheduledTask`], so a tick that fires
//! while the previous one is still running (here or in another worker
//! process sharing the lock) is skipped.

use std::sync::Arc;
use std::time::Duration;

use clubpass_billing::{BillingService, InvariantChecker, JobLock, ScheduledTask};
use tracing::{error, info, warn};

pub const AUTOPAY_CRON: &str = "0 0 * * * *";
pub const GROUP_SYNC_CRON: &str = "0 */10 * * * *";
pub const PENDING_POLL_CRON: &str = "0 */5 * * * *";
pub const LOYALTY_CRON: &str = "0 15 2 * * *";
pub const INVARIANTS_CRON: &str = "0 30 3 * * *";
pub const HEARTBEAT_CRON: &str = "30 */5 * * * *";

/// Expired-but-active subscriptions older than two sweeps are a violation
pub const EXPIRY_GRACE: time::Duration = time::Duration::minutes(20);

/// Periodic work over one billing service
#[derive(Clone)]
pub struct Jobs {
    billing: BillingService,
    invariants: Option<Arc<InvariantChecker>>,
    autopay: ScheduledTask,
    group_sync: ScheduledTask,
    pending_poll: ScheduledTask,
    loyalty: ScheduledTask,
    invariant_check: ScheduledTask,
}

impl Jobs {
    pub fn new(
        billing: BillingService,
        invariants: Option<Arc<InvariantChecker>>,
        lock: Arc<dyn JobLock>,
    ) -> Self {
        Self {
            billing,
            invariants,
            autopay: ScheduledTask::new("autopay", lock.clone(), Duration::from_secs(50 * 60)),
            group_sync: ScheduledTask::new("group-sync", lock.clone(), Duration::from_secs(9 * 60)),
            pending_poll: ScheduledTask::new("pending-poll", lock.clone(), Duration::from_secs(4 * 60)),
            loyalty: ScheduledTask::new("loyalty", lock.clone(), Duration::from_secs(30 * 60)),
            invariant_check: ScheduledTask::new("invariants", lock, Duration::from_secs(10 * 60)),
        }
    }

    pub async fn run_autopay(&self) {
        let result = self
            .autopay
            .run(|| self.billing.autopay.run_cycle())
            .await;
        match result {
            Some(Ok(report)) => info!(
                candidates = report.candidates,
                renewed = report.renewed,
                pending = report.pending,
                failed = report.failed,
                exhausted = report.exhausted,
                errors = report.errors,
                "Autopay job complete"
            ),
            Some(Err(e)) => error!(error = %e, "Autopay job failed"),
            None => {}
        }
    }

    pub async fn run_group_sync(&self) {
        let result = self
            .group_sync
            .run(|| self.billing.group_sync.run_cycle())
            .await;
        match result {
            Some(Ok(report)) => info!(
                removed = report.removed.len(),
                errors = report.errors,
                "Group sync job complete"
            ),
            Some(Err(e)) => error!(error = %e, "Group sync job failed"),
            None => {}
        }
    }

    pub async fn run_pending_poll(&self) {
        let result = self
            .pending_poll
            .run(|| self.billing.poller.run_cycle())
            .await;
        if let Some(Err(e)) = result {
            error!(error = %e, "Pending payment poll failed");
        }
    }

    /// Offers tiers reached by tenure alone, between payments
    pub async fn run_loyalty(&self) {
        let result = self
            .loyalty
            .run(|| self.billing.loyalty.run_cycle())
            .await;
        match result {
            Some(Ok(report)) => info!(
                checked = report.checked,
                promoted = report.promoted,
                errors = report.errors,
                "Loyalty job complete"
            ),
            Some(Err(e)) => error!(error = %e, "Loyalty job failed"),
            None => {}
        }
    }

    /// Daily ledger check; violations go to operators
    pub async fn run_invariants(&self) {
        let Some(checker) = self.invariants.clone() else {
            return;
        };
        let result = self
            .invariant_check
            .run(|| async move { checker.run_all_checks().await })
            .await;
        match result {
            Some(Ok(summary)) => match summary.report() {
                Some(report) => {
                    warn!(
                        failed = summary.checks_failed,
                        violations = summary.violations.len(),
                        "Ledger invariants violated"
                    );
                    self.billing.notifier.notify_operators(&report).await;
                }
                None => info!(checks = summary.checks_run, "Ledger invariants hold"),
            },
            Some(Err(e)) => error!(error = %e, "Invariant check failed"),
            None => {}
        }
    }

    pub fn heartbeat() {
        info!("Worker heartbeat - all systems operational");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use clubpass_billing::testing::TestHarness;
    use clubpass_billing::{LedgerStore, LocalJobLock};
    use clubpass_shared::LoyaltyLevel;
    use time::OffsetDateTime;

    fn jobs(h: &TestHarness) -> Jobs {
        Jobs::new(h.service.clone(), None, Arc::new(LocalJobLock::new()))
    }

    #[tokio::test]
    async fn test_overlapping_autopay_ticks_charge_once() {
        let h = TestHarness::new();
        let user = h.add_user(1, true).await;
        let now = OffsetDateTime::now_utc();
        h.add_subscription(
            user.id,
            now - time::Duration::days(31),
            now - time::Duration::hours(1),
            true,
        )
        .await;
        let jobs = jobs(&h);

        tokio::join!(jobs.run_autopay(), jobs.run_autopay());

        assert_eq!(h.gateway.autopay_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_group_sync_removes_lapsed_member() {
        let h = TestHarness::new();
        let user = h.add_user(7, false).await;
        let now = OffsetDateTime::now_utc();
        let sub = h
            .add_subscription(
                user.id,
                now - time::Duration::days(31),
                now - time::Duration::hours(1),
                true,
            )
            .await;
        h.group.add_member(7);

        jobs(&h).run_group_sync().await;

        assert!(!h.group.contains(7));
        let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert!(!stored.is_active);
        assert!(!h.notifier.operator_messages().is_empty());
    }

    #[tokio::test]
    async fn test_loyalty_job_promotes_by_tenure() {
        let h = TestHarness::new();
        let user = h.add_user(9, false).await;
        let now = OffsetDateTime::now_utc();
        h.add_subscription(
            user.id,
            now - time::Duration::days(200),
            now + time::Duration::days(165),
            true,
        )
        .await;

        jobs(&h).run_loyalty().await;

        let stored = h.store.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(stored.current_loyalty_level, LoyaltyLevel::Gold);
    }

    #[tokio::test]
    async fn test_invariants_without_database_is_a_no_op() {
        let h = TestHarness::new();
        jobs(&h).run_invariants().await;
        assert!(h.notifier.operator_messages().is_empty());
    }
}
