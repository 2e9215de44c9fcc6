//! Group synchronizer
//!
//! Pass A walks expired active subscriptions: it gives the autopay scheduler
//! one chance to renew, then removes the member and deactivates the
//! subscription. Pass B removes group members who hold no active
//! subscription at all. Removal happens before deactivation so a failed
//! removal leaves the row active for the next sweep to retry. A renewal
//! that lands between the two gets the member a fresh invite.

use std::sync::Arc;

use clubpass_shared::{Subscription, User};
use time::OffsetDateTime;

use crate::autopay::{AutopayScheduler, RenewalAttempt};
use crate::config::BillingConfig;
use crate::error::BillingResult;
use crate::group::GroupMembership;
use crate::notify::{Notification, Notifier};
use crate::store::{CasOutcome, LedgerStore};

const DEACTIVATE_ATTEMPTS: usize = 3;

/// Which pass removed a member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalPass {
    Expiry,
    Consistency,
}

impl RemovalPass {
    fn label(&self) -> &'static str {
        match self {
            RemovalPass::Expiry => "expired",
            RemovalPass::Consistency => "no subscription",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupSyncReport {
    pub expired_checked: usize,
    pub renewed_during_sweep: usize,
    pub removed: Vec<(i64, RemovalPass)>,
    pub errors: usize,
}

impl GroupSyncReport {
    pub fn removed_in(&self, pass: RemovalPass) -> Vec<i64> {
        self.removed
            .iter()
            .filter(|(_, p)| *p == pass)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Operator summary, one line per removal
    pub fn summary(&self) -> Option<String> {
        if self.removed.is_empty() {
            return None;
        }
        let mut text = format!("Group sync removed {} member(s):", self.removed.len());
        for (telegram_id, pass) in &self.removed {
            text.push_str(&format!("\n- {} ({})", telegram_id, pass.label()));
        }
        if self.errors > 0 {
            text.push_str(&format!("\n{} error(s), see logs", self.errors));
        }
        Some(text)
    }
}

pub struct GroupSynchronizer {
    store: Arc<dyn LedgerStore>,
    group: Arc<dyn GroupMembership>,
    autopay: Arc<AutopayScheduler>,
    notifier: Arc<dyn Notifier>,
    config: Arc<BillingConfig>,
}

impl GroupSynchronizer {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        group: Arc<dyn GroupMembership>,
        autopay: Arc<AutopayScheduler>,
        notifier: Arc<dyn Notifier>,
        config: Arc<BillingConfig>,
    ) -> Self {
        Self {
            store,
            group,
            autopay,
            notifier,
            config,
        }
    }

    pub async fn run_cycle(&self) -> BillingResult<GroupSyncReport> {
        self.run_cycle_at(OffsetDateTime::now_utc()).await
    }

    pub async fn run_cycle_at(&self, now: OffsetDateTime) -> BillingResult<GroupSyncReport> {
        let mut report = GroupSyncReport::default();

        self.expiry_pass(now, &mut report).await?;
        self.consistency_pass(now, &mut report).await?;

        if let Some(summary) = report.summary() {
            self.notifier.notify_operators(&summary).await;
        }
        tracing::info!(
            expired_checked = report.expired_checked,
            renewed = report.renewed_during_sweep,
            removed = report.removed.len(),
            errors = report.errors,
            "Group sync finished"
        );
        Ok(report)
    }

    async fn expiry_pass(&self, now: OffsetDateTime, report: &mut GroupSyncReport) -> BillingResult<()> {
        let expired = self.store.expired_active_subscriptions(now).await?;
        report.expired_checked = expired.len();

        for sub in expired {
            // Never attempted: let autopay decide first
            if sub.autopayment_fail_count == 0 && sub.next_retry_attempt_at.is_none() {
                match self.autopay.attempt_renewal(sub.id, now).await {
                    Ok(RenewalAttempt::Renewed | RenewalAttempt::Pending | RenewalAttempt::AlreadyRenewed) => {
                        report.renewed_during_sweep += 1;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(
                            subscription_id = %sub.id,
                            error = %e,
                            "Renewal attempt during sweep failed"
                        );
                    }
                }
            }

            let Some(current) = self.store.get_subscription(sub.id).await? else {
                continue;
            };
            if !current.is_active || !current.is_expired_at(now) {
                continue;
            }

            let Some(user) = self.store.get_user(current.user_id).await? else {
                tracing::error!(
                    subscription_id = %current.id,
                    user_id = %current.user_id,
                    "RECONCILIATION NEEDED: subscription owner missing"
                );
                report.errors += 1;
                continue;
            };

            if let Err(e) = self.group.remove_member(user.telegram_id).await {
                tracing::error!(
                    telegram_id = user.telegram_id,
                    error = %e,
                    "Failed to remove expired member; will retry next sweep"
                );
                report.errors += 1;
                continue;
            }

            match self.deactivate(current, now).await {
                Ok(true) => {
                    if let Err(e) = self.store.reset_autopay_streak_if_disabled(user.id).await {
                        tracing::error!(user_id = %user.id, error = %e, "Failed to reset autopay streak");
                    }
                    self.notifier
                        .notify_user(user.telegram_id, &Notification::AccessRevoked)
                        .await;
                    report.removed.push((user.telegram_id, RemovalPass::Expiry));
                }
                Ok(false) => {
                    self.readmit_if_renewed(&user, now).await;
                }
                Err(e) => {
                    tracing::error!(user_id = %user.id, error = %e, "Failed to deactivate subscription");
                    report.errors += 1;
                    self.readmit_if_renewed(&user, now).await;
                }
            }
        }
        Ok(())
    }

    /// After a removal, invite the member back if a renewal landed meanwhile.
    /// Returns true when an invite went out.
    async fn readmit_if_renewed(&self, user: &User, now: OffsetDateTime) -> bool {
        match self.store.active_subscription(user.id).await {
            Ok(Some(sub)) if sub.end_date > now => {
                tracing::warn!(
                    telegram_id = user.telegram_id,
                    subscription_id = %sub.id,
                    "Subscription renewed during removal, re-inviting member"
                );
                self.notifier
                    .notify_user(
                        user.telegram_id,
                        &Notification::Welcome {
                            end_date: sub.end_date,
                            invite_link: self.config.group_invite_link.clone(),
                        },
                    )
                    .await;
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::error!(
                    telegram_id = user.telegram_id,
                    error = %e,
                    "RECONCILIATION NEEDED: removed member may hold a renewed subscription"
                );
                false
            }
        }
    }

    /// Deactivate while the subscription is still active and expired.
    /// Returns true only for the write that flipped it.
    async fn deactivate(&self, mut sub: Subscription, now: OffsetDateTime) -> BillingResult<bool> {
        for _ in 0..DEACTIVATE_ATTEMPTS {
            match self.store.deactivate_subscription(sub.id, sub.version).await? {
                CasOutcome::Applied { .. } => {
                    tracing::info!(
                        subscription_id = %sub.id,
                        user_id = %sub.user_id,
                        "Expired subscription deactivated"
                    );
                    return Ok(true);
                }
                CasOutcome::Conflict => match self.store.get_subscription(sub.id).await? {
                    Some(fresh) if fresh.is_active && fresh.is_expired_at(now) => sub = fresh,
                    _ => return Ok(false),
                },
            }
        }
        Ok(false)
    }

    async fn consistency_pass(
        &self,
        now: OffsetDateTime,
        report: &mut GroupSyncReport,
    ) -> BillingResult<()> {
        let users = self.store.users_without_active_subscription().await?;

        for user in users {
            match self.group.is_member(user.telegram_id).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!(telegram_id = user.telegram_id, error = %e, "Membership check failed");
                    report.errors += 1;
                    continue;
                }
            }

            // A payment may have landed since the list was read
            if self.store.active_subscription(user.id).await?.is_some() {
                continue;
            }

            self.remove_drifted(&user, now, report).await;
        }
        Ok(())
    }

    async fn remove_drifted(&self, user: &User, now: OffsetDateTime, report: &mut GroupSyncReport) {
        match self.group.remove_member(user.telegram_id).await {
            Ok(()) => {
                if self.readmit_if_renewed(user, now).await {
                    return;
                }
                tracing::info!(
                    telegram_id = user.telegram_id,
                    "Removed group member without active subscription"
                );
                self.notifier
                    .notify_user(user.telegram_id, &Notification::AccessRevoked)
                    .await;
                report.removed.push((user.telegram_id, RemovalPass::Consistency));
            }
            Err(e) => {
                tracing::error!(telegram_id = user.telegram_id, error = %e, "Failed to remove drifted member");
                report.errors += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLedgerStore;
    use crate::testing::{FakeGroup, TestHarness};
    use crate::BillingService;
    use async_trait::async_trait;
    use time::macros::datetime;
    use time::Duration;

    const NOW: OffsetDateTime = datetime!(2026-05-01 12:00 UTC);

    #[tokio::test]
    async fn test_expired_without_autopay_is_removed_and_deactivated() {
        let h = TestHarness::new();
        let user = h.add_user(7, false).await;
        let sub = h
            .add_subscription(user.id, NOW - Duration::days(30), NOW - Duration::minutes(5), true)
            .await;
        h.group.add_member(7);

        let report = h.service.group_sync.run_cycle_at(NOW).await.unwrap();

        assert_eq!(report.removed_in(RemovalPass::Expiry), vec![7]);
        assert!(!h.group.contains(7));
        assert!(!h.store.get_subscription(sub.id).await.unwrap().unwrap().is_active);
        assert!(h
            .notifier
            .user_messages_for(7)
            .contains(&Notification::AccessRevoked));
        assert_eq!(h.notifier.operator_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_autopay_leaves_removal_to_consistency_pass() {
        let h = TestHarness::new();
        let user = h.add_user(7, true).await;
        let sub = h
            .add_subscription(user.id, NOW - Duration::days(30), NOW - Duration::minutes(5), true)
            .await;
        h.group.add_member(7);
        h.gateway.push_autopay_status("pay-1", "pending");

        let report = h.service.group_sync.run_cycle_at(NOW).await.unwrap();

        assert_eq!(report.renewed_during_sweep, 1);
        assert!(report.removed_in(RemovalPass::Expiry).is_empty());
        // Awaiting renewal is inactive, so the member drifts until the payment settles
        assert_eq!(report.removed_in(RemovalPass::Consistency), vec![7]);
        assert!(!h.group.contains(7));
        let sub = h.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert!(!sub.is_active);
    }

    #[tokio::test]
    async fn test_failed_removal_keeps_subscription_active() {
        let h = TestHarness::new();
        let user = h.add_user(7, false).await;
        let sub = h
            .add_subscription(user.id, NOW - Duration::days(30), NOW - Duration::minutes(5), true)
            .await;
        h.group.add_member(7);
        h.group.fail_removal_of(7);

        let report = h.service.group_sync.run_cycle_at(NOW).await.unwrap();

        assert_eq!(report.errors, 1);
        assert!(report.removed.is_empty());
        assert!(h.store.get_subscription(sub.id).await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_consistency_pass_removes_member_without_subscription() {
        let h = TestHarness::new();
        h.add_user(8, false).await;
        let paying = h.add_user(9, false).await;
        h.add_subscription(paying.id, NOW - Duration::days(1), NOW + Duration::days(29), true)
            .await;
        h.group.add_member(8);
        h.group.add_member(9);

        let report = h.service.group_sync.run_cycle_at(NOW).await.unwrap();

        assert_eq!(report.removed_in(RemovalPass::Consistency), vec![8]);
        assert!(h.group.contains(9));
    }

    #[tokio::test]
    async fn test_streak_reset_only_when_autorenew_disabled() {
        let h = TestHarness::new();
        let mut disabled = h.add_user(1, false).await;
        disabled.autopay_streak = 4;
        h.store.put_user(disabled.clone()).await;
        let mut enabled = h.add_user(2, true).await;
        enabled.autopay_streak = 4;
        h.store.put_user(enabled.clone()).await;

        h.add_subscription(disabled.id, NOW - Duration::days(30), NOW - Duration::hours(1), true)
            .await;
        // Failing autopay with retries left: removed from the group, streak kept
        h.add_failing_subscription(enabled.id, NOW - Duration::hours(1), 2, NOW + Duration::hours(6))
            .await;

        h.service.group_sync.run_cycle_at(NOW).await.unwrap();

        assert_eq!(h.store.get_user(disabled.id).await.unwrap().unwrap().autopay_streak, 0);
        assert_eq!(h.store.get_user(enabled.id).await.unwrap().unwrap().autopay_streak, 4);
    }

    /// Group whose removal races with a renewal written to the store
    struct RenewDuringRemoval {
        inner: Arc<FakeGroup>,
        store: Arc<MemoryLedgerStore>,
        renewed: Subscription,
    }

    #[async_trait]
    impl GroupMembership for RenewDuringRemoval {
        async fn is_member(&self, telegram_id: i64) -> BillingResult<bool> {
            self.inner.is_member(telegram_id).await
        }

        async fn remove_member(&self, telegram_id: i64) -> BillingResult<()> {
            self.inner.remove_member(telegram_id).await?;
            self.store.insert_subscription(self.renewed.clone()).await;
            Ok(())
        }

        async fn send_message(
            &self,
            chat_id: i64,
            text: &str,
            topic_id: Option<i64>,
        ) -> BillingResult<()> {
            self.inner.send_message(chat_id, text, topic_id).await
        }
    }

    #[tokio::test]
    async fn test_renewal_during_removal_reinvites_member() {
        let h = TestHarness::new();
        let user = h.add_user(7, false).await;
        let sub = h
            .add_subscription(user.id, NOW - Duration::days(30), NOW - Duration::minutes(5), true)
            .await;
        h.group.add_member(7);

        let mut renewed = sub.clone();
        renewed.end_date = NOW + Duration::days(30) - Duration::minutes(5);
        renewed.version += 1;
        let group = Arc::new(RenewDuringRemoval {
            inner: h.group.clone(),
            store: h.store.clone(),
            renewed: renewed.clone(),
        });
        let config = BillingConfig {
            group_invite_link: Some("https://t.me/+club".to_string()),
            ..BillingConfig::default()
        };
        let service = BillingService::new(
            h.store.clone(),
            h.gateway.clone(),
            group,
            h.notifier.clone(),
            config,
        );

        let report = service.group_sync.run_cycle_at(NOW).await.unwrap();

        assert!(report.removed.is_empty());
        let stored = h.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert!(stored.is_active);
        assert_eq!(stored.end_date, renewed.end_date);
        assert_eq!(
            h.notifier.user_messages_for(7),
            vec![Notification::Welcome {
                end_date: renewed.end_date,
                invite_link: Some("https://t.me/+club".to_string()),
            }]
        );
    }

    #[tokio::test]
    async fn test_no_summary_when_nothing_removed() {
        let h = TestHarness::new();
        let report = h.service.group_sync.run_cycle_at(NOW).await.unwrap();
        assert!(report.summary().is_none());
        assert!(h.notifier.operator_messages().is_empty());
    }
}
