//! User and operator notifications
//!
//! Delivery is fire-and-forget: senders log failures and report `false`,
//! they never return an error into the code path that triggered them.

use async_trait::async_trait;
use clubpass_shared::{format_amount_minor, LoyaltyLevel};
use time::macros::format_description;
use time::OffsetDateTime;

use crate::loyalty::benefits_for;

/// Messages sent to a member
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// New subscription opened; carries the invite link when configured
    Welcome {
        end_date: OffsetDateTime,
        invite_link: Option<String>,
    },
    /// Existing subscription extended
    Renewed { end_date: OffsetDateTime, days: i32 },
    /// Automatic renewal gave up after the retry cap
    AutopayExhausted { attempts: i32 },
    /// Removed from the group because access lapsed
    AccessRevoked,
    /// A new loyalty level was reached and a benefit can be picked
    LoyaltyOffer { level: LoyaltyLevel },
    /// A picked loyalty benefit was applied
    LoyaltyBenefitApplied { level: LoyaltyLevel, summary: String },
    /// Referral bonus landed on the balance
    ReferralCredited { amount: i64 },
}

fn format_date(date: OffsetDateTime) -> String {
    date.format(format_description!("[day].[month].[year]"))
        .unwrap_or_else(|_| date.date().to_string())
}

impl Notification {
    /// Plain-text body
    pub fn render(&self) -> String {
        match self {
            Notification::Welcome {
                end_date,
                invite_link,
            } => {
                let mut text = format!(
                    "Payment received. Your access is active until {}.",
                    format_date(*end_date)
                );
                if let Some(link) = invite_link {
                    text.push_str(&format!("\nJoin the group: {}", link));
                }
                text
            }
            Notification::Renewed { end_date, days } => format!(
                "Subscription extended by {} days. Active until {}.",
                days,
                format_date(*end_date)
            ),
            Notification::AutopayExhausted { attempts } => format!(
                "We could not renew your subscription automatically after {} attempts. \
                 Auto-renewal stays on; pay manually any time to restore access.",
                attempts
            ),
            Notification::AccessRevoked => {
                "Your subscription has ended and you were removed from the group. \
                 Renew to get back in."
                    .to_string()
            }
            Notification::LoyaltyOffer { level } => {
                let (discount, days) = benefits_for(*level);
                format!(
                    "You reached {} status! Choose your reward: a permanent {}% discount \
                     or {} bonus days.",
                    level, discount, days
                )
            }
            Notification::LoyaltyBenefitApplied { level, summary } => {
                format!("{} reward applied: {}.", level, summary)
            }
            Notification::ReferralCredited { amount } => format!(
                "Your friend joined the club. {} added to your referral balance.",
                format_amount_minor(*amount)
            ),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send to one member by Telegram id; returns whether it was delivered
    async fn notify_user(&self, telegram_id: i64, notification: &Notification) -> bool;

    /// Send to every configured operator chat
    async fn notify_operators(&self, text: &str) -> bool;
}

/// Notifier that only logs, for deployments without a bot token
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_user(&self, telegram_id: i64, notification: &Notification) -> bool {
        tracing::info!(
            telegram_id,
            notification = ?notification,
            "Notifications disabled, skipping user message"
        );
        false
    }

    async fn notify_operators(&self, text: &str) -> bool {
        tracing::info!(text_len = text.len(), "Notifications disabled, skipping operator message");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_welcome_includes_invite_link() {
        let text = Notification::Welcome {
            end_date: datetime!(2026-02-01 00:00 UTC),
            invite_link: Some("https://t.me/+abc".to_string()),
        }
        .render();
        assert!(text.contains("01.02.2026"));
        assert!(text.contains("https://t.me/+abc"));
    }

    #[test]
    fn test_loyalty_offer_lists_both_choices() {
        let text = Notification::LoyaltyOffer {
            level: LoyaltyLevel::Gold,
        }
        .render();
        assert!(text.contains("gold"));
        assert!(text.contains("10%"));
        assert!(text.contains("14 bonus days"));
    }

    #[test]
    fn test_referral_amount_formatting() {
        let text = Notification::ReferralCredited { amount: 9_900 }.render();
        assert!(text.contains("99.00"));
    }
}
