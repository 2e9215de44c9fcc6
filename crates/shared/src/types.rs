//! Ledger rows and enums shared across ClubPass

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Lifecycle status of a payment record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
        }
    }

    /// Terminal statuses never transition again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a payment was initiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    /// User went through the gateway's confirmation page
    Card,
    /// System-initiated charge against a stored payment method
    Autopay,
    /// Access granted without money changing hands
    Promo,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::Autopay => "autopay",
            PaymentMethod::Promo => "promo",
        }
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tenure-based loyalty tier. Declaration order is rank order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LoyaltyLevel {
    None,
    Silver,
    Gold,
    Platinum,
}

impl Default for LoyaltyLevel {
    fn default() -> Self {
        Self::None
    }
}

impl LoyaltyLevel {
    pub const ALL: [LoyaltyLevel; 4] = [
        LoyaltyLevel::None,
        LoyaltyLevel::Silver,
        LoyaltyLevel::Gold,
        LoyaltyLevel::Platinum,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LoyaltyLevel::None => "none",
            LoyaltyLevel::Silver => "silver",
            LoyaltyLevel::Gold => "gold",
            LoyaltyLevel::Platinum => "platinum",
        }
    }

    /// Minimum tenure in days required to hold this level
    pub fn threshold_days(&self) -> i64 {
        match self {
            LoyaltyLevel::None => 0,
            LoyaltyLevel::Silver => 90,
            LoyaltyLevel::Gold => 180,
            LoyaltyLevel::Platinum => 365,
        }
    }

    /// Highest level whose threshold is covered by `tenure_days`
    pub fn for_tenure(tenure_days: i64) -> Self {
        Self::ALL
            .iter()
            .rev()
            .copied()
            .find(|level| tenure_days >= level.threshold_days())
            .unwrap_or(LoyaltyLevel::None)
    }
}

impl std::fmt::Display for LoyaltyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LoyaltyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(LoyaltyLevel::None),
            "silver" => Ok(LoyaltyLevel::Silver),
            "gold" => Ok(LoyaltyLevel::Gold),
            "platinum" => Ok(LoyaltyLevel::Platinum),
            other => Err(format!("unknown loyalty level: {}", other)),
        }
    }
}

/// Kind of loyalty audit row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LoyaltyEventKind {
    LevelReached,
    BenefitChosen,
}

impl LoyaltyEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoyaltyEventKind::LevelReached => "level_reached",
            LoyaltyEventKind::BenefitChosen => "benefit_chosen",
        }
    }
}

// =============================================================================
// Rows
// =============================================================================

/// A time-boxed grant of group access
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub start_date: OffsetDateTime,
    pub end_date: OffsetDateTime,
    pub is_active: bool,
    pub autopayment_fail_count: i32,
    pub next_retry_attempt_at: Option<OffsetDateTime>,
    /// Price charged on automatic renewal, in minor currency units
    pub renewal_price: i64,
    pub renewal_duration_days: i32,
    /// Optimistic-concurrency counter, bumped by every conditional write
    pub version: i64,
}

impl Subscription {
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.end_date <= now
    }
}

/// One payment attempt, keyed by a locally-assigned label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Option<Uuid>,
    /// Amount in minor currency units
    pub amount: i64,
    pub status: PaymentStatus,
    pub payment_method: PaymentMethod,
    /// Gateway-assigned payment id
    pub transaction_id: Option<String>,
    /// Idempotency key assigned before the gateway is called
    pub payment_label: String,
    pub is_confirmed: bool,
    pub days: i32,
    pub created_at: OffsetDateTime,
}

/// Member of the community, with loyalty and referral ledgers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub telegram_id: i64,
    pub is_recurring_active: bool,
    pub payment_method_token: Option<String>,
    pub autopay_streak: i32,
    pub current_loyalty_level: LoyaltyLevel,
    pub pending_loyalty_reward: Option<LoyaltyLevel>,
    pub one_time_discount_percent: i32,
    pub lifetime_discount_percent: i32,
    /// Minor currency units
    pub referral_balance: i64,
    /// Minor currency units
    pub total_earned_referral: i64,
    pub referrer_id: Option<Uuid>,
}

impl User {
    /// A fresh user with every ledger at zero
    pub fn new(telegram_id: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            telegram_id,
            is_recurring_active: false,
            payment_method_token: None,
            autopay_streak: 0,
            current_loyalty_level: LoyaltyLevel::None,
            pending_loyalty_reward: None,
            one_time_discount_percent: 0,
            lifetime_discount_percent: 0,
            referral_balance: 0,
            total_earned_referral: 0,
            referrer_id: None,
        }
    }

    /// Whether the scheduler may charge this user without asking
    pub fn can_autopay(&self) -> bool {
        self.is_recurring_active
            && self
                .payment_method_token
                .as_deref()
                .is_some_and(|t| !t.is_empty())
    }

    /// Effective discount percent for the next payment
    pub fn discount_percent(&self) -> i32 {
        self.lifetime_discount_percent
            .max(self.one_time_discount_percent)
            .clamp(0, 100)
    }
}

/// Append-only loyalty audit row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct LoyaltyEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: LoyaltyEventKind,
    pub level: LoyaltyLevel,
    pub payload: serde_json::Value,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Money
// =============================================================================

/// Parse a gateway decimal amount ("990.00", "990", "990.5") into minor units
pub fn parse_amount_minor(value: &str) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() || value.starts_with('-') {
        return None;
    }

    let (whole, fraction) = match value.split_once('.') {
        Some((w, f)) => (w, f),
        None => (value, ""),
    };

    if whole.is_empty() || fraction.len() > 2 {
        return None;
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !fraction.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }

    let whole: i64 = whole.parse().ok()?;
    let fraction: i64 = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>().ok()? * 10,
        _ => fraction.parse().ok()?,
    };

    whole.checked_mul(100)?.checked_add(fraction)
}

/// Format minor units as a gateway decimal string with two places
pub fn format_amount_minor(amount: i64) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loyalty_level_ordering() {
        assert!(LoyaltyLevel::None < LoyaltyLevel::Silver);
        assert!(LoyaltyLevel::Silver < LoyaltyLevel::Gold);
        assert!(LoyaltyLevel::Gold < LoyaltyLevel::Platinum);
    }

    #[test]
    fn test_loyalty_level_for_tenure() {
        assert_eq!(LoyaltyLevel::for_tenure(0), LoyaltyLevel::None);
        assert_eq!(LoyaltyLevel::for_tenure(89), LoyaltyLevel::None);
        assert_eq!(LoyaltyLevel::for_tenure(90), LoyaltyLevel::Silver);
        assert_eq!(LoyaltyLevel::for_tenure(200), LoyaltyLevel::Gold);
        assert_eq!(LoyaltyLevel::for_tenure(365), LoyaltyLevel::Platinum);
        assert_eq!(LoyaltyLevel::for_tenure(5000), LoyaltyLevel::Platinum);
    }

    #[test]
    fn test_loyalty_level_parse() {
        assert_eq!("GOLD".parse::<LoyaltyLevel>(), Ok(LoyaltyLevel::Gold));
        assert!("diamond".parse::<LoyaltyLevel>().is_err());
    }

    #[test]
    fn test_parse_amount_minor() {
        assert_eq!(parse_amount_minor("990.00"), Some(99_000));
        assert_eq!(parse_amount_minor("990"), Some(99_000));
        assert_eq!(parse_amount_minor("990.5"), Some(99_050));
        assert_eq!(parse_amount_minor(" 12.34 "), Some(1_234));
        assert_eq!(parse_amount_minor("1.234"), None);
        assert_eq!(parse_amount_minor("-5.00"), None);
        assert_eq!(parse_amount_minor("abc"), None);
        assert_eq!(parse_amount_minor(".50"), None);
    }

    #[test]
    fn test_format_amount_minor() {
        assert_eq!(format_amount_minor(99_000), "990.00");
        assert_eq!(format_amount_minor(5), "0.05");
        assert_eq!(format_amount_minor(-150), "-1.50");
    }

    #[test]
    fn test_user_can_autopay() {
        let mut user = User::new(42);
        assert!(!user.can_autopay());

        user.is_recurring_active = true;
        assert!(!user.can_autopay(), "no token stored yet");

        user.payment_method_token = Some(String::new());
        assert!(!user.can_autopay(), "empty token is not a token");

        user.payment_method_token = Some("pm_123".to_string());
        assert!(user.can_autopay());
    }

    #[test]
    fn test_user_discount_percent_takes_larger() {
        let mut user = User::new(1);
        user.lifetime_discount_percent = 5;
        user.one_time_discount_percent = 20;
        assert_eq!(user.discount_percent(), 20);

        user.one_time_discount_percent = 0;
        assert_eq!(user.discount_percent(), 5);
    }
}
