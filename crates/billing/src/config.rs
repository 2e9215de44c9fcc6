//! Engine configuration and tariff table

use std::str::FromStr;

use clubpass_shared::parse_amount_minor;
use time::Duration;

use crate::error::{BillingError, BillingResult};

pub const DEFAULT_TARIFFS: &str = "30:990,90:2690,180:4990,365:8990";

/// A purchasable access period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tariff {
    pub days: i32,
    /// Minor currency units
    pub price: i64,
}

impl Tariff {
    /// Price after a percentage discount, rounded down to whole minor units
    pub fn discounted_price(&self, percent: i32) -> i64 {
        let percent = i64::from(percent.clamp(0, 100));
        self.price * (100 - percent) / 100
    }
}

/// Tariffs keyed by duration, parsed from `days:price` pairs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tariffs(Vec<Tariff>);

impl Tariffs {
    pub fn new(mut tariffs: Vec<Tariff>) -> Self {
        tariffs.sort_by_key(|t| t.days);
        Self(tariffs)
    }

    pub fn for_days(&self, days: i32) -> Option<Tariff> {
        self.0.iter().copied().find(|t| t.days == days)
    }

    pub fn all(&self) -> &[Tariff] {
        &self.0
    }
}

impl Default for Tariffs {
    fn default() -> Self {
        Self::new(vec![
            Tariff {
                days: 30,
                price: 99_000,
            },
            Tariff {
                days: 90,
                price: 269_000,
            },
            Tariff {
                days: 180,
                price: 499_000,
            },
            Tariff {
                days: 365,
                price: 899_000,
            },
        ])
    }
}

impl FromStr for Tariffs {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tariffs = Vec::new();
        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (days, price) = pair
                .split_once(':')
                .ok_or_else(|| BillingError::Config(format!("tariff '{}' is not days:price", pair)))?;
            let days: i32 = days
                .trim()
                .parse()
                .map_err(|_| BillingError::Config(format!("tariff '{}' has invalid days", pair)))?;
            let price = parse_amount_minor(price)
                .ok_or_else(|| BillingError::Config(format!("tariff '{}' has invalid price", pair)))?;
            if days <= 0 || price <= 0 {
                return Err(BillingError::Config(format!(
                    "tariff '{}' must be positive",
                    pair
                )));
            }
            if tariffs.iter().any(|t: &Tariff| t.days == days) {
                return Err(BillingError::Config(format!(
                    "tariff for {} days listed twice",
                    days
                )));
            }
            tariffs.push(Tariff { days, price });
        }
        if tariffs.is_empty() {
            return Err(BillingError::Config("TARIFFS is empty".to_string()));
        }
        Ok(Self::new(tariffs))
    }
}

/// Engine-wide knobs
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub tariffs: Tariffs,
    /// ISO currency code sent to the gateway
    pub currency: String,
    pub autopay_max_failures: i32,
    pub autopay_retry_cooldown: Duration,
    /// How long a claimed renewal attempt stays reserved before another worker may retry it
    pub renewal_lease: Duration,
    pub referral_bonus_percent: i64,
    pub pending_poll_after: Duration,
    pub pending_poll_batch: i64,
    /// Re-read attempts after a lost compare-and-set before giving up
    pub max_cas_retries: usize,
    pub group_invite_link: Option<String>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            tariffs: Tariffs::default(),
            currency: "RUB".to_string(),
            autopay_max_failures: 6,
            autopay_retry_cooldown: Duration::hours(12),
            renewal_lease: Duration::minutes(10),
            referral_bonus_percent: 10,
            pending_poll_after: Duration::minutes(15),
            pending_poll_batch: 100,
            max_cas_retries: 3,
            group_invite_link: None,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> BillingResult<T> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has invalid value '{}'", key, raw))),
        _ => Ok(default),
    }
}

impl BillingConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();

        let tariffs = match std::env::var("TARIFFS") {
            Ok(raw) if !raw.trim().is_empty() => raw.parse()?,
            _ => DEFAULT_TARIFFS.parse()?,
        };

        let max_failures: i32 = env_parse("AUTOPAY_MAX_FAILURES", defaults.autopay_max_failures)?;
        if max_failures < 1 {
            return Err(BillingError::Config(
                "AUTOPAY_MAX_FAILURES must be at least 1".to_string(),
            ));
        }

        let bonus: i64 = env_parse("REFERRAL_BONUS_PERCENT", defaults.referral_bonus_percent)?;
        if !(0..=100).contains(&bonus) {
            return Err(BillingError::Config(
                "REFERRAL_BONUS_PERCENT must be within 0..=100".to_string(),
            ));
        }

        Ok(Self {
            tariffs,
            currency: std::env::var("CURRENCY").unwrap_or(defaults.currency),
            autopay_max_failures: max_failures,
            autopay_retry_cooldown: Duration::hours(env_parse(
                "AUTOPAY_RETRY_COOLDOWN_HOURS",
                12_i64,
            )?),
            renewal_lease: defaults.renewal_lease,
            referral_bonus_percent: bonus,
            pending_poll_after: Duration::minutes(env_parse(
                "PENDING_PAYMENT_POLL_AFTER_MINUTES",
                15_i64,
            )?),
            pending_poll_batch: defaults.pending_poll_batch,
            max_cas_retries: defaults.max_cas_retries,
            group_invite_link: std::env::var("GROUP_INVITE_LINK")
                .ok()
                .filter(|l| !l.is_empty()),
        })
    }

    /// Referral bonus for a paid amount, in minor units
    pub fn referral_bonus(&self, amount: i64) -> i64 {
        amount * self.referral_bonus_percent / 100
    }
}
