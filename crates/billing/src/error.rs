//! Billing error types

use thiserror::Error;

use crate::client::GatewayError;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Payment not found: {0}")]
    PaymentNotFound(String),

    #[error("No tariff for {0} days")]
    UnknownTariff(i32),

    #[error("Webhook origin not allowed and signature missing or invalid")]
    WebhookUnauthorized,

    #[error("Malformed webhook payload: {0}")]
    WebhookMalformed(String),

    #[error("Group membership error: {0}")]
    Group(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Data inconsistency: {0}")]
    Inconsistent(String),

    #[error("Concurrent modification detected: {0}")]
    ConcurrentModification(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Transient failures the caller should retry (or let the gateway redeliver)
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::Database(_)
            | BillingError::Redis(_)
            | BillingError::ConcurrentModification(_) => true,
            BillingError::Gateway(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<redis::RedisError> for BillingError {
    fn from(err: redis::RedisError) -> Self {
        BillingError::Redis(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
