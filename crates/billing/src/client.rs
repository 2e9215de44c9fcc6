//! Payment gateway client
//!
//! Talks to a YooKassa-style REST API: `POST /payments` creates a payment
//! (interactive or against a saved method), `GET /payments/{id}` reads its
//! status. Every create call carries the caller's payment label as the
//! `Idempotence-Key`, so a retried request can never charge twice.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use clubpass_shared::{format_amount_minor, parse_amount_minor};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Allowed clock skew for signed webhook timestamps, in seconds
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Free-form string metadata echoed back by the gateway
pub type Metadata = BTreeMap<String, String>;

/// Configuration for the payment gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_url: String,
    pub shop_id: String,
    pub secret_key: String,
    /// HMAC secret for signed webhooks; IP allowlisting alone when unset
    pub webhook_secret: Option<String>,
    pub return_url: String,
    pub currency: String,
    /// Per-attempt request timeout
    pub timeout: Duration,
    /// Retries after the first attempt, for retryable failures only
    pub max_retries: usize,
    pub retry_base_delay: Duration,
}

impl GatewayConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let timeout_secs: u64 = std::env::var("GATEWAY_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(15);
        let max_retries: usize = std::env::var("GATEWAY_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2);

        Ok(Self {
            api_url: std::env::var("GATEWAY_API_URL")
                .unwrap_or_else(|_| "https://api.yookassa.ru/v3".to_string()),
            shop_id: std::env::var("GATEWAY_SHOP_ID")
                .map_err(|_| BillingError::Config("GATEWAY_SHOP_ID not set".to_string()))?,
            secret_key: std::env::var("GATEWAY_SECRET_KEY")
                .map_err(|_| BillingError::Config("GATEWAY_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("GATEWAY_WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            return_url: std::env::var("GATEWAY_RETURN_URL")
                .unwrap_or_else(|_| "https://t.me".to_string()),
            currency: std::env::var("CURRENCY").unwrap_or_else(|_| "RUB".to_string()),
            timeout: Duration::from_secs(timeout_secs),
            max_retries,
            retry_base_delay: Duration::from_millis(200),
        })
    }
}

/// Gateway call failures
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("rate limited by gateway")]
    RateLimited,

    #[error("gateway server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("gateway rejected request {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected gateway response: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    /// Whether the same request may succeed if sent again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Transport(_)
                | GatewayError::Timeout
                | GatewayError::RateLimited
                | GatewayError::Server { .. }
        )
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout
        } else if err.is_decode() {
            GatewayError::InvalidResponse(err.to_string())
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

/// Payment status collapsed to what the engine acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    Succeeded,
    Pending,
    Failed,
}

impl GatewayStatus {
    /// Map the gateway's status string; unknown values are treated as still pending
    pub fn from_wire(status: &str) -> Self {
        match status {
            "succeeded" => GatewayStatus::Succeeded,
            "canceled" => GatewayStatus::Failed,
            _ => GatewayStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, GatewayStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedMethod {
    pub id: String,
    pub saved: bool,
}

/// A payment as the gateway reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayPayment {
    pub id: String,
    pub status: GatewayStatus,
    /// Minor currency units
    pub amount: i64,
    pub confirmation_url: Option<String>,
    pub payment_method: Option<SavedMethod>,
    pub metadata: Metadata,
    pub cancellation_reason: Option<String>,
}

/// Interactive payment request
#[derive(Debug, Clone)]
pub struct CreatePayment {
    pub amount: i64,
    pub description: String,
    pub idempotency_key: String,
    pub metadata: Metadata,
    pub save_payment_method: bool,
}

/// Charge against a stored payment method
#[derive(Debug, Clone)]
pub struct CreateAutopayment {
    pub amount: i64,
    pub description: String,
    pub idempotency_key: String,
    pub payment_method_id: String,
    pub metadata: Metadata,
}

/// Typed result of an autopayment attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutopayOutcome {
    Succeeded(GatewayPayment),
    Pending(GatewayPayment),
    Failed {
        payment_id: Option<String>,
        reason: String,
    },
    RetryableError(String),
}

impl AutopayOutcome {
    pub fn from_result(result: Result<GatewayPayment, GatewayError>) -> Self {
        match result {
            Ok(payment) => match payment.status {
                GatewayStatus::Succeeded => AutopayOutcome::Succeeded(payment),
                GatewayStatus::Pending => AutopayOutcome::Pending(payment),
                GatewayStatus::Failed => AutopayOutcome::Failed {
                    reason: payment
                        .cancellation_reason
                        .clone()
                        .unwrap_or_else(|| "canceled".to_string()),
                    payment_id: Some(payment.id),
                },
            },
            Err(e) if e.is_retryable() => AutopayOutcome::RetryableError(e.to_string()),
            Err(e) => AutopayOutcome::Failed {
                payment_id: None,
                reason: e.to_string(),
            },
        }
    }
}

/// Outbound gateway operations
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment(&self, request: &CreatePayment) -> Result<GatewayPayment, GatewayError>;

    async fn create_autopayment(
        &self,
        request: &CreateAutopayment,
    ) -> Result<GatewayPayment, GatewayError>;

    async fn get_payment(&self, payment_id: &str) -> Result<GatewayPayment, GatewayError>;
}

// =============================================================================
// Wire format
// =============================================================================

#[derive(Debug, Deserialize)]
pub(crate) struct WireAmount {
    pub value: String,
    #[allow(dead_code)]
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireSavedMethod {
    pub id: String,
    #[serde(default)]
    pub saved: bool,
}

#[derive(Debug, Deserialize)]
struct WireConfirmation {
    #[serde(default)]
    confirmation_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireCancellation {
    #[serde(default)]
    reason: Option<String>,
}

/// Payment object as it appears in API responses and webhook bodies
#[derive(Debug, Deserialize)]
pub(crate) struct WirePayment {
    pub id: String,
    pub status: String,
    pub amount: WireAmount,
    #[serde(default)]
    confirmation: Option<WireConfirmation>,
    #[serde(default)]
    pub payment_method: Option<WireSavedMethod>,
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    cancellation_details: Option<WireCancellation>,
}

/// Flatten JSON metadata into strings; nested values keep their JSON text
pub(crate) fn metadata_from_json(map: Option<serde_json::Map<String, serde_json::Value>>) -> Metadata {
    map.unwrap_or_default()
        .into_iter()
        .map(|(k, v)| {
            let v = match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (k, v)
        })
        .collect()
}

impl TryFrom<WirePayment> for GatewayPayment {
    type Error = GatewayError;

    fn try_from(wire: WirePayment) -> Result<Self, Self::Error> {
        let amount = parse_amount_minor(&wire.amount.value).ok_or_else(|| {
            GatewayError::InvalidResponse(format!("bad amount '{}'", wire.amount.value))
        })?;
        Ok(Self {
            status: GatewayStatus::from_wire(&wire.status),
            amount,
            confirmation_url: wire.confirmation.and_then(|c| c.confirmation_url),
            payment_method: wire.payment_method.map(|m| SavedMethod {
                id: m.id,
                saved: m.saved,
            }),
            metadata: metadata_from_json(wire.metadata),
            cancellation_reason: wire.cancellation_details.and_then(|c| c.reason),
            id: wire.id,
        })
    }
}

// =============================================================================
// HTTP client
// =============================================================================

/// reqwest-backed gateway client
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    /// Create a new gateway client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Self::new(GatewayConfig::from_env()?)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn amount_json(&self, amount: i64) -> serde_json::Value {
        serde_json::json!({
            "value": format_amount_minor(amount),
            "currency": self.config.currency,
        })
    }

    async fn send_once(
        &self,
        method: reqwest::Method,
        path: &str,
        idempotency_key: Option<&str>,
        body: Option<&serde_json::Value>,
    ) -> Result<GatewayPayment, GatewayError> {
        let url = format!("{}{}", self.config.api_url.trim_end_matches('/'), path);
        let mut request = self
            .http
            .request(method, &url)
            .basic_auth(&self.config.shop_id, Some(&self.config.secret_key));
        if let Some(key) = idempotency_key {
            request = request.header("Idempotence-Key", key);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = tokio::time::timeout(self.config.timeout, request.send())
            .await
            .map_err(|_| GatewayError::Timeout)??;

        let status = response.status();
        if status.is_success() {
            let wire: WirePayment = response.json().await?;
            return GatewayPayment::try_from(wire);
        }

        let message = response.text().await.unwrap_or_default();
        let code = status.as_u16();
        if code == 429 {
            Err(GatewayError::RateLimited)
        } else if status.is_server_error() {
            Err(GatewayError::Server {
                status: code,
                message,
            })
        } else {
            Err(GatewayError::Rejected {
                status: code,
                message,
            })
        }
    }

    /// Send with exponential backoff; only retryable failures are repeated
    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        idempotency_key: Option<&str>,
        body: Option<&serde_json::Value>,
    ) -> Result<GatewayPayment, GatewayError> {
        use tokio_retry::strategy::{jitter, ExponentialBackoff};
        use tokio_retry::Retry;

        let base_ms = self.config.retry_base_delay.as_millis().max(1) as u64;
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(base_ms)
            .max_delay(Duration::from_secs(5))
            .take(self.config.max_retries)
            .map(jitter);

        Retry::spawn(strategy, || async {
            let result = self
                .send_once(method.clone(), path, idempotency_key, body)
                .await;
            match &result {
                Ok(_) => Ok(result),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(path = %path, error = %e, "Gateway call failed - will retry");
                    Err(result)
                }
                Err(_) => Ok(result),
            }
        })
        .await
        .unwrap_or_else(|e| e)
    }
}

#[async_trait]
impl PaymentGateway for GatewayClient {
    async fn create_payment(&self, request: &CreatePayment) -> Result<GatewayPayment, GatewayError> {
        let body = serde_json::json!({
            "amount": self.amount_json(request.amount),
            "capture": true,
            "confirmation": {
                "type": "redirect",
                "return_url": self.config.return_url,
            },
            "description": request.description,
            "metadata": request.metadata,
            "save_payment_method": request.save_payment_method,
        });
        self.send(
            reqwest::Method::POST,
            "/payments",
            Some(&request.idempotency_key),
            Some(&body),
        )
        .await
    }

    async fn create_autopayment(
        &self,
        request: &CreateAutopayment,
    ) -> Result<GatewayPayment, GatewayError> {
        let body = serde_json::json!({
            "amount": self.amount_json(request.amount),
            "capture": true,
            "payment_method_id": request.payment_method_id,
            "description": request.description,
            "metadata": request.metadata,
        });
        self.send(
            reqwest::Method::POST,
            "/payments",
            Some(&request.idempotency_key),
            Some(&body),
        )
        .await
    }

    async fn get_payment(&self, payment_id: &str) -> Result<GatewayPayment, GatewayError> {
        let path = format!("/payments/{}", payment_id);
        self.send(reqwest::Method::GET, &path, None, None).await
    }
}

// =============================================================================
// Webhook signatures
// =============================================================================

/// Verify a `t=<unix>,v1=<hex>` signature header over `"{t}.{payload}"`
pub fn verify_webhook_signature(payload: &[u8], header: &str, secret: &str, now_unix: i64) -> bool {
    let mut timestamp: Option<i64> = None;
    let mut v1: Option<&str> = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => v1 = Some(value),
            _ => {}
        }
    }

    let (Some(timestamp), Some(v1)) = (timestamp, v1) else {
        return false;
    };
    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(timestamp, now = now_unix, "Webhook signature timestamp outside tolerance");
        return false;
    }
    let Ok(provided) = hex::decode(v1) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = mac.finalize().into_bytes();

    expected.as_slice().ct_eq(provided.as_slice()).into()
}

/// Build a signature header the way the gateway does (used by tests and tooling)
pub fn sign_webhook_payload(payload: &[u8], secret: &str, timestamp: i64) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| BillingError::Internal(format!("HMAC key error: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(api_url: String) -> GatewayConfig {
        GatewayConfig {
            api_url,
            shop_id: "shop".to_string(),
            secret_key: "secret".to_string(),
            webhook_secret: None,
            return_url: "https://t.me/club_bot".to_string(),
            currency: "RUB".to_string(),
            timeout: Duration::from_secs(5),
            max_retries: 2,
            retry_base_delay: Duration::from_millis(1),
        }
    }

    fn payment_body(id: &str, status: &str) -> String {
        serde_json::json!({
            "id": id,
            "status": status,
            "amount": {"value": "990.00", "currency": "RUB"},
            "confirmation": {"type": "redirect", "confirmation_url": "https://pay.example/c"},
            "payment_method": {"id": "pm-1", "saved": true},
            "metadata": {"payment_label": "lbl-1", "days": 30}
        })
        .to_string()
    }

    fn autopay_request() -> CreateAutopayment {
        CreateAutopayment {
            amount: 99_000,
            description: "Renewal".to_string(),
            idempotency_key: "autopay:sub:0".to_string(),
            payment_method_id: "pm-1".to_string(),
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(GatewayStatus::from_wire("succeeded"), GatewayStatus::Succeeded);
        assert_eq!(GatewayStatus::from_wire("pending"), GatewayStatus::Pending);
        assert_eq!(
            GatewayStatus::from_wire("waiting_for_capture"),
            GatewayStatus::Pending
        );
        assert_eq!(GatewayStatus::from_wire("canceled"), GatewayStatus::Failed);
    }

    #[tokio::test]
    async fn test_create_payment_sends_idempotence_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/payments")
            .match_header("idempotence-key", "lbl-1")
            .match_header("authorization", mockito::Matcher::Regex("^Basic ".to_string()))
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "amount": {"value": "990.00", "currency": "RUB"},
                "save_payment_method": true
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(payment_body("pay-1", "pending"))
            .create_async()
            .await;

        let client = GatewayClient::new(test_config(server.url())).unwrap();
        let payment = client
            .create_payment(&CreatePayment {
                amount: 99_000,
                description: "30 days".to_string(),
                idempotency_key: "lbl-1".to_string(),
                metadata: Metadata::new(),
                save_payment_method: true,
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(payment.id, "pay-1");
        assert_eq!(payment.status, GatewayStatus::Pending);
        assert_eq!(payment.amount, 99_000);
        assert_eq!(payment.confirmation_url.as_deref(), Some("https://pay.example/c"));
        assert_eq!(payment.metadata.get("days").map(String::as_str), Some("30"));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_then_reported() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/payments")
            .with_status(503)
            .with_body("unavailable")
            .expect(3)
            .create_async()
            .await;

        let client = GatewayClient::new(test_config(server.url())).unwrap();
        let outcome = AutopayOutcome::from_result(client.create_autopayment(&autopay_request()).await);

        mock.assert_async().await;
        assert!(matches!(outcome, AutopayOutcome::RetryableError(_)));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/payments")
            .with_status(400)
            .with_body(r#"{"code":"invalid_request"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = GatewayClient::new(test_config(server.url())).unwrap();
        let err = client.create_autopayment(&autopay_request()).await.unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, GatewayError::Rejected { status: 400, .. }));
        assert!(matches!(
            AutopayOutcome::from_result(Err(err)),
            AutopayOutcome::Failed { payment_id: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_canceled_autopayment_is_failed_outcome() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "id": "pay-9",
            "status": "canceled",
            "amount": {"value": "990.00", "currency": "RUB"},
            "cancellation_details": {"party": "payment_network", "reason": "insufficient_funds"}
        });
        server
            .mock("POST", "/payments")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let client = GatewayClient::new(test_config(server.url())).unwrap();
        let outcome = AutopayOutcome::from_result(client.create_autopayment(&autopay_request()).await);

        assert_eq!(
            outcome,
            AutopayOutcome::Failed {
                payment_id: Some("pay-9".to_string()),
                reason: "insufficient_funds".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_get_payment() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/payments/pay-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(payment_body("pay-1", "succeeded"))
            .create_async()
            .await;

        let client = GatewayClient::new(test_config(server.url())).unwrap();
        let payment = client.get_payment("pay-1").await.unwrap();

        assert_eq!(payment.status, GatewayStatus::Succeeded);
        assert_eq!(
            payment.payment_method,
            Some(SavedMethod {
                id: "pm-1".to_string(),
                saved: true
            })
        );
    }

    #[test]
    fn test_signature_roundtrip_and_tampering() {
        let payload = br#"{"event":"payment.succeeded"}"#;
        let header = sign_webhook_payload(payload, "whsec", 1_700_000_000).unwrap();

        assert!(verify_webhook_signature(payload, &header, "whsec", 1_700_000_010));
        assert!(!verify_webhook_signature(payload, &header, "other", 1_700_000_010));
        assert!(!verify_webhook_signature(b"{}", &header, "whsec", 1_700_000_010));
    }

    #[test]
    fn test_signature_rejects_stale_and_malformed_headers() {
        let payload = b"{}";
        let header = sign_webhook_payload(payload, "whsec", 1_700_000_000).unwrap();

        assert!(!verify_webhook_signature(payload, &header, "whsec", 1_700_000_000 + 301));
        assert!(!verify_webhook_signature(payload, "v1=abcd", "whsec", 1_700_000_000));
        assert!(!verify_webhook_signature(payload, "t=1700000000,v1=zz", "whsec", 1_700_000_000));
    }
}
