//! Gateway webhook ingestion
//!
//! Authenticates an inbound notification (allow-listed origin OR valid
//! signature), parses it and hands it to the reconciler exactly once.
//! Deduplication is the reconciler's job: the same payment may arrive any
//! number of times.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use time::OffsetDateTime;

use crate::client::{verify_webhook_signature, GatewayPayment, GatewayStatus, WirePayment};
use crate::error::{BillingError, BillingResult};
use crate::reconciler::{ApplyOutcome, PaymentEvent, PaymentReconciler};

/// Published notification source ranges of the gateway
pub const DEFAULT_ALLOWED_NETWORKS: &[&str] = &[
    "185.71.76.0/27",
    "185.71.77.0/27",
    "77.75.153.0/25",
    "77.75.156.11",
    "77.75.156.35",
    "77.75.154.128/25",
    "2a02:5180::/32",
];

/// An address range in CIDR notation; a bare address is a single-host range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix: u8,
}

impl IpNetwork {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix))
                    .unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            (IpAddr::V4(_), IpAddr::V6(ip)) => ip
                .to_ipv4_mapped()
                .is_some_and(|v4| self.contains(IpAddr::V4(v4))),
            _ => false,
        }
    }
}

impl FromStr for IpNetwork {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || BillingError::Config(format!("invalid network '{}'", s));
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (
                addr.parse::<IpAddr>().map_err(|_| invalid())?,
                Some(prefix.parse::<u8>().map_err(|_| invalid())?),
            ),
            None => (s.parse::<IpAddr>().map_err(|_| invalid())?, None),
        };
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = prefix.unwrap_or(max);
        if prefix > max {
            return Err(invalid());
        }
        Ok(Self { addr, prefix })
    }
}

/// How inbound notifications are authenticated
#[derive(Debug, Clone)]
pub struct WebhookAuth {
    pub allowed_networks: Vec<IpNetwork>,
    pub signing_secret: Option<String>,
}

impl WebhookAuth {
    pub fn new(allowed_networks: Vec<IpNetwork>, signing_secret: Option<String>) -> Self {
        Self {
            allowed_networks,
            signing_secret,
        }
    }

    /// `GATEWAY_ALLOWED_IPS` (comma list) overrides the published ranges
    pub fn from_env() -> BillingResult<Self> {
        let networks = match std::env::var("GATEWAY_ALLOWED_IPS") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(str::parse)
                .collect::<BillingResult<Vec<_>>>()?,
            _ => DEFAULT_ALLOWED_NETWORKS
                .iter()
                .map(|s| s.parse())
                .collect::<BillingResult<Vec<_>>>()?,
        };
        let secret = std::env::var("GATEWAY_WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.is_empty());
        Ok(Self::new(networks, secret))
    }

    pub fn origin_allowed(&self, origin: Option<IpAddr>) -> bool {
        origin.is_some_and(|ip| self.allowed_networks.iter().any(|n| n.contains(ip)))
    }

    pub fn signature_valid(&self, payload: &[u8], signature: Option<&str>, now_unix: i64) -> bool {
        match (&self.signing_secret, signature) {
            (Some(secret), Some(header)) => verify_webhook_signature(payload, header, secret, now_unix),
            _ => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WebhookBody {
    event: String,
    object: WirePayment,
}

/// Notification kinds the engine acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEventType {
    PaymentSucceeded,
    PaymentCanceled,
    Other,
}

impl WebhookEventType {
    fn from_wire(event: &str) -> Self {
        match event {
            "payment.succeeded" => WebhookEventType::PaymentSucceeded,
            "payment.canceled" => WebhookEventType::PaymentCanceled,
            _ => WebhookEventType::Other,
        }
    }
}

/// Parse a notification body; the event name decides the terminal status
pub fn parse_notification(body: &[u8]) -> BillingResult<(WebhookEventType, String, PaymentEvent)> {
    let parsed: WebhookBody = serde_json::from_slice(body)
        .map_err(|e| BillingError::WebhookMalformed(e.to_string()))?;
    let event_type = WebhookEventType::from_wire(&parsed.event);
    let mut payment = GatewayPayment::try_from(parsed.object)
        .map_err(|e| BillingError::WebhookMalformed(e.to_string()))?;
    match event_type {
        WebhookEventType::PaymentSucceeded => payment.status = GatewayStatus::Succeeded,
        WebhookEventType::PaymentCanceled => payment.status = GatewayStatus::Failed,
        WebhookEventType::Other => {}
    }
    Ok((event_type, parsed.event, PaymentEvent::from(payment)))
}

fn redact(id: &str) -> String {
    let tail: String = id
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("…{}", tail)
}

/// Result of an accepted notification (always answered with 200)
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Reconciled(ApplyOutcome),
    /// Event type the engine does not act on
    Ignored(String),
    /// Reconciler refused for a business reason; not worth a redelivery
    Rejected(String),
}

pub struct WebhookIngestor {
    reconciler: Arc<PaymentReconciler>,
    auth: WebhookAuth,
}

impl WebhookIngestor {
    pub fn new(reconciler: Arc<PaymentReconciler>, auth: WebhookAuth) -> Self {
        Self { reconciler, auth }
    }

    pub fn auth(&self) -> &WebhookAuth {
        &self.auth
    }

    pub async fn ingest(
        &self,
        body: &[u8],
        signature: Option<&str>,
        origin: Option<IpAddr>,
    ) -> BillingResult<IngestOutcome> {
        self.ingest_at(body, signature, origin, OffsetDateTime::now_utc())
            .await
    }

    /// Authenticate, parse and reconcile one notification.
    ///
    /// Errors: `WebhookUnauthorized` (403), `WebhookMalformed` (400), or a
    /// retryable storage error (5xx, so the gateway redelivers).
    pub async fn ingest_at(
        &self,
        body: &[u8],
        signature: Option<&str>,
        origin: Option<IpAddr>,
        now: OffsetDateTime,
    ) -> BillingResult<IngestOutcome> {
        let origin_ok = self.auth.origin_allowed(origin);
        let signature_ok =
            !origin_ok && self.auth.signature_valid(body, signature, now.unix_timestamp());

        if !origin_ok && !signature_ok {
            let parsed = parse_notification(body).ok();
            tracing::warn!(
                origin = ?origin,
                body_len = body.len(),
                has_signature = signature.is_some(),
                event = ?parsed.as_ref().map(|(_, name, _)| name.clone()),
                payment = ?parsed.as_ref().map(|(_, _, e)| redact(&e.gateway_payment_id)),
                "Rejected webhook: origin not allowed and signature invalid"
            );
            return Err(BillingError::WebhookUnauthorized);
        }

        let (event_type, event_name, event) = match parse_notification(body) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(origin = ?origin, body_len = body.len(), error = %e, "Malformed webhook");
                return Err(e);
            }
        };

        if event_type == WebhookEventType::Other {
            tracing::debug!(event = %event_name, "Ignoring webhook event");
            return Ok(IngestOutcome::Ignored(event_name));
        }

        tracing::info!(
            event = %event_name,
            payment = %redact(&event.gateway_payment_id),
            via_signature = signature_ok,
            "Webhook accepted"
        );

        match self.reconciler.apply_at(&event, now).await {
            Ok(outcome) => Ok(IngestOutcome::Reconciled(outcome)),
            Err(e) if e.is_retryable() => {
                tracing::error!(
                    payment = %redact(&event.gateway_payment_id),
                    error = %e,
                    "Webhook reconciliation failed, asking gateway to redeliver"
                );
                Err(e)
            }
            Err(e) => {
                tracing::error!(
                    payment = %redact(&event.gateway_payment_id),
                    error = %e,
                    "Webhook reconciliation rejected"
                );
                Ok(IngestOutcome::Rejected(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::sign_webhook_payload;
    use crate::testing::TestHarness;
    use clubpass_shared::PaymentMethod;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2026-03-01 10:00 UTC);

    fn allowed() -> IpAddr {
        "185.71.76.5".parse().unwrap()
    }

    fn stranger() -> IpAddr {
        "203.0.113.9".parse().unwrap()
    }

    #[test]
    fn test_ip_network_contains() {
        let net: IpNetwork = "185.71.76.0/27".parse().unwrap();
        assert!(net.contains("185.71.76.31".parse().unwrap()));
        assert!(!net.contains("185.71.76.32".parse().unwrap()));

        let host: IpNetwork = "77.75.156.11".parse().unwrap();
        assert!(host.contains("77.75.156.11".parse().unwrap()));
        assert!(!host.contains("77.75.156.12".parse().unwrap()));

        let v6: IpNetwork = "2a02:5180::/32".parse().unwrap();
        assert!(v6.contains("2a02:5180:0:1::1".parse().unwrap()));
        assert!(!v6.contains("2a02:5181::1".parse().unwrap()));

        let mapped: IpAddr = "::ffff:185.71.76.1".parse().unwrap();
        assert!(net.contains(mapped));
    }

    #[test]
    fn test_ip_network_rejects_bad_prefix() {
        assert!("10.0.0.0/33".parse::<IpNetwork>().is_err());
        assert!("not-an-ip".parse::<IpNetwork>().is_err());
    }

    #[test]
    fn test_parse_notification() {
        let body = TestHarness::webhook_body("payment.succeeded", "pay-1", "lbl-1", "990.00");
        let (kind, name, event) = parse_notification(&body).unwrap();
        assert_eq!(kind, WebhookEventType::PaymentSucceeded);
        assert_eq!(name, "payment.succeeded");
        assert_eq!(event.amount, 99_000);
        assert_eq!(event.payment_label(), Some("lbl-1"));
        assert!(parse_notification(b"{\"event\":1}").is_err());
    }

    #[tokio::test]
    async fn test_unknown_origin_without_signature_is_rejected() {
        let h = TestHarness::new();
        let body = TestHarness::webhook_body("payment.succeeded", "pay-1", "lbl-1", "990.00");

        let err = h
            .ingestor()
            .ingest_at(&body, None, Some(stranger()), NOW)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookUnauthorized));
    }

    #[tokio::test]
    async fn test_valid_signature_from_unknown_origin_is_accepted() {
        let h = TestHarness::new();
        let user = h.add_user(1, false).await;
        h.pending_payment(user.id, "lbl-1", 99_000, 30, PaymentMethod::Card, None)
            .await;
        let body = TestHarness::webhook_body("payment.succeeded", "pay-1", "lbl-1", "990.00");
        let header = sign_webhook_payload(&body, "whsec", NOW.unix_timestamp()).unwrap();

        let outcome = h
            .ingestor()
            .ingest_at(&body, Some(&header), Some(stranger()), NOW)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Reconciled(ApplyOutcome::Applied { created: true, .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_body_from_allowed_origin() {
        let h = TestHarness::new();
        let err = h
            .ingestor()
            .ingest_at(b"not json", None, Some(allowed()), NOW)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookMalformed(_)));
    }

    #[tokio::test]
    async fn test_unknown_payment_still_accepted() {
        let h = TestHarness::new();
        let body = TestHarness::webhook_body("payment.succeeded", "pay-404", "nope", "1.00");

        let outcome = h
            .ingestor()
            .ingest_at(&body, None, Some(allowed()), NOW)
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Reconciled(ApplyOutcome::NotFound));
    }

    #[tokio::test]
    async fn test_other_events_ignored() {
        let h = TestHarness::new();
        let body =
            TestHarness::webhook_body("payment.waiting_for_capture", "pay-1", "lbl-1", "990.00");

        let outcome = h
            .ingestor()
            .ingest_at(&body, None, Some(allowed()), NOW)
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Ignored(_)));
    }

    #[tokio::test]
    async fn test_canceled_event_marks_failed() {
        let h = TestHarness::new();
        let user = h.add_user(1, false).await;
        h.pending_payment(user.id, "lbl-1", 99_000, 30, PaymentMethod::Card, None)
            .await;
        let body = TestHarness::webhook_body("payment.canceled", "pay-1", "lbl-1", "990.00");

        let outcome = h
            .ingestor()
            .ingest_at(&body, None, Some(allowed()), NOW)
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Reconciled(ApplyOutcome::Failed));
    }

    #[test]
    fn test_redact_keeps_tail_only() {
        assert_eq!(redact("2d8f3a5b-000f-5000-9000-1b2c3d4e5f60"), "…5f60");
        assert_eq!(redact("ab"), "…ab");
    }
}
