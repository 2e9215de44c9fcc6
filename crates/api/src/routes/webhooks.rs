//! Inbound payment gateway notifications

use std::net::{IpAddr, SocketAddr};

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
};
use clubpass_billing::{ApplyOutcome, IngestOutcome};

use crate::error::ApiResult;
use crate::state::AppState;

/// `t=<unix>,v1=<hex>` HMAC over `"{t}.{body}"`
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Address the notification came from.
///
/// Forwarding headers are only honored when the server sits behind a proxy
/// that overwrites them; otherwise any sender could claim a gateway address.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr, trust_proxy_headers: bool) -> IpAddr {
    if trust_proxy_headers {
        // X-Forwarded-For may contain multiple IPs, take first
        let forwarded = headers
            .get("X-Forwarded-For")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.split(',').next())
            .or_else(|| headers.get("X-Real-IP").and_then(|h| h.to_str().ok()))
            .and_then(|s| s.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    peer.ip()
}

/// Gateway notification endpoint.
///
/// 200 for any authenticated, well-formed notification whatever the business
/// outcome; 403 unauthenticated, 400 malformed, 503 when the ledger is
/// unavailable so the gateway redelivers.
pub async fn payment_webhook(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let origin = client_ip(&headers, peer, state.config.trust_proxy_headers);
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    tracing::debug!(origin = %origin, body_len = body.len(), "Payment webhook received");

    let outcome = state.ingestor.ingest(&body, signature, Some(origin)).await?;

    match &outcome {
        IngestOutcome::Reconciled(ApplyOutcome::Applied {
            subscription_id,
            end_date,
            created,
        }) => tracing::info!(
            subscription_id = %subscription_id,
            end_date = %end_date,
            created = created,
            "Payment webhook applied"
        ),
        IngestOutcome::Reconciled(other) => {
            tracing::debug!(outcome = ?other, "Payment webhook reconciled")
        }
        IngestOutcome::Ignored(event) => tracing::debug!(event = %event, "Payment webhook ignored"),
        IngestOutcome::Rejected(reason) => {
            tracing::warn!(reason = %reason, "Payment webhook acknowledged without effect")
        }
    }

    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use axum::Router;
    use clubpass_billing::client::sign_webhook_payload;
    use clubpass_billing::testing::TestHarness;
    use clubpass_billing::LedgerStore;
    use clubpass_shared::{PaymentMethod, PaymentStatus};
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::routes::create_router;

    const WEBHOOK_PATH: &str = "/api/v1/payments/webhook";

    fn config(trust_proxy_headers: bool) -> Config {
        Config {
            bind_address: "127.0.0.1:0".to_string(),
            trust_proxy_headers,
            max_body_bytes: 65536,
            database_url: "postgres://unused".to_string(),
            database_max_connections: 1,
            run_migrations: false,
        }
    }

    fn app(h: &TestHarness, peer: [u8; 4], trust_proxy_headers: bool) -> Router {
        let state = AppState::with_ingestor(config(trust_proxy_headers), h.ingestor());
        create_router(state).layer(MockConnectInfo(SocketAddr::from((peer, 443))))
    }

    fn post() -> axum::http::request::Builder {
        Request::builder()
            .method("POST")
            .uri(WEBHOOK_PATH)
            .header("content-type", "application/json")
    }

    const GATEWAY: [u8; 4] = [185, 71, 76, 5];
    const STRANGER: [u8; 4] = [203, 0, 113, 9];

    #[test]
    fn test_client_ip_ignores_forwarding_unless_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", "185.71.76.5, 10.0.0.1".parse().unwrap());
        let peer = SocketAddr::from((STRANGER, 5000));

        assert_eq!(client_ip(&headers, peer, false), peer.ip());
        assert_eq!(
            client_ip(&headers, peer, true),
            "185.71.76.5".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_client_ip_falls_back_to_real_ip_then_peer() {
        let peer = SocketAddr::from((STRANGER, 5000));
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, peer, true), peer.ip());

        headers.insert("X-Real-IP", "77.75.156.11".parse().unwrap());
        assert_eq!(
            client_ip(&headers, peer, true),
            "77.75.156.11".parse::<IpAddr>().unwrap()
        );

        headers.insert("X-Forwarded-For", "not-an-ip".parse().unwrap());
        assert_eq!(client_ip(&headers, peer, true), peer.ip());
    }

    #[tokio::test]
    async fn test_allowlisted_success_extends_subscription() {
        let h = TestHarness::new();
        let user = h.add_user(1, false).await;
        h.pending_payment(user.id, "lbl-1", 99_000, 30, PaymentMethod::Card, None)
            .await;
        let body = TestHarness::webhook_body("payment.succeeded", "pay-1", "lbl-1", "990.00");

        let response = app(&h, GATEWAY, false)
            .oneshot(post().body(Body::from(body)).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(h.store.active_subscription(user.id).await.unwrap().is_some());
        let record = h.store.find_payment_by_label("lbl-1").await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Success);
    }

    #[tokio::test]
    async fn test_redelivery_is_acknowledged_and_applied_once() {
        let h = TestHarness::new();
        let user = h.add_user(1, false).await;
        h.pending_payment(user.id, "lbl-1", 99_000, 30, PaymentMethod::Card, None)
            .await;
        let body = TestHarness::webhook_body("payment.succeeded", "pay-1", "lbl-1", "990.00");
        let router = app(&h, GATEWAY, false);

        for _ in 0..3 {
            let response = router
                .clone()
                .oneshot(post().body(Body::from(body.clone())).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let subs = h.store.subscriptions_for_user(user.id).await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].end_date - subs[0].start_date, time::Duration::days(30));
    }

    #[tokio::test]
    async fn test_unknown_origin_without_signature_is_forbidden() {
        let h = TestHarness::new();
        let user = h.add_user(1, false).await;
        h.pending_payment(user.id, "lbl-1", 99_000, 30, PaymentMethod::Card, None)
            .await;
        let body = TestHarness::webhook_body("payment.succeeded", "pay-1", "lbl-1", "990.00");

        let response = app(&h, STRANGER, false)
            .oneshot(post().body(Body::from(body)).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(h.store.active_subscription(user.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_spoofed_forwarded_for_is_not_trusted_by_default() {
        let h = TestHarness::new();
        let body = TestHarness::webhook_body("payment.succeeded", "pay-1", "lbl-1", "990.00");

        let response = app(&h, STRANGER, false)
            .oneshot(
                post()
                    .header("X-Forwarded-For", "185.71.76.5")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_signed_request_from_any_origin_is_accepted() {
        let h = TestHarness::new();
        let user = h.add_user(1, false).await;
        h.pending_payment(user.id, "lbl-1", 99_000, 30, PaymentMethod::Card, None)
            .await;
        let body = TestHarness::webhook_body("payment.succeeded", "pay-1", "lbl-1", "990.00");
        let signature = sign_webhook_payload(
            &body,
            "whsec",
            time::OffsetDateTime::now_utc().unix_timestamp(),
        )
        .unwrap();

        let response = app(&h, STRANGER, false)
            .oneshot(
                post()
                    .header(SIGNATURE_HEADER, signature)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(h.store.active_subscription(user.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let h = TestHarness::new();
        let body = b"{not json".to_vec();

        let response = app(&h, GATEWAY, false)
            .oneshot(post().body(Body::from(body)).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_payment_still_acknowledged() {
        let h = TestHarness::new();
        let body = TestHarness::webhook_body("payment.succeeded", "pay-404", "nope", "1.00");

        let response = app(&h, GATEWAY, false)
            .oneshot(post().body(Body::from(body)).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_without_database() {
        let h = TestHarness::new();

        let response = app(&h, GATEWAY, false)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["database"], "not_configured");
    }
}
