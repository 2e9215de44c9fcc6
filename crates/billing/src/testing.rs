//! In-memory fakes for the gateway, the group and the notifier, plus a
//! harness that wires them into a [`BillingService`] over
//! [`MemoryLedgerStore`].

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use clubpass_shared::{PaymentMethod, PaymentRecord, Subscription, User};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::client::{
    CreateAutopayment, CreatePayment, GatewayError, GatewayPayment, GatewayStatus, Metadata,
    PaymentGateway,
};
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::group::GroupMembership;
use crate::notify::{Notification, Notifier};
use crate::reconciler::{PaymentEvent, META_PAYMENT_LABEL};
use crate::store::{LedgerStore, MemoryLedgerStore, NewPayment};
use crate::webhooks::{WebhookAuth, WebhookIngestor, DEFAULT_ALLOWED_NETWORKS};
use crate::BillingService;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Gateway
// =============================================================================

enum ScriptedAutopay {
    /// Reply with this id/status, echoing the request's amount and metadata
    Status { id: String, status: String },
    Raw(Result<GatewayPayment, GatewayError>),
}

/// Gateway double: autopayment replies are queued, lookups come from a table
#[derive(Default)]
pub struct ScriptedGateway {
    autopay_script: Mutex<VecDeque<ScriptedAutopay>>,
    autopay_requests: Mutex<Vec<CreateAutopayment>>,
    created: Mutex<Vec<CreatePayment>>,
    payments: Mutex<HashMap<String, GatewayPayment>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_autopay_status(&self, id: &str, status: &str) {
        lock(&self.autopay_script).push_back(ScriptedAutopay::Status {
            id: id.to_string(),
            status: status.to_string(),
        });
    }

    pub fn push_autopay(&self, result: Result<GatewayPayment, GatewayError>) {
        lock(&self.autopay_script).push_back(ScriptedAutopay::Raw(result));
    }

    pub fn autopay_requests(&self) -> Vec<CreateAutopayment> {
        lock(&self.autopay_requests).clone()
    }

    pub fn created_payments(&self) -> Vec<CreatePayment> {
        lock(&self.created).clone()
    }

    /// Make `get_payment(id)` report `status`
    pub fn set_payment_status(&self, id: &str, status: &str, amount: i64, label: &str) {
        let mut metadata = Metadata::new();
        metadata.insert(META_PAYMENT_LABEL.to_string(), label.to_string());
        lock(&self.payments).insert(
            id.to_string(),
            GatewayPayment {
                id: id.to_string(),
                status: GatewayStatus::from_wire(status),
                amount,
                confirmation_url: None,
                payment_method: None,
                metadata,
                cancellation_reason: None,
            },
        );
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn create_payment(&self, request: &CreatePayment) -> Result<GatewayPayment, GatewayError> {
        let n = {
            let mut created = lock(&self.created);
            created.push(request.clone());
            created.len()
        };
        let id = format!("pay-{}", n);
        let payment = GatewayPayment {
            id: id.clone(),
            status: GatewayStatus::Pending,
            amount: request.amount,
            confirmation_url: Some(format!("https://gateway.test/confirm/{}", id)),
            payment_method: None,
            metadata: request.metadata.clone(),
            cancellation_reason: None,
        };
        lock(&self.payments).insert(id, payment.clone());
        Ok(payment)
    }

    async fn create_autopayment(
        &self,
        request: &CreateAutopayment,
    ) -> Result<GatewayPayment, GatewayError> {
        let n = {
            let mut requests = lock(&self.autopay_requests);
            requests.push(request.clone());
            requests.len()
        };
        let scripted = lock(&self.autopay_script).pop_front();
        let echo = |id: String, status: GatewayStatus| GatewayPayment {
            id,
            status,
            amount: request.amount,
            confirmation_url: None,
            payment_method: None,
            metadata: request.metadata.clone(),
            cancellation_reason: (status == GatewayStatus::Failed)
                .then(|| "insufficient_funds".to_string()),
        };
        let result = match scripted {
            Some(ScriptedAutopay::Status { id, status }) => Ok(echo(id, GatewayStatus::from_wire(&status))),
            Some(ScriptedAutopay::Raw(result)) => result,
            None => Ok(echo(format!("auto-{}", n), GatewayStatus::Pending)),
        };
        if let Ok(payment) = &result {
            lock(&self.payments).insert(payment.id.clone(), payment.clone());
        }
        result
    }

    async fn get_payment(&self, payment_id: &str) -> Result<GatewayPayment, GatewayError> {
        lock(&self.payments)
            .get(payment_id)
            .cloned()
            .ok_or_else(|| GatewayError::Rejected {
                status: 404,
                message: format!("payment {} not found", payment_id),
            })
    }
}

// =============================================================================
// Group
// =============================================================================

#[derive(Default)]
pub struct FakeGroup {
    members: Mutex<HashSet<i64>>,
    failing: Mutex<HashSet<i64>>,
    removed: Mutex<Vec<i64>>,
    messages: Mutex<Vec<(i64, String)>>,
}

impl FakeGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&self, telegram_id: i64) {
        lock(&self.members).insert(telegram_id);
    }

    pub fn contains(&self, telegram_id: i64) -> bool {
        lock(&self.members).contains(&telegram_id)
    }

    /// Make every removal of `telegram_id` fail
    pub fn fail_removal_of(&self, telegram_id: i64) {
        lock(&self.failing).insert(telegram_id);
    }

    pub fn removed(&self) -> Vec<i64> {
        lock(&self.removed).clone()
    }
}

#[async_trait]
impl GroupMembership for FakeGroup {
    async fn is_member(&self, telegram_id: i64) -> BillingResult<bool> {
        Ok(self.contains(telegram_id))
    }

    async fn remove_member(&self, telegram_id: i64) -> BillingResult<()> {
        if lock(&self.failing).contains(&telegram_id) {
            return Err(BillingError::Group(format!("cannot remove {}", telegram_id)));
        }
        lock(&self.members).remove(&telegram_id);
        lock(&self.removed).push(telegram_id);
        Ok(())
    }

    async fn send_message(&self, chat_id: i64, text: &str, _topic_id: Option<i64>) -> BillingResult<()> {
        lock(&self.messages).push((chat_id, text.to_string()));
        Ok(())
    }
}

// =============================================================================
// Notifier
// =============================================================================

#[derive(Default)]
pub struct RecordingNotifier {
    users: Mutex<Vec<(i64, Notification)>>,
    operators: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_messages_for(&self, telegram_id: i64) -> Vec<Notification> {
        lock(&self.users)
            .iter()
            .filter(|(id, _)| *id == telegram_id)
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub fn operator_messages(&self) -> Vec<String> {
        lock(&self.operators).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_user(&self, telegram_id: i64, notification: &Notification) -> bool {
        lock(&self.users).push((telegram_id, notification.clone()));
        true
    }

    async fn notify_operators(&self, text: &str) -> bool {
        lock(&self.operators).push(text.to_string());
        true
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Billing engine over in-memory fakes with default configuration
pub struct TestHarness {
    pub store: Arc<MemoryLedgerStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub group: Arc<FakeGroup>,
    pub notifier: Arc<RecordingNotifier>,
    pub service: BillingService,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(BillingConfig::default())
    }

    pub fn with_config(config: BillingConfig) -> Self {
        let store = Arc::new(MemoryLedgerStore::new());
        let gateway = Arc::new(ScriptedGateway::new());
        let group = Arc::new(FakeGroup::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let service = BillingService::new(
            store.clone(),
            gateway.clone(),
            group.clone(),
            notifier.clone(),
            config,
        );
        Self {
            store,
            gateway,
            group,
            notifier,
            service,
        }
    }

    /// Ingestor trusting the gateway's published ranges and secret `whsec`
    pub fn ingestor(&self) -> WebhookIngestor {
        let networks = DEFAULT_ALLOWED_NETWORKS
            .iter()
            .filter_map(|n| n.parse().ok())
            .collect();
        self.service
            .ingestor(WebhookAuth::new(networks, Some("whsec".to_string())))
    }

    /// With `autopay`, the user has a saved method `pm-1` and auto-renew on
    pub async fn add_user(&self, telegram_id: i64, autopay: bool) -> User {
        let mut user = User::new(telegram_id);
        if autopay {
            user.is_recurring_active = true;
            user.payment_method_token = Some("pm-1".to_string());
        }
        self.store.insert_user(&user).await.expect("insert user");
        user
    }

    /// 30-day subscription renewing at 990.00
    pub async fn add_subscription(
        &self,
        user_id: Uuid,
        start: OffsetDateTime,
        end: OffsetDateTime,
        active: bool,
    ) -> Subscription {
        let sub = Subscription {
            id: Uuid::new_v4(),
            user_id,
            start_date: start,
            end_date: end,
            is_active: active,
            autopayment_fail_count: 0,
            next_retry_attempt_at: None,
            renewal_price: 99_000,
            renewal_duration_days: 30,
            version: 1,
        };
        self.store.insert_subscription(sub.clone()).await;
        sub
    }

    /// Active, expired at `end`, with `fail_count` failed renewals behind it
    pub async fn add_failing_subscription(
        &self,
        user_id: Uuid,
        end: OffsetDateTime,
        fail_count: i32,
        next_retry: OffsetDateTime,
    ) -> Subscription {
        let sub = Subscription {
            autopayment_fail_count: fail_count,
            next_retry_attempt_at: Some(next_retry),
            ..self
                .add_subscription(user_id, end - Duration::days(30), end, true)
                .await
        };
        self.store.insert_subscription(sub.clone()).await;
        sub
    }

    pub async fn pending_payment(
        &self,
        user_id: Uuid,
        label: &str,
        amount: i64,
        days: i32,
        method: PaymentMethod,
        subscription_id: Option<Uuid>,
    ) -> PaymentRecord {
        self.store
            .insert_payment(NewPayment {
                user_id,
                subscription_id,
                amount,
                payment_method: method,
                payment_label: label.to_string(),
                days,
                created_at: OffsetDateTime::now_utc(),
            })
            .await
            .expect("insert payment")
    }

    /// Card payment already linked to a gateway id, created at `created_at`
    pub async fn pending_payment_at(
        &self,
        user_id: Uuid,
        label: &str,
        amount: i64,
        days: i32,
        transaction_id: &str,
        created_at: OffsetDateTime,
    ) -> PaymentRecord {
        let record = self
            .store
            .insert_payment(NewPayment {
                user_id,
                subscription_id: None,
                amount,
                payment_method: PaymentMethod::Card,
                payment_label: label.to_string(),
                days,
                created_at,
            })
            .await
            .expect("insert payment");
        self.store
            .attach_transaction_id(record.id, transaction_id)
            .await
            .expect("attach transaction id");
        PaymentRecord {
            transaction_id: Some(transaction_id.to_string()),
            ..record
        }
    }

    pub fn success_event(&self, id: &str, label: &str, amount: i64) -> PaymentEvent {
        Self::event(id, label, amount, GatewayStatus::Succeeded)
    }

    pub fn failed_event(&self, id: &str, label: &str, amount: i64) -> PaymentEvent {
        Self::event(id, label, amount, GatewayStatus::Failed)
    }

    fn event(id: &str, label: &str, amount: i64, status: GatewayStatus) -> PaymentEvent {
        let mut metadata = Metadata::new();
        metadata.insert(META_PAYMENT_LABEL.to_string(), label.to_string());
        PaymentEvent {
            gateway_payment_id: id.to_string(),
            status,
            amount,
            metadata,
            payment_method: None,
        }
    }

    /// Notification body in the gateway's wire format
    pub fn webhook_body(event: &str, id: &str, label: &str, amount: &str) -> Vec<u8> {
        let status = match event {
            "payment.succeeded" => "succeeded",
            "payment.canceled" => "canceled",
            _ => "waiting_for_capture",
        };
        serde_json::to_vec(&serde_json::json!({
            "type": "notification",
            "event": event,
            "object": {
                "id": id,
                "status": status,
                "amount": { "value": amount, "currency": "RUB" },
                "metadata": { "payment_label": label },
            }
        }))
        .expect("serialize webhook body")
    }
}
