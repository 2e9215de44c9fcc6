//! Interactive payment initiation

use std::sync::Arc;

use clubpass_shared::PaymentMethod;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{CreatePayment, Metadata, PaymentGateway};
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::reconciler::{META_DAYS, META_ONE_TIME_DISCOUNT, META_PAYMENT_LABEL, META_USER_ID};
use crate::store::{LedgerStore, NewPayment};

/// Where to send the member to confirm the payment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub payment_label: String,
    pub transaction_id: String,
    pub confirmation_url: Option<String>,
    /// Minor currency units
    pub amount: i64,
    pub days: i32,
}

pub struct CheckoutService {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    config: Arc<BillingConfig>,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        config: Arc<BillingConfig>,
    ) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    /// Record a pending payment for the `days` tariff and open it at the gateway
    pub async fn start_payment(&self, user_id: Uuid, days: i32) -> BillingResult<CheckoutSession> {
        let tariff = self
            .config
            .tariffs
            .for_days(days)
            .ok_or(BillingError::UnknownTariff(days))?;
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;

        let amount = tariff.discounted_price(user.discount_percent());
        if amount <= 0 {
            return Err(BillingError::InvalidInput(
                "discount leaves nothing to charge".to_string(),
            ));
        }
        let one_time = user.one_time_discount_percent > user.lifetime_discount_percent;

        let label = format!("pay:{}", Uuid::new_v4());
        let record = self
            .store
            .insert_payment(NewPayment {
                user_id,
                subscription_id: None,
                amount,
                payment_method: PaymentMethod::Card,
                payment_label: label.clone(),
                days,
                created_at: OffsetDateTime::now_utc(),
            })
            .await?;

        let mut metadata = Metadata::new();
        metadata.insert(META_PAYMENT_LABEL.to_string(), label.clone());
        metadata.insert(META_USER_ID.to_string(), user_id.to_string());
        metadata.insert(META_DAYS.to_string(), days.to_string());
        if one_time {
            metadata.insert(
                META_ONE_TIME_DISCOUNT.to_string(),
                user.one_time_discount_percent.to_string(),
            );
        }

        let payment = self
            .gateway
            .create_payment(&CreatePayment {
                amount,
                description: format!("Club access, {} days", days),
                idempotency_key: label.clone(),
                metadata,
                save_payment_method: true,
            })
            .await?;

        self.store
            .attach_transaction_id(record.id, &payment.id)
            .await?;

        tracing::info!(
            user_id = %user_id,
            payment_label = %label,
            amount,
            days,
            "Checkout started"
        );

        Ok(CheckoutSession {
            payment_label: label,
            transaction_id: payment.id,
            confirmation_url: payment.confirmation_url,
            amount,
            days,
        })
    }

    /// Member opt-out of automatic renewal; the stored method is kept
    pub async fn disable_autopay(&self, user_id: Uuid) -> BillingResult<()> {
        self.store.set_recurring_active(user_id, false).await?;
        tracing::info!(user_id = %user_id, "Auto-renew disabled by user");
        Ok(())
    }
}
