//! Group membership port

use async_trait::async_trait;

use crate::error::BillingResult;

/// The community group the subscription grants access to
#[async_trait]
pub trait GroupMembership: Send + Sync {
    async fn is_member(&self, telegram_id: i64) -> BillingResult<bool>;

    /// Remove the user while leaving them free to rejoin (ban, then unban)
    async fn remove_member(&self, telegram_id: i64) -> BillingResult<()>;

    async fn send_message(&self, chat_id: i64, text: &str, topic_id: Option<i64>)
        -> BillingResult<()>;
}
