//! Telegram Bot API adapter
//!
//! Implements both the group membership port and the notifier. Sends go
//! straight through reqwest; notification failures are logged and reported
//! as `false`, never raised.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{BillingError, BillingResult};
use crate::group::GroupMembership;
use crate::notify::{Notification, Notifier};

/// Configuration for the Telegram bot
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub api_url: String,
    pub bot_token: String,
    pub group_chat_id: i64,
    pub operator_chat_ids: Vec<i64>,
    /// Forum topic for operator messages
    pub operator_topic_id: Option<i64>,
    /// Whole-request timeout for every Bot API call
    pub timeout: Duration,
}

impl TelegramConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let group_chat_id = std::env::var("GROUP_CHAT_ID")
            .map_err(|_| BillingError::Config("GROUP_CHAT_ID not set".to_string()))?
            .trim()
            .parse()
            .map_err(|_| BillingError::Config("GROUP_CHAT_ID must be an integer".to_string()))?;

        let operator_chat_ids = std::env::var("OPERATOR_CHAT_IDS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<i64>().map_err(|_| {
                    BillingError::Config(format!("OPERATOR_CHAT_IDS entry '{}' is not an id", s))
                })
            })
            .collect::<BillingResult<Vec<_>>>()?;

        let timeout_secs: u64 = std::env::var("TELEGRAM_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(10);

        Ok(Self {
            api_url: std::env::var("TELEGRAM_API_URL")
                .unwrap_or_else(|_| "https://api.telegram.org".to_string()),
            bot_token: std::env::var("TELEGRAM_BOT_TOKEN")
                .map_err(|_| BillingError::Config("TELEGRAM_BOT_TOKEN not set".to_string()))?,
            group_chat_id,
            operator_chat_ids,
            operator_topic_id: std::env::var("OPERATOR_TOPIC_ID")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMember {
    status: String,
    /// Only present for restricted members
    #[serde(default)]
    is_member: Option<bool>,
}

impl ChatMember {
    fn in_group(&self) -> bool {
        match self.status.as_str() {
            "creator" | "administrator" | "member" => true,
            "restricted" => self.is_member.unwrap_or(false),
            _ => false,
        }
    }
}

/// Telegram bot client
#[derive(Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    config: TelegramConfig,
}

impl TelegramClient {
    pub fn new(config: TelegramConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    /// Create a new client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Self::new(TelegramConfig::from_env()?)
    }

    pub fn config(&self) -> &TelegramConfig {
        &self.config
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> BillingResult<ApiResponse<T>> {
        let url = format!(
            "{}/bot{}/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.bot_token,
            method
        );
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BillingError::Group(format!("{} request failed: {}", method, e)))?;

        // Telegram reports errors with a JSON body and a 4xx status
        response
            .json::<ApiResponse<T>>()
            .await
            .map_err(|e| BillingError::Group(format!("{} returned invalid JSON: {}", method, e)))
    }

    async fn call_ok(&self, method: &str, body: serde_json::Value) -> BillingResult<()> {
        let response: ApiResponse<serde_json::Value> = self.call(method, body).await?;
        if response.ok {
            Ok(())
        } else {
            Err(BillingError::Group(format!(
                "{} failed: {}",
                method,
                response.description.unwrap_or_default()
            )))
        }
    }
}

#[async_trait]
impl GroupMembership for TelegramClient {
    async fn is_member(&self, telegram_id: i64) -> BillingResult<bool> {
        let response: ApiResponse<ChatMember> = self
            .call(
                "getChatMember",
                serde_json::json!({
                    "chat_id": self.config.group_chat_id,
                    "user_id": telegram_id,
                }),
            )
            .await?;

        match (response.ok, response.result) {
            (true, Some(member)) => Ok(member.in_group()),
            (_, _) => {
                let description = response.description.unwrap_or_default();
                // Users who never joined are reported as unknown participants
                if description.to_lowercase().contains("user not found")
                    || description.contains("PARTICIPANT_ID_INVALID")
                {
                    return Ok(false);
                }
                Err(BillingError::Group(format!(
                    "getChatMember failed: {}",
                    description
                )))
            }
        }
    }

    async fn remove_member(&self, telegram_id: i64) -> BillingResult<()> {
        self.call_ok(
            "banChatMember",
            serde_json::json!({
                "chat_id": self.config.group_chat_id,
                "user_id": telegram_id,
                "revoke_messages": false,
            }),
        )
        .await?;
        self.call_ok(
            "unbanChatMember",
            serde_json::json!({
                "chat_id": self.config.group_chat_id,
                "user_id": telegram_id,
                "only_if_banned": true,
            }),
        )
        .await?;
        tracing::info!(telegram_id, "Removed user from group");
        Ok(())
    }

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        topic_id: Option<i64>,
    ) -> BillingResult<()> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        if let Some(topic) = topic_id {
            body["message_thread_id"] = serde_json::json!(topic);
        }
        self.call_ok("sendMessage", body).await
    }
}

#[async_trait]
impl Notifier for TelegramClient {
    async fn notify_user(&self, telegram_id: i64, notification: &Notification) -> bool {
        match self
            .send_message(telegram_id, &notification.render(), None)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    telegram_id,
                    error = %e,
                    "Failed to notify user - non-fatal"
                );
                false
            }
        }
    }

    async fn notify_operators(&self, text: &str) -> bool {
        let mut delivered = !self.config.operator_chat_ids.is_empty();
        for chat_id in &self.config.operator_chat_ids {
            if let Err(e) = self
                .send_message(*chat_id, text, self.config.operator_topic_id)
                .await
            {
                tracing::warn!(chat_id, error = %e, "Failed to notify operator - non-fatal");
                delivered = false;
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: String) -> TelegramClient {
        TelegramClient::new(TelegramConfig {
            api_url: url,
            bot_token: "TOKEN".to_string(),
            group_chat_id: -100,
            operator_chat_ids: vec![1, 2],
            operator_topic_id: Some(7),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_is_member_statuses() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/botTOKEN/getChatMember")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({"user_id": 10})))
            .with_body(r#"{"ok":true,"result":{"status":"member"}}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/botTOKEN/getChatMember")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({"user_id": 11})))
            .with_body(r#"{"ok":true,"result":{"status":"left"}}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/botTOKEN/getChatMember")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({"user_id": 12})))
            .with_status(400)
            .with_body(r#"{"ok":false,"description":"Bad Request: user not found"}"#)
            .create_async()
            .await;

        let tg = client(server.url());
        assert!(tg.is_member(10).await.unwrap());
        assert!(!tg.is_member(11).await.unwrap());
        assert!(!tg.is_member(12).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_member_bans_then_unbans() {
        let mut server = mockito::Server::new_async().await;
        let ban = server
            .mock("POST", "/botTOKEN/banChatMember")
            .with_body(r#"{"ok":true,"result":true}"#)
            .create_async()
            .await;
        let unban = server
            .mock("POST", "/botTOKEN/unbanChatMember")
            .match_body(mockito::Matcher::PartialJson(
                serde_json::json!({"only_if_banned": true}),
            ))
            .with_body(r#"{"ok":true,"result":true}"#)
            .create_async()
            .await;

        client(server.url()).remove_member(10).await.unwrap();
        ban.assert_async().await;
        unban.assert_async().await;
    }

    #[tokio::test]
    async fn test_remove_member_stops_when_ban_fails() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/botTOKEN/banChatMember")
            .with_status(400)
            .with_body(r#"{"ok":false,"description":"not enough rights"}"#)
            .create_async()
            .await;
        let unban = server
            .mock("POST", "/botTOKEN/unbanChatMember")
            .expect(0)
            .create_async()
            .await;

        let err = client(server.url()).remove_member(10).await.unwrap_err();
        assert!(matches!(err, BillingError::Group(_)));
        unban.assert_async().await;
    }

    #[tokio::test]
    async fn test_operator_messages_use_topic() {
        let mut server = mockito::Server::new_async().await;
        let send = server
            .mock("POST", "/botTOKEN/sendMessage")
            .match_body(mockito::Matcher::PartialJson(
                serde_json::json!({"message_thread_id": 7}),
            ))
            .with_body(r#"{"ok":true,"result":{}}"#)
            .expect(2)
            .create_async()
            .await;

        assert!(client(server.url()).notify_operators("summary").await);
        send.assert_async().await;
    }

    #[tokio::test]
    async fn test_user_notification_failure_is_swallowed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/botTOKEN/sendMessage")
            .with_status(403)
            .with_body(r#"{"ok":false,"description":"bot was blocked by the user"}"#)
            .create_async()
            .await;

        let delivered = client(server.url())
            .notify_user(10, &Notification::AccessRevoked)
            .await;
        assert!(!delivered);
    }

    #[tokio::test]
    async fn test_unresponsive_api_times_out() {
        // Accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _held = tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                open.push(socket);
            }
        });

        let telegram = TelegramClient::new(TelegramConfig {
            api_url: format!("http://{}", addr),
            bot_token: "TOKEN".to_string(),
            group_chat_id: -100,
            operator_chat_ids: vec![1],
            operator_topic_id: None,
            timeout: Duration::from_millis(200),
        })
        .unwrap();

        let delivered = tokio::time::timeout(
            Duration::from_secs(5),
            telegram.notify_user(10, &Notification::AccessRevoked),
        )
        .await
        .expect("notification should give up on its own");
        assert!(!delivered);
    }
}
