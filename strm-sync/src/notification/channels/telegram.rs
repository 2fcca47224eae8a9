//! Telegram Bot API notification channel.
//!
//! Sends messages via the Telegram Bot API (`POST /bot<token>/sendMessage`).
//! Handles 429 rate limits by respecting the `parameters.retry_after` field
//! returned in the JSON response body.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::NotificationChannel;
use crate::notification::events::TemplateType;
use crate::notification::template::{escape_html, no_escape};
use crate::{Error, Result};

/// Maximum number of retries for rate-limited requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Telegram `sendMessage` text limit (UTF-8 characters).
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Telegram channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Whether the channel is enabled.
    pub enabled: bool,
    /// Telegram Bot API token.
    pub bot_token: String,
    /// Target chat ID (user, group, or channel).
    pub chat_id: String,
    /// Parse mode for message formatting (HTML, Markdown, MarkdownV2).
    #[serde(default = "default_parse_mode")]
    pub parse_mode: String,
    /// Bot API base URL, for self-hosted API servers.
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_parse_mode() -> String {
    "HTML".to_string()
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            chat_id: String::new(),
            parse_mode: default_parse_mode(),
            api_base: default_api_base(),
        }
    }
}

/// Telegram notification channel.
pub struct TelegramChannel {
    config: TelegramConfig,
    client: Client,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig, client: Client) -> Self {
        Self { config, client }
    }

    /// Send request with rate limit handling.
    async fn send_with_retry(&self, payload: &serde_json::Value) -> Result<()> {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token
        );
        let mut attempts = 0;

        loop {
            attempts += 1;

            let response = self
                .client
                .post(&url)
                .json(payload)
                .send()
                .await
                .map_err(|e| Error::Other(format!("Telegram request failed: {}", e)))?;

            let status = response.status();

            if status.is_success() {
                return Ok(());
            }

            if status.as_u16() == 429 {
                let body: serde_json::Value = response.json().await.unwrap_or_default();

                let retry_after = body
                    .get("parameters")
                    .and_then(|p| p.get("retry_after"))
                    .and_then(|v| v.as_u64())
                    .map(Duration::from_secs);

                if attempts >= MAX_RATE_LIMIT_RETRIES {
                    warn!(
                        "Telegram rate limit: max retries ({}) exceeded, last retry_after was {:?}",
                        MAX_RATE_LIMIT_RETRIES, retry_after
                    );
                    return Err(Error::Other(format!(
                        "Telegram rate limit exceeded after {} retries",
                        MAX_RATE_LIMIT_RETRIES
                    )));
                }

                let wait_duration = retry_after.unwrap_or(Duration::from_secs(1));
                debug!(
                    "Telegram rate limited (429), waiting {:?} before retry (attempt {}/{})",
                    wait_duration, attempts, MAX_RATE_LIMIT_RETRIES
                );
                tokio::time::sleep(wait_duration).await;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            return Err(Error::Other(format!(
                "Telegram sendMessage failed: {} - {}",
                status, body
            )));
        }
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    fn channel_type(&self) -> &'static str {
        "telegram"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.bot_token.is_empty() && !self.config.chat_id.is_empty()
    }

    fn escaper(&self) -> fn(&str) -> String {
        if self.config.parse_mode.eq_ignore_ascii_case("html") {
            escape_html
        } else {
            no_escape
        }
    }

    async fn send(
        &self,
        template_type: TemplateType,
        rendered: &str,
        _payload: &serde_json::Value,
    ) -> Result<()> {
        let payload = json!({
            "chat_id": self.config.chat_id,
            "text": truncate_message(rendered, TELEGRAM_MESSAGE_LIMIT),
            "parse_mode": self.config.parse_mode,
        });

        self.send_with_retry(&payload).await?;

        debug!("Telegram notification sent: {}", template_type);
        Ok(())
    }
}

/// Truncate a message to fit within the Telegram character limit.
fn truncate_message(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let suffix = "\n\n[truncated]";
    let budget = limit - suffix.len();
    let truncated: String = text.chars().take(budget).collect();
    format!("{truncated}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::http_client::test_client;
    use axum::extract::{Path, State};
    use axum::routing::post;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::sync::Arc;

    type Seen = Arc<Mutex<Vec<(String, Value)>>>;

    async fn send_message(
        State(seen): State<Seen>,
        Path(bot): Path<String>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        seen.lock().push((bot, body));
        Json(json!({ "ok": true }))
    }

    async fn spawn_server(seen: Seen) -> String {
        let app = Router::new()
            .route("/{bot}/sendMessage", post(send_message))
            .with_state(seen);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_telegram_channel_enabled() {
        let channel = TelegramChannel::new(TelegramConfig::default(), test_client());
        assert!(!channel.is_enabled());

        let config = TelegramConfig {
            enabled: true,
            bot_token: "123:ABC".to_string(),
            chat_id: "456".to_string(),
            ..Default::default()
        };
        let channel = TelegramChannel::new(config, test_client());
        assert!(channel.is_enabled());
        assert_eq!((channel.escaper())("<x>"), "&lt;x&gt;");
    }

    #[tokio::test]
    async fn test_send_message() {
        let seen: Seen = Arc::default();
        let base = spawn_server(seen.clone()).await;
        let channel = TelegramChannel::new(
            TelegramConfig {
                enabled: true,
                bot_token: "1:A".to_string(),
                chat_id: "42".to_string(),
                api_base: base,
                ..Default::default()
            },
            test_client(),
        );

        channel
            .send(TemplateType::Test, "<b>hi</b>", &Value::Null)
            .await
            .unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "bot1:A");
        assert_eq!(seen[0].1["chat_id"], "42");
        assert_eq!(seen[0].1["text"], "<b>hi</b>");
        assert_eq!(seen[0].1["parse_mode"], "HTML");
    }

    #[test]
    fn test_truncate_message() {
        assert_eq!(truncate_message("hello", 100), "hello");

        let long: String = "a".repeat(5000);
        let truncated = truncate_message(&long, TELEGRAM_MESSAGE_LIMIT);
        assert!(truncated.chars().count() <= TELEGRAM_MESSAGE_LIMIT);
        assert!(truncated.ends_with("[truncated]"));
    }
}
