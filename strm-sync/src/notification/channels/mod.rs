//! Notification channels.
//!
//! - Telegram Bot API
//! - WeWork (WeCom) group robot
//! - Generic webhooks (HTTP POST)

mod telegram;
mod webhook;
mod wework;

pub use telegram::{TelegramChannel, TelegramConfig};
pub use webhook::{WebhookAuth, WebhookChannel, WebhookConfig};
pub use wework::{WeworkChannel, WeworkConfig};

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::events::TemplateType;
use super::template::no_escape;
use crate::Result;

/// Trait for notification channels.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Get the channel type name.
    fn channel_type(&self) -> &'static str;

    /// Check if the channel is enabled.
    fn is_enabled(&self) -> bool;

    /// Escaping applied to payload values when rendering this channel's
    /// templates.
    fn escaper(&self) -> fn(&str) -> String {
        no_escape
    }

    /// Deliver an already rendered message.
    async fn send(
        &self,
        template_type: TemplateType,
        rendered: &str,
        payload: &serde_json::Value,
    ) -> Result<()>;
}

/// Channel configuration wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelConfig {
    /// Telegram Bot API channel.
    Telegram(TelegramConfig),
    /// WeWork group robot channel.
    Wework(WeworkConfig),
    /// Generic webhook channel.
    Webhook(WebhookConfig),
}

impl ChannelConfig {
    /// Get the channel type name.
    pub fn channel_type(&self) -> &'static str {
        match self {
            Self::Telegram(_) => "telegram",
            Self::Wework(_) => "wework",
            Self::Webhook(_) => "webhook",
        }
    }

    /// Check if the channel is enabled.
    pub fn is_enabled(&self) -> bool {
        match self {
            Self::Telegram(c) => c.enabled,
            Self::Wework(c) => c.enabled,
            Self::Webhook(c) => c.enabled,
        }
    }

    pub fn build(&self, client: Client) -> Arc<dyn NotificationChannel> {
        match self {
            Self::Telegram(c) => Arc::new(TelegramChannel::new(c.clone(), client)),
            Self::Wework(c) => Arc::new(WeworkChannel::new(c.clone(), client)),
            Self::Webhook(c) => Arc::new(WebhookChannel::new(c.clone(), client)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::http_client::test_client;

    #[test]
    fn test_channel_config_tagging() {
        let configs: Vec<ChannelConfig> = serde_json::from_str(
            r#"[
                {"type": "telegram", "enabled": true, "bot_token": "1:A", "chat_id": "9"},
                {"type": "wework", "enabled": false, "key": "k"},
                {"type": "webhook", "enabled": true, "url": "http://localhost/hook"}
            ]"#,
        )
        .unwrap();
        let types: Vec<_> = configs.iter().map(ChannelConfig::channel_type).collect();
        assert_eq!(types, ["telegram", "wework", "webhook"]);
        assert!(!configs[1].is_enabled());

        let json = serde_json::to_value(&configs[2]).unwrap();
        assert_eq!(json["type"], "webhook");
    }

    #[test]
    fn test_build_respects_enabled() {
        let config = ChannelConfig::Telegram(TelegramConfig::default());
        let channel = config.build(test_client());
        assert_eq!(channel.channel_type(), "telegram");
        assert!(!channel.is_enabled());
    }
}
