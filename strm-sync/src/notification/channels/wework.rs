//! WeWork (WeCom) group robot channel.
//!
//! Posts markdown messages to `/cgi-bin/webhook/send?key=<key>`. The robot
//! answers HTTP 200 even on failure, so `errcode` is checked.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::NotificationChannel;
use crate::notification::events::TemplateType;
use crate::{Error, Result};

/// WeWork markdown content limit in bytes.
const WEWORK_MARKDOWN_LIMIT: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeworkConfig {
    pub enabled: bool,
    /// Robot webhook key.
    pub key: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_api_base() -> String {
    "https://qyapi.weixin.qq.com".to_string()
}

impl Default for WeworkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            key: String::new(),
            api_base: default_api_base(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RobotResponse {
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

pub struct WeworkChannel {
    config: WeworkConfig,
    client: Client,
}

impl WeworkChannel {
    pub fn new(config: WeworkConfig, client: Client) -> Self {
        Self { config, client }
    }
}

#[async_trait]
impl NotificationChannel for WeworkChannel {
    fn channel_type(&self) -> &'static str {
        "wework"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.key.is_empty()
    }

    async fn send(
        &self,
        template_type: TemplateType,
        rendered: &str,
        _payload: &serde_json::Value,
    ) -> Result<()> {
        let url = format!(
            "{}/cgi-bin/webhook/send",
            self.config.api_base.trim_end_matches('/')
        );
        let body = json!({
            "msgtype": "markdown",
            "markdown": { "content": truncate_bytes(rendered, WEWORK_MARKDOWN_LIMIT) },
        });

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.config.key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Other(format!("WeWork request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Other(format!("WeWork send failed: {} - {}", status, text)));
        }

        let reply: RobotResponse = response
            .json()
            .await
            .map_err(|e| Error::Other(format!("WeWork response unreadable: {}", e)))?;
        if reply.errcode != 0 {
            return Err(Error::Other(format!(
                "WeWork send failed: errcode {} - {}",
                reply.errcode, reply.errmsg
            )));
        }

        debug!("WeWork notification sent: {}", template_type);
        Ok(())
    }
}

/// Cut `text` to at most `limit` bytes on a char boundary.
fn truncate_bytes(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
