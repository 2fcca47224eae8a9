//! HTTP client for AList/OpenList compatible indexes.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, trace};

use super::{RemoteEntry, RemoteIndex, RemotePage, encode_remote_path, join_remote_path};
use crate::config::{AppSettings, RemoteSettings, SettingsSubscriber};
use crate::utils::http_client;
use crate::{Error, Result};

/// Success code used in the JSON envelope.
const API_OK: i64 = 200;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ListData {
    #[serde(default)]
    content: Option<Vec<ApiEntry>>,
    #[serde(default)]
    total: u64,
}

#[derive(Debug, Deserialize)]
struct ApiEntry {
    name: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    is_dir: bool,
    #[serde(default)]
    modified: Option<String>,
    #[serde(default)]
    sign: Option<String>,
    #[serde(default)]
    hash_info: Option<serde_json::Value>,
    #[serde(default)]
    raw_url: Option<String>,
}

impl ApiEntry {
    fn into_entry(self, path: String) -> RemoteEntry {
        // hash_info is an object keyed by algorithm; keep the first digest.
        let hash = self.hash_info.as_ref().and_then(|info| {
            info.as_object()
                .and_then(|map| map.values().find_map(|v| v.as_str()))
                .map(str::to_string)
        });

        RemoteEntry {
            path,
            name: self.name,
            is_dir: self.is_dir,
            size: self.size.max(0) as u64,
            modified: self.modified,
            sign: self.sign.unwrap_or_default(),
            hash,
            raw_url: self.raw_url.filter(|url| !url.is_empty()),
        }
    }
}

/// Remote index client speaking the `/api/fs/*` JSON API.
pub struct AlistClient {
    client: reqwest::Client,
    settings: RwLock<Arc<RemoteSettings>>,
}

impl AlistClient {
    pub fn new(settings: RemoteSettings) -> Result<Self> {
        let client = http_client::default_client_builder().build()?;
        Ok(Self {
            client,
            settings: RwLock::new(Arc::new(settings)),
        })
    }

    pub fn settings(&self) -> Arc<RemoteSettings> {
        self.settings.read().clone()
    }

    pub fn set_settings(&self, settings: RemoteSettings) {
        *self.settings.write() = Arc::new(settings);
    }

    async fn post_api<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let settings = self.settings();
        settings.ensure_ready()?;
        let url = format!("{}{}", settings.host.trim().trim_end_matches('/'), endpoint);

        trace!(url = %url, body = %body, "Remote API request");
        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, settings.token.as_str())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Remote {
                code: status.as_u16() as i64,
                message: text,
            });
        }

        let envelope: ApiResponse<T> = response.json().await?;
        if envelope.code != API_OK {
            return Err(Error::Remote {
                code: envelope.code,
                message: envelope.message,
            });
        }
        envelope.data.ok_or_else(|| Error::Remote {
            code: envelope.code,
            message: format!("{endpoint} returned no data"),
        })
    }
}

#[async_trait]
impl RemoteIndex for AlistClient {
    async fn list_page(&self, path: &str, page: u32, per_page: u32) -> Result<RemotePage> {
        super::validate_remote_path(path)?;
        let settings = self.settings();
        let per_page = if per_page == 0 {
            settings.effective_per_page()
        } else {
            per_page
        };

        let data: ListData = self
            .post_api(
                "/api/fs/list",
                json!({
                    "path": path,
                    "password": "",
                    "page": page.max(1),
                    "per_page": per_page,
                    "refresh": settings.refresh,
                }),
            )
            .await?;

        let entries: Vec<RemoteEntry> = data
            .content
            .unwrap_or_default()
            .into_iter()
            .map(|entry| {
                let child = join_remote_path(path, &entry.name);
                entry.into_entry(child)
            })
            .collect();

        debug!(path = %path, page, count = entries.len(), total = data.total, "Listed remote page");
        Ok(RemotePage {
            entries,
            total: data.total,
        })
    }

    async fn get_info(&self, path: &str) -> Result<RemoteEntry> {
        super::validate_remote_path(path)?;
        let data: ApiEntry = self
            .post_api("/api/fs/get", json!({ "path": path, "password": "" }))
            .await?;
        Ok(data.into_entry(path.to_string()))
    }

    async fn fetch_bytes(&self, entry: &RemoteEntry) -> Result<Bytes> {
        super::validate_remote_path(&entry.path)?;
        let settings = self.settings();

        let request = match entry.raw_url.as_deref() {
            Some(raw_url) => self.client.get(raw_url),
            None => {
                settings.ensure_ready()?;
                let mut url = format!(
                    "{}/d{}",
                    settings.host.trim().trim_end_matches('/'),
                    encode_remote_path(&entry.path)
                );
                if !entry.sign.is_empty() {
                    url.push_str("?sign=");
                    url.push_str(&urlencoding::encode(&entry.sign));
                }
                self.client
                    .get(url)
                    .header(AUTHORIZATION, settings.token.as_str())
            }
        };

        let response = request.send().await?.error_for_status()?;
        Ok(response.bytes().await?)
    }

    fn default_per_page(&self) -> u32 {
        self.settings().effective_per_page()
    }
}

impl SettingsSubscriber for AlistClient {
    fn name(&self) -> &'static str {
        "remote-client"
    }

    fn apply_settings(&self, settings: &AppSettings) {
        self.set_settings(settings.remote.clone());
    }
}
