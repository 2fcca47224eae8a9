use std::{sync::OnceLock, time::Duration};

use tracing::debug;

/// Timeout for a single remote request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("strm-sync/", env!("CARGO_PKG_VERSION"));

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate may have installed one first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Client builder shared by the remote index client and notification channels.
pub fn default_client_builder() -> reqwest::ClientBuilder {
    install_rustls_provider();
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(DEFAULT_REQUEST_TIMEOUT)
        .pool_max_idle_per_host(4)
}

#[cfg(test)]
pub(crate) fn test_client() -> reqwest::Client {
    default_client_builder().build().unwrap()
}
