use std::{sync::OnceLock, time::Duration};

use tracing::debug;

use crate::Result;

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Can happen if another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build a client whose every request goes through `proxy_url`.
///
/// System/env proxy settings are ignored so a probe measures exactly the
/// egress path it names.
pub fn client_via_proxy(proxy_url: &str, timeout: Duration) -> Result<reqwest::Client> {
    install_rustls_provider();

    let proxy = reqwest::Proxy::all(proxy_url)
        .map_err(|e| crate::Error::config(format!("invalid proxy URL {proxy_url}: {e}")))?;

    reqwest::Client::builder()
        .proxy(proxy)
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .map_err(|e| crate::Error::Other(format!("failed to build HTTP client: {e}")))
}
