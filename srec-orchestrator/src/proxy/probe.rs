//! Reachability probes for proxy candidates.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::StatusCode;
use tracing::debug;

use crate::utils::http_client::client_via_proxy;

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub success: bool,
    pub latency: Duration,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn ok(latency: Duration) -> Self {
        Self {
            success: true,
            latency,
            error: None,
        }
    }

    pub fn failed(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            success: false,
            latency,
            error: Some(error.into()),
        }
    }
}

/// Checks whether a proxy can currently carry traffic.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProxyProber: Send + Sync {
    async fn probe(&self, proxy_url: &str) -> ProbeOutcome;
}

/// Probes by fetching a known URL through the proxy.
pub struct HttpProxyProber {
    probe_url: String,
    timeout: Duration,
    clients: DashMap<String, reqwest::Client>,
}

impl HttpProxyProber {
    pub fn new(probe_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            probe_url: probe_url.into(),
            timeout,
            clients: DashMap::new(),
        }
    }

    fn client_for(&self, proxy_url: &str) -> crate::Result<reqwest::Client> {
        if let Some(client) = self.clients.get(proxy_url) {
            return Ok(client.clone());
        }
        let client = client_via_proxy(proxy_url, self.timeout)?;
        self.clients.insert(proxy_url.to_string(), client.clone());
        Ok(client)
    }
}

/// A response proves the proxy forwarded the request, unless the proxy
/// itself produced the error.
fn proxy_forwarded(status: StatusCode) -> bool {
    !matches!(
        status,
        StatusCode::PROXY_AUTHENTICATION_REQUIRED
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

#[async_trait]
impl ProxyProber for HttpProxyProber {
    async fn probe(&self, proxy_url: &str) -> ProbeOutcome {
        let started = Instant::now();
        let client = match self.client_for(proxy_url) {
            Ok(client) => client,
            Err(e) => return ProbeOutcome::failed(started.elapsed(), e.to_string()),
        };

        let result = tokio::time::timeout(self.timeout, client.get(&self.probe_url).send()).await;
        let latency = started.elapsed();

        match result {
            Ok(Ok(response)) if proxy_forwarded(response.status()) => {
                debug!(proxy = %proxy_url, status = %response.status(), latency_ms = latency.as_millis() as u64, "Proxy probe ok");
                ProbeOutcome::ok(latency)
            }
            Ok(Ok(response)) => {
                ProbeOutcome::failed(latency, format!("proxy returned {}", response.status()))
            }
            Ok(Err(e)) => ProbeOutcome::failed(latency, e.to_string()),
            Err(_) => ProbeOutcome::failed(latency, "probe timed out"),
        }
    }
}
