//! Proxy health registry.
//!
//! Each candidate carries its own lock, so reporting an outcome for one proxy
//! never blocks selection or reporting on another. A proxy becomes selectable
//! only after its first successful health check or session.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::probe::ProxyProber;
use crate::error::{Error, Result};

/// Weight of the newest sample in the rolling latency average.
const LATENCY_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyHealth {
    /// Not checked yet. Not selectable.
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl ProxyHealth {
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    fn demoted(self) -> Self {
        match self {
            Self::Healthy => Self::Degraded,
            Self::Unknown | Self::Degraded | Self::Unhealthy => Self::Unhealthy,
        }
    }
}

/// A configured proxy. Lower `priority` is preferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEntry {
    pub url: String,
    #[serde(default)]
    pub priority: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyPoolConfig {
    #[serde(default)]
    pub proxies: Vec<ProxyEntry>,
    /// Use a direct connection when no proxy is usable.
    #[serde(default = "default_true")]
    pub fallback_to_direct: bool,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// Consecutive failures that demote a proxy by one health level.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_probe_url")]
    pub probe_url: String,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_health_check_interval_secs() -> u64 {
    60
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_probe_url() -> String {
    "https://www.gstatic.com/generate_204".to_string()
}

fn default_probe_timeout_secs() -> u64 {
    10
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            proxies: Vec::new(),
            fallback_to_direct: default_true(),
            health_check_interval_secs: default_health_check_interval_secs(),
            failure_threshold: default_failure_threshold(),
            probe_url: default_probe_url(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

/// The network path chosen for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Egress {
    Proxy { url: String, priority: u32 },
    Direct,
}

impl Egress {
    pub fn proxy_url(&self) -> Option<&str> {
        match self {
            Self::Proxy { url, .. } => Some(url),
            Self::Direct => None,
        }
    }
}

#[derive(Debug, Clone)]
struct CandidateState {
    health: ProxyHealth,
    consecutive_failures: u32,
    last_check: Option<DateTime<Utc>>,
    avg_response_ms: Option<f64>,
}

#[derive(Debug)]
struct ProxyCandidate {
    url: String,
    priority: u32,
    state: Mutex<CandidateState>,
}

impl ProxyCandidate {
    fn new(entry: &ProxyEntry) -> Self {
        Self {
            url: entry.url.clone(),
            priority: entry.priority,
            state: Mutex::new(CandidateState {
                health: ProxyHealth::Unknown,
                consecutive_failures: 0,
                last_check: None,
                avg_response_ms: None,
            }),
        }
    }

    fn snapshot(&self) -> ProxySnapshot {
        let state = self.state.lock();
        ProxySnapshot {
            url: self.url.clone(),
            priority: self.priority,
            health: state.health,
            consecutive_failures: state.consecutive_failures,
            last_check: state.last_check,
            avg_response_ms: state.avg_response_ms,
        }
    }
}

/// Point-in-time view of one candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxySnapshot {
    pub url: String,
    pub priority: u32,
    pub health: ProxyHealth,
    pub consecutive_failures: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub avg_response_ms: Option<f64>,
}

pub struct ProxyHealthRegistry {
    candidates: Vec<ProxyCandidate>,
    fallback_to_direct: bool,
    failure_threshold: u32,
    prober: Arc<dyn ProxyProber>,
}

impl ProxyHealthRegistry {
    pub fn new(config: &ProxyPoolConfig, prober: Arc<dyn ProxyProber>) -> Self {
        Self {
            candidates: build_candidates(&config.proxies),
            fallback_to_direct: config.fallback_to_direct,
            failure_threshold: config.failure_threshold.max(1),
            prober,
        }
    }

    /// Highest-priority healthy or degraded proxy. Proxies that were never
    /// checked are skipped like unhealthy ones. Direct when none is usable and
    /// the fallback is enabled.
    pub fn select_best(&self) -> Result<Egress> {
        let candidates = &self.candidates;
        let best = candidates
            .iter()
            .filter(|c| c.state.lock().health.is_usable())
            .min_by_key(|c| c.priority);

        match best {
            Some(c) => Ok(Egress::Proxy {
                url: c.url.clone(),
                priority: c.priority,
            }),
            None if self.fallback_to_direct => {
                if !candidates.is_empty() {
                    debug!("No usable proxy, falling back to direct connection");
                }
                Ok(Egress::Direct)
            }
            None => Err(Error::EgressUnavailable),
        }
    }

    /// Record the outcome of a probe or of real traffic through `url`.
    /// Unknown URLs (e.g. removed since selection) are ignored.
    pub fn report_outcome(&self, url: &str, success: bool, latency: Option<Duration>) {
        let Some(candidate) = self.candidates.iter().find(|c| c.url == url) else {
            debug!(proxy = %url, "Outcome for unknown proxy ignored");
            return;
        };

        let mut state = candidate.state.lock();
        state.last_check = Some(Utc::now());
        if let Some(latency) = latency {
            let sample = latency.as_secs_f64() * 1000.0;
            state.avg_response_ms = Some(match state.avg_response_ms {
                Some(avg) => LATENCY_ALPHA * sample + (1.0 - LATENCY_ALPHA) * avg,
                None => sample,
            });
        }

        let previous = state.health;
        if success {
            state.consecutive_failures = 0;
            state.health = ProxyHealth::Healthy;
        } else {
            state.consecutive_failures += 1;
            if state.consecutive_failures >= self.failure_threshold {
                state.health = state.health.demoted();
                state.consecutive_failures = 0;
            }
        }

        if previous != state.health {
            if state.health == ProxyHealth::Unhealthy {
                warn!(proxy = %url, from = ?previous, "Proxy marked unhealthy");
            } else {
                info!(proxy = %url, from = ?previous, to = ?state.health, "Proxy health changed");
            }
        }
    }

    pub fn snapshot(&self) -> Vec<ProxySnapshot> {
        self.candidates.iter().map(|c| c.snapshot()).collect()
    }

    pub fn health_of(&self, url: &str) -> Option<ProxyHealth> {
        self.candidates
            .iter()
            .find(|c| c.url == url)
            .map(|c| c.state.lock().health)
    }

    /// Probe every candidate concurrently, unhealthy ones included.
    pub async fn run_health_check_cycle(&self) -> Vec<ProxySnapshot> {
        let probes = self.candidates.iter().map(|c| {
            let prober = self.prober.clone();
            let url = c.url.clone();
            async move {
                let outcome = prober.probe(&url).await;
                (url, outcome)
            }
        });

        for (url, outcome) in join_all(probes).await {
            if let Some(error) = &outcome.error {
                debug!(proxy = %url, error = %error, "Proxy probe failed");
            }
            self.report_outcome(&url, outcome.success, Some(outcome.latency));
        }

        let snapshot = self.snapshot();
        let usable = snapshot.iter().filter(|s| s.health.is_usable()).count();
        debug!(total = snapshot.len(), usable, "Proxy health check cycle complete");
        snapshot
    }

    /// Run health checks every `interval` until `cancel` fires. The first
    /// cycle runs one interval after spawning.
    pub fn spawn_health_loop(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Proxy health loop shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        registry.run_health_check_cycle().await;
                    }
                }
            }
        })
    }
}

/// Build candidates in configuration order (stable for equal priorities).
/// Repeated URLs keep their first entry.
fn build_candidates(entries: &[ProxyEntry]) -> Vec<ProxyCandidate> {
    let mut out: Vec<ProxyCandidate> = Vec::with_capacity(entries.len());
    for entry in entries {
        if out.iter().all(|c| c.url != entry.url) {
            out.push(ProxyCandidate::new(entry));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::probe::{MockProxyProber, ProbeOutcome};
    use proptest::prelude::*;

    fn entries(urls: &[(&str, u32)]) -> Vec<ProxyEntry> {
        urls.iter()
            .map(|(url, priority)| ProxyEntry {
                url: url.to_string(),
                priority: *priority,
            })
            .collect()
    }

    fn registry(urls: &[(&str, u32)], fallback_to_direct: bool) -> ProxyHealthRegistry {
        let config = ProxyPoolConfig {
            proxies: entries(urls),
            fallback_to_direct,
            ..ProxyPoolConfig::default()
        };
        ProxyHealthRegistry::new(&config, Arc::new(MockProxyProber::new()))
    }

    fn mark_healthy(registry: &ProxyHealthRegistry, urls: &[&str]) {
        for url in urls {
            registry.report_outcome(url, true, None);
        }
    }

    fn fail(registry: &ProxyHealthRegistry, url: &str, times: u32) {
        for _ in 0..times {
            registry.report_outcome(url, false, None);
        }
    }

    #[test]
    fn test_selects_lowest_rank_and_keeps_config_order_on_ties() {
        let r = registry(&[("http://b", 2), ("http://a", 1), ("http://c", 1)], false);
        mark_healthy(&r, &["http://a", "http://b", "http://c"]);
        assert_eq!(
            r.select_best().unwrap(),
            Egress::Proxy {
                url: "http://a".into(),
                priority: 1
            }
        );
    }

    #[test]
    fn test_unchecked_proxies_are_not_selected() {
        let r = registry(&[("http://a", 1)], true);
        assert_eq!(r.select_best().unwrap(), Egress::Direct);

        let strict = registry(&[("http://a", 1)], false);
        assert!(matches!(strict.select_best(), Err(Error::EgressUnavailable)));
        mark_healthy(&strict, &["http://a"]);
        assert_eq!(strict.select_best().unwrap().proxy_url(), Some("http://a"));
    }

    #[test]
    fn test_unchecked_proxy_failing_goes_straight_to_unhealthy() {
        let r = registry(&[("http://a", 1)], false);
        fail(&r, "http://a", 3);
        assert_eq!(r.health_of("http://a"), Some(ProxyHealth::Unhealthy));
    }

    #[test]
    fn test_threshold_demotes_one_step_and_restarts_counter() {
        let r = registry(&[("http://a", 1)], false);
        r.report_outcome("http://a", true, None);
        fail(&r, "http://a", 2);
        assert_eq!(r.health_of("http://a"), Some(ProxyHealth::Healthy));
        fail(&r, "http://a", 1);
        assert_eq!(r.health_of("http://a"), Some(ProxyHealth::Degraded));
        assert_eq!(r.snapshot()[0].consecutive_failures, 0);
        fail(&r, "http://a", 3);
        assert_eq!(r.health_of("http://a"), Some(ProxyHealth::Unhealthy));
    }

    #[test]
    fn test_success_promotes_immediately() {
        let r = registry(&[("http://a", 1)], false);
        fail(&r, "http://a", 6);
        assert_eq!(r.health_of("http://a"), Some(ProxyHealth::Unhealthy));
        r.report_outcome("http://a", true, None);
        assert_eq!(r.health_of("http://a"), Some(ProxyHealth::Healthy));
        assert_eq!(r.snapshot()[0].consecutive_failures, 0);
    }

    #[test]
    fn test_failover_to_next_candidate() {
        let r = registry(&[("http://a", 1), ("http://b", 2)], false);
        mark_healthy(&r, &["http://a", "http://b"]);
        fail(&r, "http://a", 3);
        assert_eq!(r.select_best().unwrap().proxy_url(), Some("http://a"));
        fail(&r, "http://a", 3);
        assert_eq!(r.select_best().unwrap().proxy_url(), Some("http://b"));
    }

    #[test]
    fn test_all_unhealthy_without_fallback_is_unavailable() {
        let r = registry(&[("http://a", 1), ("http://b", 2)], false);
        fail(&r, "http://a", 6);
        fail(&r, "http://b", 6);
        assert!(matches!(r.select_best(), Err(Error::EgressUnavailable)));
    }

    #[test]
    fn test_all_unhealthy_with_fallback_is_direct() {
        let r = registry(&[("http://a", 1)], true);
        fail(&r, "http://a", 6);
        assert_eq!(r.select_best().unwrap(), Egress::Direct);
        assert_eq!(registry(&[], true).select_best().unwrap(), Egress::Direct);
    }

    #[test]
    fn test_latency_rolling_average() {
        let r = registry(&[("http://a", 1)], false);
        r.report_outcome("http://a", true, Some(Duration::from_millis(100)));
        r.report_outcome("http://a", true, Some(Duration::from_millis(200)));
        let avg = r.snapshot()[0].avg_response_ms.unwrap();
        assert!((avg - 130.0).abs() < 1e-6);
    }

    #[test]
    fn test_concurrent_reports_do_not_tear() {
        let r = Arc::new(registry(&[("http://a", 1), ("http://b", 2)], false));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let r = r.clone();
                std::thread::spawn(move || {
                    let url = if i % 2 == 0 { "http://a" } else { "http://b" };
                    for _ in 0..300 {
                        r.report_outcome(url, false, None);
                        let _ = r.select_best();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        for snap in r.snapshot() {
            assert_eq!(snap.health, ProxyHealth::Unhealthy);
            assert!(snap.consecutive_failures < 3);
        }
    }

    #[tokio::test]
    async fn test_health_cycle_probes_every_candidate() {
        let mut prober = MockProxyProber::new();
        prober.expect_probe().times(2).returning(|url| {
            if url == "http://a" {
                ProbeOutcome::failed(Duration::from_millis(10), "timeout")
            } else {
                ProbeOutcome::ok(Duration::from_millis(20))
            }
        });
        let config = ProxyPoolConfig {
            proxies: entries(&[("http://a", 1), ("http://b", 2)]),
            failure_threshold: 1,
            fallback_to_direct: false,
            ..ProxyPoolConfig::default()
        };
        let r = ProxyHealthRegistry::new(&config, Arc::new(prober));

        let snapshot = r.run_health_check_cycle().await;

        assert_eq!(snapshot[0].health, ProxyHealth::Unhealthy);
        assert_eq!(snapshot[1].health, ProxyHealth::Healthy);
        assert_eq!(r.select_best().unwrap().proxy_url(), Some("http://b"));
        assert!(snapshot.iter().all(|s| s.last_check.is_some()));
    }

    #[tokio::test]
    async fn test_unhealthy_candidates_are_still_probed_and_recover() {
        let mut prober = MockProxyProber::new();
        prober
            .expect_probe()
            .times(1)
            .returning(|_| ProbeOutcome::ok(Duration::from_millis(5)));
        let config = ProxyPoolConfig {
            proxies: entries(&[("http://a", 1)]),
            fallback_to_direct: false,
            ..ProxyPoolConfig::default()
        };
        let r = ProxyHealthRegistry::new(&config, Arc::new(prober));
        fail(&r, "http://a", 6);

        r.run_health_check_cycle().await;

        assert_eq!(r.health_of("http://a"), Some(ProxyHealth::Healthy));
    }

    #[tokio::test]
    async fn test_health_loop_stops_on_cancel() {
        let mut prober = MockProxyProber::new();
        prober
            .expect_probe()
            .returning(|_| ProbeOutcome::ok(Duration::from_millis(1)));
        let config = ProxyPoolConfig {
            proxies: entries(&[("http://a", 1)]),
            ..ProxyPoolConfig::default()
        };
        let r = Arc::new(ProxyHealthRegistry::new(&config, Arc::new(prober)));
        let cancel = CancellationToken::new();
        let handle = r.spawn_health_loop(Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(r.health_of("http://a"), Some(ProxyHealth::Healthy));
    }

    fn model_step(health: ProxyHealth, failures: u32, success: bool, threshold: u32) -> (ProxyHealth, u32) {
        if success {
            return (ProxyHealth::Healthy, 0);
        }
        if failures + 1 >= threshold {
            (health.demoted(), 0)
        } else {
            (health, failures + 1)
        }
    }

    proptest! {
        #[test]
        fn prop_health_follows_threshold_model(
            outcomes in proptest::collection::vec(any::<bool>(), 0..60),
            threshold in 1u32..5,
        ) {
            let config = ProxyPoolConfig {
                proxies: entries(&[("http://a", 1)]),
                failure_threshold: threshold,
                fallback_to_direct: false,
                ..ProxyPoolConfig::default()
            };
            let r = ProxyHealthRegistry::new(&config, Arc::new(MockProxyProber::new()));
            let (mut health, mut failures) = (ProxyHealth::Unknown, 0u32);

            for success in outcomes {
                r.report_outcome("http://a", success, None);
                (health, failures) = model_step(health, failures, success, threshold);
                let snap = &r.snapshot()[0];
                prop_assert_eq!(snap.health, health);
                prop_assert_eq!(snap.consecutive_failures, failures);
                prop_assert_eq!(r.select_best().is_ok(), health.is_usable());
            }
        }
    }
}
