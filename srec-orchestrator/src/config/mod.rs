//! Orchestrator configuration.
//!
//! Loaded from a JSON file (`SREC_CONFIG`, default `srec.json`; a missing
//! file means all defaults), then overridden from the environment and
//! validated once at startup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::ApiServerConfig;
use crate::domain::StreamerSource;
use crate::error::{Error, Result};
use crate::orphan::OrphanConfig;
use crate::process::SupervisorConfig;
use crate::proxy::ProxyPoolConfig;
use crate::recording::{CaptureSettings, RecordingConfig};
use crate::remux::RemuxSettings;
use crate::utils::fs;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "SREC_CONFIG";

pub const DEFAULT_CONFIG_FILE: &str = "srec.json";

/// External binaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPaths {
    #[serde(default = "default_streamlink")]
    pub streamlink: String,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
}

fn default_streamlink() -> String {
    "streamlink".to_string()
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            streamlink: default_streamlink(),
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Emit the application log as JSON lines.
    #[serde(default)]
    pub log_json: bool,
    /// Filter directive applied after startup, e.g. `srec_orchestrator=debug`.
    #[serde(default)]
    pub log_filter: Option<String>,
    #[serde(default)]
    pub tools: ToolPaths,
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub remux: RemuxSettings,
    #[serde(default)]
    pub proxy: ProxyPoolConfig,
    #[serde(default)]
    pub orphan: OrphanConfig,
    /// Soft cap on concurrent sessions. Unbounded when absent.
    #[serde(default)]
    pub max_concurrent_sessions: Option<usize>,
    #[serde(default)]
    pub api: ApiServerConfig,
    #[serde(default)]
    pub sources: Vec<StreamerSource>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("recordings")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            log_dir: default_log_dir(),
            log_json: false,
            log_filter: None,
            tools: ToolPaths::default(),
            capture: CaptureSettings::default(),
            supervisor: SupervisorConfig::default(),
            remux: RemuxSettings::default(),
            proxy: ProxyPoolConfig::default(),
            orphan: OrphanConfig::default(),
            max_concurrent_sessions: None,
            api: ApiServerConfig::default(),
            sources: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from `SREC_CONFIG` (or `srec.json`), apply environment overrides
    /// and validate.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());

        let mut config = Self::from_file_or_default(Path::new(&path))?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file_or_default(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = Self::from_json(&content)?;
                info!(path = %path.display(), sources = config.sources.len(), "Loaded configuration");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No configuration file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(fs::io_error("reading configuration", path, e)),
        }
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Apply overrides from a key lookup (the process environment in
    /// production). Blank values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = get("SREC_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("SREC_LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Some(path) = get("STREAMLINK_PATH") {
            self.tools.streamlink = path;
        }
        if let Some(path) = get("FFMPEG_PATH") {
            self.tools.ffmpeg = path;
        }
        if let Some(path) = get("FFPROBE_PATH") {
            self.tools.ffprobe = path;
        }
        self.api.apply_overrides(get);
    }

    /// Reject settings that cannot work.
    pub fn validate(&self) -> Result<()> {
        let proxy = &self.proxy;
        if proxy.failure_threshold == 0 {
            return Err(Error::config("proxy.failure_threshold must be at least 1"));
        }
        if proxy.health_check_interval_secs == 0 || proxy.probe_timeout_secs == 0 {
            return Err(Error::config(
                "proxy health check interval and probe timeout must be positive",
            ));
        }
        for entry in &proxy.proxies {
            let url = reqwest::Url::parse(&entry.url)
                .map_err(|e| Error::config(format!("invalid proxy url {:?}: {e}", entry.url)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(Error::config(format!(
                    "unsupported proxy scheme {:?} in {}",
                    url.scheme(),
                    entry.url
                )));
            }
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() || source.url.trim().is_empty() {
                return Err(Error::config("every source needs an id and a url"));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(Error::config(format!("duplicate source id {:?}", source.id)));
            }
        }

        let capture = &self.capture;
        if capture.raw_extension.is_empty() || capture.final_extension.is_empty() {
            return Err(Error::config("artifact extensions must not be empty"));
        }
        if capture.raw_extension.eq_ignore_ascii_case(&capture.final_extension) {
            return Err(Error::config(
                "raw and final extensions must differ, the final artifact would overwrite the raw one",
            ));
        }
        if capture.retry.max_attempts == 0 || capture.retry.backoff_multiplier < 1.0 {
            return Err(Error::config(
                "capture.retry needs max_attempts >= 1 and backoff_multiplier >= 1.0",
            ));
        }
        capture.classifier()?;

        if self.supervisor.graceful_stop_secs == 0 {
            return Err(Error::config("supervisor.graceful_stop_secs must be positive"));
        }
        if !self.remux.duration_tolerance_secs.is_finite() || self.remux.duration_tolerance_secs < 0.0
        {
            return Err(Error::config("remux.duration_tolerance_secs must be >= 0"));
        }
        if !(self.orphan.min_final_ratio > 0.0 && self.orphan.min_final_ratio <= 1.0) {
            return Err(Error::config("orphan.min_final_ratio must be in (0, 1]"));
        }
        if self.max_concurrent_sessions == Some(0) {
            return Err(Error::config(
                "max_concurrent_sessions must be at least 1 (omit it for no limit)",
            ));
        }
        Ok(())
    }

    pub fn recording_config(&self) -> RecordingConfig {
        RecordingConfig {
            output_dir: self.output_dir.clone(),
            log_dir: self.log_dir.clone(),
            capture_program: self.tools.streamlink.clone(),
            capture: self.capture.clone(),
            max_concurrent_sessions: self.max_concurrent_sessions,
        }
    }
}
