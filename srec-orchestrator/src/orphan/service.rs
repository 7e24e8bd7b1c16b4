//! Orphan recovery.
//!
//! `scan` is read-only and returns the candidate list; `enqueue` is the only
//! step that touches the filesystem. A dry run walks the same candidates as a
//! live run and only skips the mutation, so a preview and the real sweep
//! always agree on what they cover.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::logging::StageLog;
use crate::remux::{PostProcessArtifact, RemuxPipeline, RemuxStrategy};
use crate::utils::filename::final_artifact_path;
use crate::utils::fs;

/// Appended to a raw artifact path to flag it as unrecoverable. Flagged
/// artifacts are left in place and excluded from later scans.
pub const FAILED_MARKER_SUFFIX: &str = ".remux-failed";

/// Tells the scanner which paths belong to live sessions.
pub trait ArtifactOwnership: Send + Sync {
    fn is_owned(&self, path: &Path) -> bool;
}

impl<F> ArtifactOwnership for F
where
    F: Fn(&Path) -> bool + Send + Sync,
{
    fn is_owned(&self, path: &Path) -> bool {
        self(path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrphanConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Raw artifacts younger than this are presumed in progress.
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,

    /// Raw artifacts smaller than this are skipped.
    #[serde(default = "default_min_raw_size_bytes")]
    pub min_raw_size_bytes: u64,

    /// A finished artifact counts as plausible when it is at least this
    /// fraction of the raw size.
    #[serde(default = "default_min_final_ratio")]
    pub min_final_ratio: f64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_max_age_hours() -> u64 {
    6
}

fn default_min_raw_size_bytes() -> u64 {
    1024 * 1024
}

fn default_min_final_ratio() -> f64 {
    0.5
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

impl Default for OrphanConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_age_hours: default_max_age_hours(),
            min_raw_size_bytes: default_min_raw_size_bytes(),
            min_final_ratio: default_min_final_ratio(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl OrphanConfig {
    pub fn with_max_age_hours(mut self, hours: u64) -> Self {
        self.max_age_hours = hours;
        self
    }

    pub fn with_min_raw_size_bytes(mut self, bytes: u64) -> Self {
        self.min_raw_size_bytes = bytes;
        self
    }
}

/// A raw artifact eligible for recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanCandidate {
    pub raw_path: PathBuf,
    pub target_path: PathBuf,
    pub raw_size: u64,
    pub is_directory: bool,
    pub modified_at: DateTime<Utc>,
    /// Size of an existing but implausibly small finished artifact.
    pub existing_final_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CandidateOutcome {
    /// Dry run: would be remuxed.
    WouldRecover,
    /// `strategy` is `None` when a valid target already existed.
    Recovered { strategy: Option<RemuxStrategy> },
    Failed { reason: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateResult {
    pub raw_path: PathBuf,
    #[serde(flatten)]
    pub outcome: CandidateOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub dry_run: bool,
    pub results: Vec<CandidateResult>,
}

impl RecoveryReport {
    pub fn candidate_paths(&self) -> Vec<&Path> {
        self.results.iter().map(|r| r.raw_path.as_path()).collect()
    }

    pub fn recovered(&self) -> usize {
        self.count(|o| matches!(o, CandidateOutcome::Recovered { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, CandidateOutcome::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, CandidateOutcome::Skipped { .. }))
    }

    fn count(&self, pred: impl Fn(&CandidateOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }
}

pub struct OrphanRecoveryService {
    config: OrphanConfig,
    root: PathBuf,
    raw_extension: String,
    final_extension: String,
    log_dir: PathBuf,
    remux: Arc<RemuxPipeline>,
    ownership: Arc<dyn ArtifactOwnership>,
    in_flight: DashSet<PathBuf>,
}

impl OrphanRecoveryService {
    pub fn new(
        config: OrphanConfig,
        root: impl Into<PathBuf>,
        raw_extension: impl Into<String>,
        final_extension: impl Into<String>,
        log_dir: impl Into<PathBuf>,
        remux: Arc<RemuxPipeline>,
        ownership: Arc<dyn ArtifactOwnership>,
    ) -> Self {
        Self {
            config,
            root: root.into(),
            raw_extension: raw_extension.into(),
            final_extension: final_extension.into(),
            log_dir: log_dir.into(),
            remux,
            ownership,
            in_flight: DashSet::new(),
        }
    }

    pub fn config(&self) -> &OrphanConfig {
        &self.config
    }

    /// Find orphaned raw artifacts under the recording root. Never mutates
    /// anything.
    pub async fn scan(&self, max_age_hours: u64) -> Result<Vec<OrphanCandidate>> {
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(max_age_hours.saturating_mul(3600)))
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut candidates = Vec::new();
        if !tokio::fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(candidates);
        }

        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| fs::io_error("reading recording directory", &dir, e))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| fs::io_error("reading recording directory", &dir, e))?
            {
                let path = entry.path();
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };

                if !self.has_raw_extension(&path) {
                    if meta.is_dir() {
                        pending.push(path);
                    }
                    continue;
                }

                if let Some(candidate) = self.evaluate(path, &meta, cutoff).await {
                    candidates.push(candidate);
                }
            }
        }

        candidates.sort_by(|a, b| a.raw_path.cmp(&b.raw_path));
        debug!(root = %self.root.display(), count = candidates.len(), "Orphan scan finished");
        Ok(candidates)
    }

    fn has_raw_extension(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        // Scratch files of an interrupted two-step remux.
        if name.contains(".tmp.") {
            return false;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(&self.raw_extension))
    }

    async fn evaluate(
        &self,
        raw: PathBuf,
        meta: &std::fs::Metadata,
        cutoff: SystemTime,
    ) -> Option<OrphanCandidate> {
        let modified = meta.modified().ok()?;
        if modified > cutoff {
            return None;
        }

        if tokio::fs::try_exists(marker_path(&raw)).await.unwrap_or(false) {
            debug!(raw = %raw.display(), "Skipping artifact flagged as unrecoverable");
            return None;
        }

        let raw_size = if meta.is_dir() {
            fs::artifact_size(&raw).await.ok()?
        } else {
            meta.len()
        };
        if raw_size < self.config.min_raw_size_bytes {
            return None;
        }

        let target = final_artifact_path(&raw, &self.final_extension);
        let existing_final_size = match tokio::fs::metadata(&target).await {
            Ok(m) if m.is_file() => Some(m.len()),
            _ => None,
        };
        if let Some(size) = existing_final_size
            && size as f64 >= raw_size as f64 * self.config.min_final_ratio
        {
            return None;
        }

        if self.ownership.is_owned(&raw) || self.ownership.is_owned(&target) {
            debug!(raw = %raw.display(), "Skipping artifact owned by an active session");
            return None;
        }

        Some(OrphanCandidate {
            is_directory: meta.is_dir(),
            raw_path: raw,
            target_path: target,
            raw_size,
            modified_at: DateTime::<Utc>::from(modified),
            existing_final_size,
        })
    }

    /// Remux the candidates one by one. A failing candidate is flagged and
    /// never stops the rest of the batch.
    pub async fn enqueue(
        &self,
        candidates: &[OrphanCandidate],
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> RecoveryReport {
        let mut report = RecoveryReport {
            dry_run,
            results: Vec::with_capacity(candidates.len()),
        };

        for candidate in candidates {
            let outcome = if dry_run {
                CandidateOutcome::WouldRecover
            } else if cancel.is_cancelled() {
                CandidateOutcome::Skipped {
                    reason: Error::Cancelled.to_string(),
                }
            } else {
                self.recover(candidate, cancel).await
            };
            report.results.push(CandidateResult {
                raw_path: candidate.raw_path.clone(),
                outcome,
            });
        }

        if !dry_run && !report.results.is_empty() {
            info!(
                candidates = report.results.len(),
                recovered = report.recovered(),
                failed = report.failed(),
                skipped = report.skipped(),
                "Orphan recovery batch finished"
            );
        }
        report
    }

    async fn recover(
        &self,
        candidate: &OrphanCandidate,
        cancel: &CancellationToken,
    ) -> CandidateOutcome {
        let raw = &candidate.raw_path;
        if self.ownership.is_owned(raw) {
            return CandidateOutcome::Skipped {
                reason: "owned by an active session".to_string(),
            };
        }
        if !self.in_flight.insert(raw.clone()) {
            return CandidateOutcome::Skipped {
                reason: "recovery already in progress".to_string(),
            };
        }

        info!(raw = %raw.display(), size = candidate.raw_size, "Recovering orphaned artifact");
        let log = self.open_log(raw).await;
        let mut artifact = PostProcessArtifact::new(raw.clone(), candidate.target_path.clone());
        let result = self.remux.process(&mut artifact, &log, cancel).await;
        self.in_flight.remove(raw);

        match result {
            Ok(report) => CandidateOutcome::Recovered {
                strategy: report.strategy,
            },
            Err(Error::Cancelled) => CandidateOutcome::Skipped {
                reason: Error::Cancelled.to_string(),
            },
            Err(e) => {
                error!(raw = %raw.display(), error = %e, "Orphan recovery failed, flagging artifact");
                let reason = e.to_string();
                let marker = marker_path(raw);
                if let Err(e) = tokio::fs::write(&marker, reason.as_bytes()).await {
                    warn!(marker = %marker.display(), error = %e, "Failed to write failure marker");
                }
                CandidateOutcome::Failed { reason }
            }
        }
    }

    async fn open_log(&self, raw: &Path) -> StageLog {
        let stem = raw
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let path = self.log_dir.join("orphans").join(format!("{stem}_remux.log"));
        match StageLog::open_file(path).await {
            Ok(log) => log,
            Err(e) => {
                warn!(error = %e, "Cannot open orphan remux log");
                StageLog::disabled()
            }
        }
    }

    /// One scan plus enqueue with the configured age threshold.
    pub async fn sweep(
        &self,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<RecoveryReport> {
        let candidates = self.scan(self.config.max_age_hours).await?;
        Ok(self.enqueue(&candidates, dry_run, cancel).await)
    }

    /// Periodic sweep. `None` when recovery is disabled.
    pub fn spawn_sweep_loop(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            info!("Orphan recovery disabled");
            return None;
        }

        let service = Arc::clone(self);
        Some(tokio::spawn(async move {
            let period = Duration::from_secs(service.config.sweep_interval_secs.max(1));
            let mut tick = interval(period);
            info!(
                root = %service.root.display(),
                max_age_hours = service.config.max_age_hours,
                interval_secs = service.config.sweep_interval_secs,
                "Orphan recovery started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Orphan recovery shutting down");
                        break;
                    }
                    _ = tick.tick() => {
                        if let Err(e) = service.sweep(false, &cancel).await {
                            error!(error = %e, "Orphan sweep failed");
                        }
                    }
                }
            }
        }))
    }
}

fn marker_path(raw: &Path) -> PathBuf {
    let mut name: OsString = raw.as_os_str().to_owned();
    name.push(FAILED_MARKER_SUFFIX);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{CommandSpec, ProcessExit, ProcessRunner, Termination};
    use crate::remux::{MediaProber, RemuxSettings};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Copies the `-i` input to the output, or fails for inputs containing
    /// "broken".
    #[derive(Default)]
    struct CopyRunner {
        calls: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl ProcessRunner for CopyRunner {
        async fn run(
            &self,
            spec: &CommandSpec,
            _log: &StageLog,
            _cancel: &CancellationToken,
            _timeout: Option<Duration>,
        ) -> Result<ProcessExit> {
            let args = spec.args();
            let input = args
                .iter()
                .position(|a| a == "-i")
                .and_then(|i| args.get(i + 1))
                .unwrap()
                .clone();
            let target = args.last().unwrap().clone();
            self.calls.lock().push(PathBuf::from(&input));

            let code = if input.contains("broken") {
                1
            } else {
                tokio::fs::copy(&input, &target).await.unwrap();
                0
            };
            Ok(ProcessExit {
                code: Some(code),
                termination: Termination::Exited,
                stdout_tail: Vec::new(),
                stderr_tail: vec!["conversion failed".to_string()],
                elapsed: Duration::ZERO,
            })
        }
    }

    struct UnknownDuration;

    #[async_trait]
    impl MediaProber for UnknownDuration {
        async fn duration(&self, _path: &Path) -> Result<Option<f64>> {
            Ok(None)
        }
    }

    fn config() -> OrphanConfig {
        OrphanConfig::default()
            .with_max_age_hours(0)
            .with_min_raw_size_bytes(4)
    }

    fn service(
        root: &Path,
        runner: Arc<CopyRunner>,
        ownership: Arc<dyn ArtifactOwnership>,
    ) -> OrphanRecoveryService {
        let remux = Arc::new(RemuxPipeline::new(
            RemuxSettings::default(),
            "ffmpeg",
            runner,
            Arc::new(UnknownDuration),
        ));
        OrphanRecoveryService::new(
            config(),
            root.join("out"),
            "ts",
            "mp4",
            root.join("logs"),
            remux,
            ownership,
        )
    }

    fn nobody() -> Arc<dyn ArtifactOwnership> {
        Arc::new(|_: &Path| false)
    }

    fn write(path: &Path, body: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[tokio::test]
    async fn test_scan_filters_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        write(&out.join("a/a_1.ts"), "orphaned data");
        write(&out.join("a/tiny.ts"), "x");
        write(&out.join("b/done.ts"), "finished data");
        write(&out.join("b/done.mp4"), "finished data");
        write(&out.join("b/short.ts"), "long raw payload here");
        write(&out.join("b/short.mp4"), "x");
        write(&out.join("b/x.video.tmp.ts"), "scratch data");
        write(&out.join("c/notes.txt"), "not media");

        let svc = service(dir.path(), Arc::new(CopyRunner::default()), nobody());
        let found = svc.scan(0).await.unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|c| c.raw_path.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a_1.ts", "short.ts"]);
        assert_eq!(found[1].existing_final_size, Some(1));
        assert_eq!(found[0].target_path, out.join("a/a_1.mp4"));
    }

    #[tokio::test]
    async fn test_scan_respects_age_threshold() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("out/a/fresh.ts"), "fresh data");
        let svc = service(dir.path(), Arc::new(CopyRunner::default()), nobody());
        assert!(svc.scan(1).await.unwrap().is_empty());
        assert_eq!(svc.scan(0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scan_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), Arc::new(CopyRunner::default()), nobody());
        assert!(svc.scan(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_excludes_owned_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let owned = dir.path().join("out/a/live.ts");
        write(&owned, "being captured");
        write(&dir.path().join("out/a/old.ts"), "orphaned data");

        let owned_clone = owned.clone();
        let ownership: Arc<dyn ArtifactOwnership> = Arc::new(move |p: &Path| p == owned_clone.as_path());
        let svc = service(dir.path(), Arc::new(CopyRunner::default()), ownership);

        let found = svc.scan(0).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].raw_path.ends_with("old.ts"));
    }

    #[tokio::test]
    async fn test_directory_artifacts_are_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let raw_dir = dir.path().join("out/a/segmented.ts");
        write(&raw_dir.join("000.ts"), "first");
        write(&raw_dir.join("001.ts"), "second");

        let svc = service(dir.path(), Arc::new(CopyRunner::default()), nobody());
        let found = svc.scan(0).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].is_directory);
        assert_eq!(found[0].raw_size, 11);
    }

    #[tokio::test]
    async fn test_dry_run_matches_live_run() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        write(&out.join("a/one.ts"), "orphaned one");
        write(&out.join("b/two.ts"), "orphaned two");

        let runner = Arc::new(CopyRunner::default());
        let svc = service(dir.path(), runner.clone(), nobody());
        let cancel = CancellationToken::new();

        let candidates = svc.scan(0).await.unwrap();
        let preview = svc.enqueue(&candidates, true, &cancel).await;
        assert!(preview.dry_run);
        assert!(runner.calls.lock().is_empty());
        assert!(!out.join("a/one.mp4").exists());
        assert_eq!(svc.scan(0).await.unwrap(), candidates);

        let live = svc.enqueue(&candidates, false, &cancel).await;
        assert_eq!(preview.candidate_paths(), live.candidate_paths());
        assert_eq!(live.recovered(), 2);
        assert!(out.join("a/one.mp4").exists());
        assert!(out.join("a/one.ts").exists());

        assert!(svc.scan(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_isolated_and_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        write(&out.join("a/broken.ts"), "bad payload");
        write(&out.join("a/good.ts"), "good payload");

        let svc = service(dir.path(), Arc::new(CopyRunner::default()), nobody());
        let report = svc.sweep(false, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.results.len(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.recovered(), 1);
        assert!(out.join("a/good.mp4").exists());
        assert!(out.join("a/broken.ts").exists());
        assert!(out.join("a/broken.ts.remux-failed").exists());

        // Flagged artifacts are not picked up again.
        assert!(svc.scan(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_undersized_final_is_remuxed_again() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        write(&out.join("a/short.ts"), "long raw payload here");
        write(&out.join("a/short.mp4"), "x");

        let runner = Arc::new(CopyRunner::default());
        let svc = service(dir.path(), runner.clone(), nobody());
        let report = svc.sweep(false, &CancellationToken::new()).await.unwrap();

        assert_eq!(
            report.results[0].outcome,
            CandidateOutcome::Recovered {
                strategy: Some(RemuxStrategy::CopyWithBsf)
            }
        );
        assert_eq!(runner.calls.lock().len(), 1);
        assert_eq!(
            std::fs::read_to_string(out.join("a/short.mp4")).unwrap(),
            "long raw payload here"
        );
    }

    #[tokio::test]
    async fn test_cancelled_batch_leaves_raw_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        write(&out.join("a/one.ts"), "orphaned one");

        let runner = Arc::new(CopyRunner::default());
        let svc = service(dir.path(), runner.clone(), nobody());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let candidates = svc.scan(0).await.unwrap();
        let report = svc.enqueue(&candidates, false, &cancel).await;
        assert_eq!(report.skipped(), 1);
        assert!(runner.calls.lock().is_empty());
        assert!(out.join("a/one.ts").exists());
        assert!(!out.join("a/one.ts.remux-failed").exists());
    }

    #[test]
    fn test_config_defaults() {
        let config: OrphanConfig = serde_json::from_str("{}").unwrap();
        assert!(config.enabled);
        assert_eq!(config.max_age_hours, 6);
        assert_eq!(config.min_final_ratio, 0.5);
        assert_eq!(config.sweep_interval_secs, 3600);
    }
}
