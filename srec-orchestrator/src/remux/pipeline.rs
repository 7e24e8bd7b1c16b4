//! Raw-to-final container conversion with ordered fallbacks.
//!
//! Each strategy is tried in turn, every one with the audio repair filter. A
//! permission signature cleans the output path and re-runs the same strategy;
//! any other signature moves on to the next strategy. The raw artifact is
//! never modified, and a target that fails verification is removed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::artifact::{ArtifactStatus, PostProcessArtifact};
use super::probe::MediaProber;
use super::strategy::{RemuxInput, RemuxStrategy, intermediate_paths};
use crate::error::{Error, Result};
use crate::logging::StageLog;
use crate::process::classify::{Classifier, FailureClass};
use crate::process::retry::RetryPolicy;
use crate::process::supervisor::{ProcessRunner, Termination};
use crate::utils::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemuxSettings {
    /// Allowed difference between raw and final duration, in seconds.
    #[serde(default = "default_duration_tolerance_secs")]
    pub duration_tolerance_secs: f64,
    /// Upper bound for a single remux invocation. `None` = unbounded.
    #[serde(default)]
    pub invocation_timeout_secs: Option<u64>,
    /// Re-runs of the same strategy after a filesystem conflict.
    #[serde(default = "RetryPolicy::same_strategy")]
    pub same_strategy_retry: RetryPolicy,
}

fn default_duration_tolerance_secs() -> f64 {
    2.0
}

impl Default for RemuxSettings {
    fn default() -> Self {
        Self {
            duration_tolerance_secs: default_duration_tolerance_secs(),
            invocation_timeout_secs: None,
            same_strategy_retry: RetryPolicy::same_strategy(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemuxReport {
    pub raw: PathBuf,
    pub target: PathBuf,
    /// `None` when an existing, verified target was reused.
    pub strategy: Option<RemuxStrategy>,
    pub attempts: u32,
    pub raw_duration: Option<f64>,
    pub final_duration: Option<f64>,
    pub reused_existing: bool,
}

/// Why one attempt failed.
enum AttemptFailure {
    Cancelled,
    /// Ends the whole run, e.g. the remux tool cannot be started.
    Fatal(Error),
    Signature { class: FailureClass, message: String },
}

/// Attempt bookkeeping, kept even when the run fails.
#[derive(Debug, Default)]
struct Progress {
    attempts: u32,
    strategy: Option<RemuxStrategy>,
}

pub struct RemuxPipeline {
    settings: RemuxSettings,
    ffmpeg: String,
    runner: Arc<dyn ProcessRunner>,
    prober: Arc<dyn MediaProber>,
    classifier: Classifier,
}

impl RemuxPipeline {
    pub fn new(
        settings: RemuxSettings,
        ffmpeg: impl Into<String>,
        runner: Arc<dyn ProcessRunner>,
        prober: Arc<dyn MediaProber>,
    ) -> Self {
        Self {
            settings,
            ffmpeg: ffmpeg.into(),
            runner,
            prober,
            classifier: Classifier::remux(),
        }
    }

    /// Remux `artifact` and record the outcome on it.
    pub async fn process(
        &self,
        artifact: &mut PostProcessArtifact,
        log: &StageLog,
        cancel: &CancellationToken,
    ) -> Result<RemuxReport> {
        let mut progress = Progress::default();
        let result = self
            .run(&artifact.raw_path, &artifact.target_path, log, cancel, &mut progress)
            .await;

        artifact.attempts += progress.attempts;
        if progress.strategy.is_some() {
            artifact.strategy = progress.strategy;
        }
        artifact.status = match &result {
            Ok(_) => ArtifactStatus::Completed,
            Err(e) => ArtifactStatus::Failed {
                reason: e.to_string(),
            },
        };
        result
    }

    /// Convert `raw` into `target`.
    pub async fn remux(
        &self,
        raw: &Path,
        target: &Path,
        log: &StageLog,
        cancel: &CancellationToken,
    ) -> Result<RemuxReport> {
        self.run(raw, target, log, cancel, &mut Progress::default())
            .await
    }

    async fn run(
        &self,
        raw: &Path,
        target: &Path,
        log: &StageLog,
        cancel: &CancellationToken,
        progress: &mut Progress,
    ) -> Result<RemuxReport> {
        if tokio::fs::metadata(raw).await.is_err() {
            return Err(Error::not_found("raw artifact", raw.display().to_string()));
        }

        let raw_duration = match self.prober.duration(raw).await {
            Ok(d) => d,
            Err(e) => {
                warn!(raw = %raw.display(), error = %e, "Cannot read raw duration, verifying by size only");
                None
            }
        };

        // Reuse needs both durations; a target that cannot be compared may be
        // the truncated leftover of a crashed run.
        if raw_duration.is_some()
            && tokio::fs::metadata(target).await.is_ok()
            && let Ok(final_duration) = self.verify(target, raw_duration).await
        {
            info!(target = %target.display(), "Target already remuxed, reusing");
            log.note(&format!("reusing verified target {}", target.display()))
                .await;
            return Ok(RemuxReport {
                raw: raw.to_path_buf(),
                target: target.to_path_buf(),
                strategy: None,
                attempts: 0,
                raw_duration,
                final_duration,
                reused_existing: true,
            });
        }

        if let Some(parent) = target.parent() {
            fs::ensure_writable_dir(parent).await?;
        }
        if fs::remove_if_exists(target).await? {
            info!(target = %target.display(), "Removed stale remux output");
            log.note(&format!("removed stale target {}", target.display()))
                .await;
        }

        let input = self.prepare_input(raw, target).await?;
        let result = self
            .run_strategies(&input, raw, target, raw_duration, log, cancel, progress)
            .await;

        self.cleanup_scratch(target).await;
        if result.is_err() {
            if let Err(e) = fs::remove_if_exists(target).await {
                warn!(target = %target.display(), error = %e, "Failed to remove partial remux output");
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_strategies(
        &self,
        input: &RemuxInput,
        raw: &Path,
        target: &Path,
        raw_duration: Option<f64>,
        log: &StageLog,
        cancel: &CancellationToken,
        progress: &mut Progress,
    ) -> Result<RemuxReport> {
        let retry = &self.settings.same_strategy_retry;
        let mut last_error = String::from("no strategy attempted");

        for strategy in RemuxStrategy::ORDER {
            progress.strategy = Some(strategy);
            let mut strategy_attempts = 0u32;

            loop {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                strategy_attempts += 1;
                progress.attempts += 1;
                log.note(&format!("strategy={strategy} attempt={strategy_attempts}"))
                    .await;

                let failure = match self
                    .attempt(strategy, input, target, raw_duration, log, cancel)
                    .await
                {
                    Ok(final_duration) => {
                        info!(
                            raw = %raw.display(),
                            target = %target.display(),
                            strategy = %strategy,
                            attempts = progress.attempts,
                            "Remux complete"
                        );
                        return Ok(RemuxReport {
                            raw: raw.to_path_buf(),
                            target: target.to_path_buf(),
                            strategy: Some(strategy),
                            attempts: progress.attempts,
                            raw_duration,
                            final_duration,
                            reused_existing: false,
                        });
                    }
                    Err(AttemptFailure::Cancelled) => return Err(Error::Cancelled),
                    Err(AttemptFailure::Fatal(e)) => return Err(e),
                    Err(AttemptFailure::Signature { class, message }) => (class, message),
                };

                let (class, message) = failure;
                warn!(strategy = %strategy, class = ?class, error = %message, "Remux attempt failed");
                log.note(&format!("strategy={strategy} failed: {class:?}: {message}"))
                    .await;
                last_error = message;

                if class == FailureClass::PermissionDenied {
                    fs::remove_if_exists(target).await.map_err(|e| {
                        Error::fs_conflict(target, format!("cleanup after permission error failed: {e}"))
                    })?;
                    remove_intermediates(target).await;

                    let conflict = Error::fs_conflict(target, last_error.clone());
                    if retry.qualifies(&conflict) && retry.should_retry(strategy_attempts) {
                        let delay = retry.delay_for_attempt(strategy_attempts - 1);
                        debug!(strategy = %strategy, delay_ms = delay.as_millis() as u64, "Retrying strategy after cleanup");
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(Error::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                }
                break;
            }

            fs::remove_if_exists(target).await.ok();
        }

        Err(Error::ContainerRepair(format!(
            "all remux strategies failed for {}: {last_error}",
            raw.display()
        )))
    }

    async fn attempt(
        &self,
        strategy: RemuxStrategy,
        input: &RemuxInput,
        target: &Path,
        raw_duration: Option<f64>,
        log: &StageLog,
        cancel: &CancellationToken,
    ) -> std::result::Result<Option<f64>, AttemptFailure> {
        let timeout = self.settings.invocation_timeout_secs.map(Duration::from_secs);

        for spec in strategy.invocations(&self.ffmpeg, input, target) {
            let exit = self
                .runner
                .run(&spec, log, cancel, timeout)
                .await
                .map_err(AttemptFailure::Fatal)?;

            if exit.was_stopped() && cancel.is_cancelled() {
                return Err(AttemptFailure::Cancelled);
            }
            if exit.termination == Termination::TimedOut {
                return Err(AttemptFailure::Signature {
                    class: FailureClass::Unknown,
                    message: "remux exceeded its time limit".to_string(),
                });
            }
            if !exit.success() {
                let classification = self.classifier.classify(&exit.output_tail());
                let message = classification
                    .evidence
                    .unwrap_or_else(|| format!("remux exited with code {:?}", exit.code));
                return Err(AttemptFailure::Signature {
                    class: classification.class,
                    message,
                });
            }
        }

        self.verify(target, raw_duration)
            .await
            .map_err(|message| AttemptFailure::Signature {
                class: FailureClass::Unknown,
                message,
            })
    }

    /// Check that `target` exists, is non-empty and matches the raw duration.
    async fn verify(
        &self,
        target: &Path,
        raw_duration: Option<f64>,
    ) -> std::result::Result<Option<f64>, String> {
        let size = tokio::fs::metadata(target)
            .await
            .map(|m| m.len())
            .map_err(|_| format!("output {} was not produced", target.display()))?;
        if size == 0 {
            return Err(format!("output {} is empty", target.display()));
        }

        let final_duration = self
            .prober
            .duration(target)
            .await
            .map_err(|e| format!("output unreadable: {e}"))?;

        match (raw_duration, final_duration) {
            (Some(raw), Some(fin)) if (raw - fin).abs() > self.settings.duration_tolerance_secs => {
                Err(format!(
                    "duration mismatch: raw {raw:.2}s, output {fin:.2}s (tolerance {:.2}s)",
                    self.settings.duration_tolerance_secs
                ))
            }
            (Some(_), None) => Err("output reports no duration".to_string()),
            _ => Ok(final_duration),
        }
    }

    /// Directory artifacts are fed to the remux tool through a concat list.
    async fn prepare_input(&self, raw: &Path, target: &Path) -> Result<RemuxInput> {
        let metadata = tokio::fs::metadata(raw)
            .await
            .map_err(|e| fs::io_error("reading raw artifact", raw, e))?;
        if !metadata.is_dir() {
            return Ok(RemuxInput::File(raw.to_path_buf()));
        }

        let mut segments = Vec::new();
        let mut entries = tokio::fs::read_dir(raw)
            .await
            .map_err(|e| fs::io_error("listing raw artifact", raw, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| fs::io_error("listing raw artifact", raw, e))?
        {
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                segments.push(entry.path());
            }
        }
        segments.sort();
        if segments.is_empty() {
            return Err(Error::ContainerRepair(format!(
                "raw artifact directory {} has no segments",
                raw.display()
            )));
        }

        let list = concat_list_path(target);
        let body: String = segments
            .iter()
            .map(|p| format!("file '{}'\n", p.to_string_lossy().replace('\'', r"'\''")))
            .collect();
        tokio::fs::write(&list, body)
            .await
            .map_err(|e| fs::io_error("writing concat list", &list, e))?;
        Ok(RemuxInput::ConcatList(list))
    }

    async fn cleanup_scratch(&self, target: &Path) {
        remove_intermediates(target).await;
        remove_quietly(&concat_list_path(target)).await;
    }
}

async fn remove_intermediates(target: &Path) {
    let (video, audio) = intermediate_paths(target);
    remove_quietly(&video).await;
    remove_quietly(&audio).await;
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_if_exists(path).await {
        debug!(path = %path.display(), error = %e, "Failed to remove remux scratch file");
    }
}

fn concat_list_path(target: &Path) -> PathBuf {
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "remux".to_string());
    target.with_file_name(format!("{stem}.concat.txt"))
}
