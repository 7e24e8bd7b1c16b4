//! Recording lifecycle manager.
//!
//! Owns the per-source session table and drives each session through
//! capture and remux in its own task. A source has at most one non-terminal
//! session at any time; the table entry is reserved atomically before any
//! work starts.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::session::{RecordingSession, SessionEvent, SessionState};
use crate::domain::{LivenessSignal, StreamerSource};
use crate::error::{Error, FailureReason, Result};
use crate::logging::{Stage, StageLog};
use crate::orphan::ArtifactOwnership;
use crate::process::{
    CaptureCommandBuilder, CaptureToolOptions, Classifier, CommandSpec, FailureClass,
    ProcessHandle, ProcessSupervisor, RetryPolicy,
};
use crate::proxy::{Egress, ProxyHealthRegistry};
use crate::remux::{PostProcessArtifact, RemuxPipeline};
use crate::status::StatusSnapshot;
use crate::utils::filename::{
    final_artifact_path, raw_artifact_path, sanitize_filename, session_stem,
};
use crate::utils::fs;

/// Finished sessions kept in memory.
const HISTORY_LIMIT: usize = 256;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    #[serde(default = "default_raw_extension")]
    pub raw_extension: String,
    #[serde(default = "default_final_extension")]
    pub final_extension: String,
    #[serde(default)]
    pub tool: CaptureToolOptions,
    /// Respawn policy for transient capture failures.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Extra output signatures, checked after the built-in ones.
    #[serde(default)]
    pub failure_patterns: Vec<FailurePattern>,
}

/// A capture output signature and the failure class it maps to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePattern {
    pub pattern: String,
    pub class: FailureClass,
}

impl CaptureSettings {
    /// Built-in capture rules extended with `failure_patterns`.
    pub fn classifier(&self) -> Result<Classifier> {
        self.failure_patterns
            .iter()
            .try_fold(Classifier::capture(), |classifier, p| {
                classifier.with_rule(&p.pattern, p.class)
            })
    }
}

fn default_raw_extension() -> String {
    "ts".to_string()
}

fn default_final_extension() -> String {
    "mp4".to_string()
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            raw_extension: default_raw_extension(),
            final_extension: default_final_extension(),
            tool: CaptureToolOptions::default(),
            retry: RetryPolicy::default(),
            failure_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordingConfig {
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub capture_program: String,
    pub capture: CaptureSettings,
    /// Soft cap on concurrent sessions. `None` = unbounded.
    pub max_concurrent_sessions: Option<usize>,
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// The session was asked to stop.
    Stopping,
    /// The session was already stopping or post-processing.
    AlreadyStopping,
    /// No active session for the source.
    NotRecording,
}

struct ActiveSession {
    record: RwLock<RecordingSession>,
    /// Ends capture. Child of `abort`.
    stop: CancellationToken,
    /// Ends everything, remux included. Fired on shutdown only.
    abort: CancellationToken,
    _permit: Option<OwnedSemaphorePermit>,
}

impl ActiveSession {
    fn state(&self) -> SessionState {
        self.record.read().state
    }

    fn snapshot(&self) -> RecordingSession {
        self.record.read().clone()
    }
}

struct Inner {
    config: RecordingConfig,
    sources: DashMap<String, StreamerSource>,
    sessions: DashMap<String, Arc<ActiveSession>>,
    history: RwLock<VecDeque<RecordingSession>>,
    registry: Arc<ProxyHealthRegistry>,
    supervisor: Arc<ProcessSupervisor>,
    remux: Arc<RemuxPipeline>,
    classifier: Classifier,
    capacity: Option<Arc<Semaphore>>,
    events: broadcast::Sender<SessionEvent>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

#[derive(Clone)]
pub struct RecordingLifecycleManager {
    inner: Arc<Inner>,
}

impl RecordingLifecycleManager {
    pub fn new(
        config: RecordingConfig,
        registry: Arc<ProxyHealthRegistry>,
        supervisor: Arc<ProcessSupervisor>,
        remux: Arc<RemuxPipeline>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let capacity = config
            .max_concurrent_sessions
            .map(|limit| Arc::new(Semaphore::new(limit)));
        let classifier = config.capture.classifier().unwrap_or_else(|e| {
            warn!(error = %e, "Ignoring configured capture failure patterns");
            Classifier::capture()
        });

        Self {
            inner: Arc::new(Inner {
                config,
                sources: DashMap::new(),
                sessions: DashMap::new(),
                history: RwLock::new(VecDeque::new()),
                registry,
                supervisor,
                remux,
                classifier,
                capacity,
                events,
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Add or replace a source. Policy fields of a running session are not
    /// affected; they apply from the next start.
    pub fn upsert_source(&self, source: StreamerSource) {
        debug!(source_id = %source.id, name = %source.display_name, "Source updated");
        self.inner.sources.insert(source.id.clone(), source);
    }

    pub fn sources(&self) -> Vec<StreamerSource> {
        let mut sources: Vec<_> = self.inner.sources.iter().map(|s| s.clone()).collect();
        sources.sort_by(|a, b| a.id.cmp(&b.id));
        sources
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Start recording `source_id`. Returns the new session id once the
    /// capture process is running.
    pub async fn start_recording(&self, source_id: &str) -> Result<String> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let source = inner
            .sources
            .get(source_id)
            .map(|s| s.clone())
            .ok_or_else(|| Error::not_found("streamer source", source_id))?;

        let active = match inner.sessions.entry(source_id.to_string()) {
            Entry::Occupied(_) => {
                debug!(source_id = %source_id, "Start rejected: already recording");
                return Err(Error::AlreadyRecording(source.display_name));
            }
            Entry::Vacant(slot) => {
                let permit = match &inner.capacity {
                    Some(semaphore) => Some(semaphore.clone().try_acquire_owned().map_err(|_| {
                        Error::CapacityExhausted(inner.config.max_concurrent_sessions.unwrap_or(0))
                    })?),
                    None => None,
                };
                let abort = inner.shutdown.child_token();
                let active = Arc::new(ActiveSession {
                    record: RwLock::new(RecordingSession::new(&source)),
                    stop: abort.child_token(),
                    abort,
                    _permit: permit,
                });
                slot.insert(active.clone());
                active
            }
        };

        let session_id = active.record.read().id.clone();
        inner.emit(SessionEvent::new(&active.snapshot(), SessionState::Idle));
        info!(source_id = %source_id, session_id = %session_id, name = %source.display_name, "Session starting");

        match inner.launch(&active, &source).await {
            Ok(handle) => {
                let started = inner.transition(&active, SessionState::Capturing);
                if !started {
                    debug!(session_id = %session_id, "Stopped before capture began");
                }
                let task_inner = self.inner.clone();
                let task_source = source.clone();
                inner.tasks.spawn(async move {
                    task_inner.drive(active, handle, task_source).await;
                });
                Ok(session_id)
            }
            Err(e) => {
                inner.fail_and_archive(&active, e.failure_reason(), e.to_string());
                Err(e)
            }
        }
    }

    /// Ask the session of `source_id` to stop. Always accepted.
    pub fn stop_recording(&self, source_id: &str) -> StopOutcome {
        let Some(active) = self.inner.sessions.get(source_id).map(|e| e.clone()) else {
            return StopOutcome::NotRecording;
        };

        let outcome = match active.state() {
            SessionState::Starting | SessionState::Capturing => {
                if self.inner.transition(&active, SessionState::Stopping) {
                    StopOutcome::Stopping
                } else {
                    StopOutcome::AlreadyStopping
                }
            }
            SessionState::Idle
            | SessionState::Stopping
            | SessionState::PostProcessing
            | SessionState::Completed
            | SessionState::Failed => StopOutcome::AlreadyStopping,
        };
        active.stop.cancel();
        info!(source_id = %source_id, outcome = ?outcome, "Stop requested");
        outcome
    }

    /// React to the liveness detector. `Online` for a source that is already
    /// recording is not an error.
    pub async fn on_liveness(
        &self,
        source_id: &str,
        signal: LivenessSignal,
    ) -> Result<Option<String>> {
        match signal {
            LivenessSignal::Online => match self.start_recording(source_id).await {
                Ok(session_id) => Ok(Some(session_id)),
                Err(Error::AlreadyRecording(_)) => Ok(None),
                Err(e) => Err(e),
            },
            LivenessSignal::Offline => {
                self.stop_recording(source_id);
                Ok(None)
            }
        }
    }

    /// Current state of the source; `Idle` when nothing is running.
    pub fn state_of(&self, source_id: &str) -> SessionState {
        self.inner
            .sessions
            .get(source_id)
            .map(|active| active.state())
            .filter(|state| !state.is_terminal())
            .unwrap_or(SessionState::Idle)
    }

    /// The active session of the source, if any.
    pub fn session(&self, source_id: &str) -> Option<RecordingSession> {
        self.inner
            .sessions
            .get(source_id)
            .map(|active| active.snapshot())
    }

    pub fn active_sessions(&self) -> Vec<RecordingSession> {
        let mut sessions: Vec<_> = self
            .inner
            .sessions
            .iter()
            .map(|active| active.snapshot())
            .filter(|s| !s.state.is_terminal())
            .collect();
        sessions.sort_by(|a, b| a.source_name.cmp(&b.source_name));
        sessions
    }

    /// Finished sessions, oldest first.
    pub fn history(&self) -> Vec<RecordingSession> {
        self.inner.history.read().iter().cloned().collect()
    }

    /// Live view for the status surface.
    pub fn status(&self) -> StatusSnapshot {
        let names = self
            .active_sessions()
            .into_iter()
            .map(|s| s.source_name)
            .collect();
        StatusSnapshot::from_active(names)
    }

    /// Stop every session, cancel pending remux work (raw artifacts are
    /// kept) and wait up to `timeout` for session tasks to finish.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        info!(active = self.inner.sessions.len(), "Shutting down recording manager");
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        let finished = tokio::time::timeout(timeout, self.inner.tasks.wait())
            .await
            .is_ok();
        if !finished {
            warn!("Session tasks did not finish before the shutdown timeout");
        }
        finished
    }
}

impl ArtifactOwnership for RecordingLifecycleManager {
    fn is_owned(&self, path: &Path) -> bool {
        self.inner
            .sessions
            .iter()
            .any(|active| active.record.read().owns(path))
    }
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Apply a transition. Returns false when it is not allowed from the
    /// current state.
    fn transition(&self, active: &ActiveSession, to: SessionState) -> bool {
        let event = {
            let mut record = active.record.write();
            match record.transition(to) {
                Ok(from) => SessionEvent::new(&record, from),
                Err(e) => {
                    debug!(session_id = %record.id, error = %e, "Transition skipped");
                    return false;
                }
            }
        };
        debug!(session_id = %event.session_id, from = %event.from, to = %event.to, "Session transition");
        self.emit(event);
        true
    }

    fn fail_and_archive(
        &self,
        active: &Arc<ActiveSession>,
        reason: FailureReason,
        message: String,
    ) {
        let event = {
            let mut record = active.record.write();
            let from = record.fail(reason, message.clone());
            SessionEvent::new(&record, from)
        };
        warn!(
            session_id = %event.session_id,
            source = %event.source_name,
            reason = %reason,
            error = %message,
            "Session failed"
        );
        self.emit(event);
        self.archive(active);
    }

    fn archive(&self, active: &Arc<ActiveSession>) {
        let record = active.snapshot();
        self.sessions
            .remove_if(&record.source_id, |_, current| Arc::ptr_eq(current, active));

        let mut history = self.history.write();
        if history.len() >= HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(record);
    }

    fn capture_command(&self, source: &StreamerSource, egress: &Egress, raw: &Path) -> CommandSpec {
        CaptureCommandBuilder::new(
            &self.config.capture_program,
            &self.config.capture.tool,
            &source.url,
            &source.quality,
        )
        .output(raw)
        .egress(egress)
        .credential(source.credential.as_deref())
        .codecs(&source.codecs)
        .build()
    }

    async fn open_log(&self, record: &RecordingSession, stage: Stage) -> StageLog {
        let opened = StageLog::open(
            &self.config.log_dir,
            &record.source_name,
            record.started_at,
            stage,
        )
        .await;
        match opened {
            Ok(log) => log,
            Err(e) => {
                error!(session_id = %record.id, error = %e, "Cannot open session log, output will not be persisted");
                StageLog::disabled()
            }
        }
    }

    fn next_raw_path(&self, record: &RecordingSession) -> PathBuf {
        let dir = self
            .config
            .output_dir
            .join(sanitize_filename(&record.source_name));
        let stem = session_stem(&record.source_name, record.started_at);
        raw_artifact_path(
            &dir,
            &stem,
            record.raw_artifacts.len() as u32,
            &self.config.capture.raw_extension,
        )
    }

    /// Egress selection, output preparation and the first spawn.
    async fn launch(
        &self,
        active: &ActiveSession,
        source: &StreamerSource,
    ) -> Result<ProcessHandle> {
        let egress = self.registry.select_best()?;

        let (raw, record) = {
            let record = active.record.read();
            (self.next_raw_path(&record), record.clone())
        };
        if let Some(dir) = raw.parent() {
            fs::ensure_writable_dir(dir).await?;
        }

        if active.stop.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let log = self.open_log(&record, Stage::Capture).await;
        let spec = self.capture_command(source, &egress, &raw);
        let handle = self.supervisor.spawn(&spec, log).await?;

        let mut record = active.record.write();
        record.egress = Some(egress);
        record.raw_artifacts.push(raw);
        record.capture_attempts = 1;
        Ok(handle)
    }

    /// Session task: supervise capture (respawning on transient failures),
    /// then remux every captured part.
    async fn drive(
        self: Arc<Self>,
        active: Arc<ActiveSession>,
        handle: ProcessHandle,
        source: StreamerSource,
    ) {
        let capture_error = self.capture(&active, handle, &source).await;

        // Natural exits and errors pass through Stopping as well.
        if active.state() == SessionState::Capturing {
            self.transition(&active, SessionState::Stopping);
        }

        let record = active.snapshot();
        let mut parts = Vec::new();
        for raw in &record.raw_artifacts {
            match fs::artifact_size(raw).await {
                Ok(size) if size > 0 => parts.push(raw.clone()),
                _ => debug!(raw = %raw.display(), "Capture part is empty, skipping"),
            }
        }

        if parts.is_empty() {
            let (reason, message) = match &capture_error {
                Some(e) => (e.failure_reason(), e.to_string()),
                None => (FailureReason::NoDataCaptured, "capture produced no data".to_string()),
            };
            self.fail_and_archive(&active, reason, message);
            return;
        }

        if let Some(e) = &capture_error {
            active.record.write().error_message = Some(e.to_string());
        }
        self.transition(&active, SessionState::PostProcessing);

        let log = self.open_log(&record, Stage::Remux).await;
        let mut finals = Vec::new();
        let mut remux_error: Option<Error> = None;
        for raw in parts {
            let target = final_artifact_path(&raw, &self.config.capture.final_extension);
            let mut artifact = PostProcessArtifact::new(raw, target);
            match self.remux.process(&mut artifact, &log, &active.abort).await {
                Ok(_) => finals.push(artifact.target_path),
                Err(Error::Cancelled) => {
                    remux_error = Some(Error::Cancelled);
                    break;
                }
                Err(e) => {
                    error!(raw = %artifact.raw_path.display(), error = %e, "Remux failed, raw artifact kept");
                    remux_error.get_or_insert(e);
                }
            }
        }

        active.record.write().final_artifacts = finals;

        match remux_error {
            Some(e) => self.fail_and_archive(&active, e.failure_reason(), e.to_string()),
            None => {
                self.transition(&active, SessionState::Completed);
                let record = active.snapshot();
                info!(
                    session_id = %record.id,
                    source = %record.source_name,
                    parts = record.final_artifacts.len(),
                    "Session completed"
                );
                self.archive(&active);
            }
        }
    }

    /// Supervise capture until it ends. Transient failures respawn into a
    /// new part under the capture retry policy. Returns the error that ended
    /// capture, if it did not end by request or by a clean exit.
    async fn capture(
        &self,
        active: &ActiveSession,
        handle: ProcessHandle,
        source: &StreamerSource,
    ) -> Option<Error> {
        let first = Mutex::new(Some(handle));
        let outcome = self
            .config
            .capture
            .retry
            .run(&active.stop, |attempt| {
                let launched = first.lock().take();
                async move {
                    let handle = match launched {
                        Some(handle) => handle,
                        None => self.respawn(active, source).await?,
                    };
                    let result = self.await_capture(active, handle).await;
                    if let Err(e) = &result {
                        warn!(source = %source.display_name, attempt, error = %e, "Capture attempt failed");
                    }
                    result
                }
            })
            .await;

        match outcome {
            Ok(()) => None,
            Err(Error::Cancelled) if active.stop.is_cancelled() => None,
            Err(e) => Some(e),
        }
    }

    /// Wait for one capture process and classify how it ended. Transient
    /// failures count against the proxy that carried them.
    async fn await_capture(&self, active: &ActiveSession, handle: ProcessHandle) -> Result<()> {
        let egress = active.record.read().egress.clone();
        let proxy = egress.as_ref().and_then(Egress::proxy_url);
        let exit = self.supervisor.await_exit(handle, &active.stop, None).await?;

        if active.stop.is_cancelled() || exit.success() {
            if let Some(url) = proxy {
                self.registry.report_outcome(url, true, None);
            }
            return Ok(());
        }

        let error = self
            .classifier
            .classify(&exit.output_tail())
            .into_capture_error();
        if let (Error::TransientCapture(_), Some(url)) = (&error, proxy) {
            self.registry.report_outcome(url, false, None);
        }
        Err(error)
    }

    /// Start the next capture part on a freshly selected egress.
    async fn respawn(&self, active: &ActiveSession, source: &StreamerSource) -> Result<ProcessHandle> {
        let egress = self.registry.select_best()?;
        let (raw, record) = {
            let record = active.record.read();
            (self.next_raw_path(&record), record.clone())
        };
        let log = self.open_log(&record, Stage::Capture).await;
        let spec = self.capture_command(source, &egress, &raw);
        let handle = self.supervisor.spawn(&spec, log).await?;

        info!(
            source = %source.display_name,
            raw = %raw.display(),
            proxy = ?egress.proxy_url(),
            "Capture respawned"
        );
        let mut record = active.record.write();
        record.egress = Some(egress);
        record.raw_artifacts.push(raw);
        record.capture_attempts += 1;
        Ok(handle)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::{ProcessExit, ProcessRunner, SupervisorConfig, Termination};
    use crate::proxy::{MockProxyProber, ProxyPoolConfig};
    use crate::remux::{MediaProber, RemuxSettings};
    use async_trait::async_trait;
    use proptest::prelude::*;

    /// Stands in for ffmpeg: copies the `-i` input to the last argument.
    struct CopyRunner;

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
                .unwrap();
            let target = args.last().unwrap();
            tokio::fs::copy(input, target).await.unwrap();
            Ok(ProcessExit {
                code: Some(0),
                termination: Termination::Exited,
                stdout_tail: Vec::new(),
                stderr_tail: Vec::new(),
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

    /// Capture stand-in run through `/bin/sh <script>`: the source URL is the
    /// script path, so nothing needs to be executable.
    const RECORDING_SCRIPT: &str = r#"
out=""
for a in "$@"; do case "$a" in --output=*) out="${a#--output=}";; esac; done
trap 'exit 0' TERM
echo data > "$out"
while true; do sleep 0.05; done
"#;

    const AUTH_SCRIPT: &str = r#"
echo "error: Unable to open URL: 401 Client Error: Unauthorized for url" >&2
exit 1
"#;

    const GAP_SCRIPT: &str = r#"
echo "[stream] segment gap after 00:00:03" >&2
exit 1
"#;

    struct Harness {
        dir: tempfile::TempDir,
        manager: RecordingLifecycleManager,
        supervisor: Arc<ProcessSupervisor>,
    }

    fn harness(proxy: ProxyPoolConfig, max_sessions: Option<usize>) -> Harness {
        let capture = CaptureSettings {
            retry: RetryPolicy::no_retry(),
            ..CaptureSettings::default()
        };
        harness_with(capture, proxy, max_sessions)
    }

    fn harness_with(
        capture: CaptureSettings,
        proxy: ProxyPoolConfig,
        max_sessions: Option<usize>,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ProxyHealthRegistry::new(
            &proxy,
            Arc::new(MockProxyProber::new()),
        ));
        let supervisor = Arc::new(ProcessSupervisor::new(SupervisorConfig {
            graceful_stop_secs: 2,
            tail_lines: 16,
        }));
        let remux = Arc::new(RemuxPipeline::new(
            RemuxSettings::default(),
            "ffmpeg",
            Arc::new(CopyRunner),
            Arc::new(UnknownDuration),
        ));
        let config = RecordingConfig {
            output_dir: dir.path().join("out"),
            log_dir: dir.path().join("logs"),
            capture_program: "/bin/sh".to_string(),
            capture,
            max_concurrent_sessions: max_sessions,
        };
        let manager =
            RecordingLifecycleManager::new(config, registry, supervisor.clone(), remux);
        Harness {
            dir,
            manager,
            supervisor,
        }
    }

    fn direct_only() -> ProxyPoolConfig {
        ProxyPoolConfig::default()
    }

    impl Harness {
        fn add_source(&self, id: &str, script: &str) {
            let path = self.dir.path().join(format!("{id}.sh"));
            std::fs::write(&path, script).unwrap();
            self.manager.upsert_source(StreamerSource::new(
                id,
                format!("Streamer {id}"),
                path.to_string_lossy(),
            ));
        }

        async fn wait_terminal(&self, id: &str) -> RecordingSession {
            for _ in 0..200 {
                if self.manager.session(id).is_none() {
                    if let Some(done) = self
                        .manager
                        .history()
                        .into_iter()
                        .rev()
                        .find(|s| s.source_id == id)
                    {
                        return done;
                    }
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            panic!("session for {id} did not finish");
        }
    }

    #[tokio::test]
    async fn test_start_unknown_source_is_not_found() {
        let h = harness(direct_only(), None);
        let err = h.manager.start_recording("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(h.supervisor.spawned_total(), 0);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_and_stop_completes() {
        let h = harness(direct_only(), None);
        h.add_source("a", RECORDING_SCRIPT);

        let session_id = h.manager.start_recording("a").await.unwrap();
        assert_eq!(h.manager.state_of("a"), SessionState::Capturing);

        let err = h.manager.start_recording("a").await.unwrap_err();
        assert!(matches!(err, Error::AlreadyRecording(_)));
        assert_eq!(h.manager.on_liveness("a", LivenessSignal::Online).await.unwrap(), None);
        assert_eq!(h.supervisor.spawned_total(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.manager.stop_recording("a"), StopOutcome::Stopping);
        let again = h.manager.stop_recording("a");
        assert!(matches!(
            again,
            StopOutcome::AlreadyStopping | StopOutcome::NotRecording
        ));

        let done = h.wait_terminal("a").await;
        assert_eq!(done.id, session_id);
        assert_eq!(done.state, SessionState::Completed);
        assert_eq!(done.final_artifacts.len(), 1);
        assert!(done.final_artifacts[0].exists());
        assert!(done.raw_artifacts[0].exists());
        assert_eq!(h.manager.state_of("a"), SessionState::Idle);
        assert_eq!(h.manager.stop_recording("a"), StopOutcome::NotRecording);
    }

    #[tokio::test]
    async fn test_egress_unavailable_never_spawns() {
        let h = harness(
            ProxyPoolConfig {
                fallback_to_direct: false,
                ..ProxyPoolConfig::default()
            },
            None,
        );
        h.add_source("a", RECORDING_SCRIPT);

        let err = h.manager.start_recording("a").await.unwrap_err();
        assert!(matches!(err, Error::EgressUnavailable));
        assert_eq!(h.supervisor.spawned_total(), 0);
        assert_eq!(h.manager.state_of("a"), SessionState::Idle);

        let history = h.manager.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, SessionState::Failed);
        assert_eq!(history[0].failure_reason, Some(FailureReason::EgressUnavailable));
    }

    #[tokio::test]
    async fn test_auth_rejection_is_reported_verbatim_without_retry() {
        let h = harness(direct_only(), None);
        h.add_source("a", AUTH_SCRIPT);

        h.manager.start_recording("a").await.unwrap();
        let done = h.wait_terminal("a").await;

        assert_eq!(done.state, SessionState::Failed);
        assert_eq!(
            done.failure_reason,
            Some(FailureReason::AuthenticationRejected)
        );
        assert!(
            done.error_message
                .as_deref()
                .unwrap()
                .contains("401 Client Error: Unauthorized for url")
        );
        assert_eq!(done.capture_attempts, 1);
        assert_eq!(h.supervisor.spawned_total(), 1);
    }

    #[tokio::test]
    async fn test_configured_transient_pattern_respawns_into_parts() {
        let retry = RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 10,
            use_jitter: false,
            ..RetryPolicy::default()
        };
        let with_pattern = CaptureSettings {
            retry: retry.clone(),
            failure_patterns: vec![FailurePattern {
                pattern: "(?i)segment gap".to_string(),
                class: FailureClass::Transient,
            }],
            ..CaptureSettings::default()
        };
        let h = harness_with(with_pattern, direct_only(), None);
        h.add_source("a", GAP_SCRIPT);

        h.manager.start_recording("a").await.unwrap();
        let done = h.wait_terminal("a").await;

        assert_eq!(done.state, SessionState::Failed);
        assert_eq!(done.failure_reason, Some(FailureReason::TransientCaptureError));
        assert_eq!(done.capture_attempts, 3);
        assert_eq!(done.raw_artifacts.len(), 3);
        assert_eq!(h.supervisor.spawned_total(), 3);

        let without_pattern = CaptureSettings {
            retry,
            ..CaptureSettings::default()
        };
        let h = harness_with(without_pattern, direct_only(), None);
        h.add_source("a", GAP_SCRIPT);

        h.manager.start_recording("a").await.unwrap();
        let done = h.wait_terminal("a").await;

        assert_eq!(done.failure_reason, Some(FailureReason::CaptureFailed));
        assert_eq!(done.capture_attempts, 1);
    }

    #[tokio::test]
    async fn test_capacity_limit_rejects_extra_sessions() {
        let h = harness(direct_only(), Some(1));
        h.add_source("a", RECORDING_SCRIPT);
        h.add_source("b", RECORDING_SCRIPT);

        h.manager.start_recording("a").await.unwrap();
        let err = h.manager.start_recording("b").await.unwrap_err();
        assert!(matches!(err, Error::CapacityExhausted(1)));
        assert_eq!(h.manager.state_of("b"), SessionState::Idle);

        assert!(h.manager.shutdown(Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn test_status_reflects_active_sessions() {
        let h = harness(direct_only(), None);
        h.add_source("b", RECORDING_SCRIPT);
        h.add_source("a", RECORDING_SCRIPT);

        assert!(h.manager.status().safe_to_update);
        h.manager.start_recording("b").await.unwrap();
        h.manager.start_recording("a").await.unwrap();

        let status = h.manager.status();
        assert!(status.is_recording);
        assert!(!status.safe_to_update);
        assert_eq!(status.active_count, 2);
        assert_eq!(status.active_streamers, vec!["Streamer a", "Streamer b"]);

        assert!(h.manager.shutdown(Duration::from_secs(10)).await);
        assert_eq!(h.manager.status().active_count, 0);
    }

    #[tokio::test]
    async fn test_owned_artifacts_are_reported() {
        let h = harness(direct_only(), None);
        h.add_source("a", RECORDING_SCRIPT);
        h.manager.start_recording("a").await.unwrap();

        let raw = h.manager.session("a").unwrap().raw_artifacts[0].clone();
        assert!(h.manager.is_owned(&raw));
        assert!(!h.manager.is_owned(&h.dir.path().join("other.ts")));

        assert!(h.manager.shutdown(Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn test_events_follow_the_lifecycle() {
        let h = harness(direct_only(), None);
        h.add_source("a", RECORDING_SCRIPT);
        let mut events = h.manager.subscribe();

        h.manager.start_recording("a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        h.manager.stop_recording("a");
        h.wait_terminal("a").await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push((event.from, event.to));
        }
        assert_eq!(
            seen,
            vec![
                (SessionState::Idle, SessionState::Starting),
                (SessionState::Starting, SessionState::Capturing),
                (SessionState::Capturing, SessionState::Stopping),
                (SessionState::Stopping, SessionState::PostProcessing),
                (SessionState::PostProcessing, SessionState::Completed),
            ]
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// However many starts race for one source, exactly one wins.
        #[test]
        fn prop_concurrent_starts_admit_one_session(racers in 2usize..8) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();

            let (won, rejected, spawned) = rt.block_on(async {
                let h = harness(direct_only(), None);
                h.add_source("a", RECORDING_SCRIPT);

                let mut joins = Vec::new();
                for _ in 0..racers {
                    let manager = h.manager.clone();
                    joins.push(tokio::spawn(async move {
                        manager.start_recording("a").await
                    }));
                }

                let mut won = 0;
                let mut rejected = 0;
                for join in joins {
                    match join.await.unwrap() {
                        Ok(_) => won += 1,
                        Err(Error::AlreadyRecording(_)) => rejected += 1,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
                let spawned = h.supervisor.spawned_total();
                h.manager.shutdown(Duration::from_secs(10)).await;
                (won, rejected, spawned)
            });

            prop_assert_eq!(won, 1);
            prop_assert_eq!(rejected, racers - 1);
            prop_assert_eq!(spawned, 1);
        }
    }
}
