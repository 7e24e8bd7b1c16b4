//! Spawning, monitoring and terminating external processes.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use process_utils::{TerminateRequest, request_terminate, tokio_command};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::command::CommandSpec;
use super::output::{RecordReader, TailBuffer};
use crate::error::{Error, Result};
use crate::logging::{LogStream, StageLog};

/// How long to wait for output drains after the process exited. A
/// grandchild holding the pipe open must not stall the session.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Time between the terminate request and the forced kill.
    #[serde(default = "default_graceful_stop_secs")]
    pub graceful_stop_secs: u64,
    /// Lines of stdout/stderr kept for classification.
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
}

fn default_graceful_stop_secs() -> u64 {
    10
}

fn default_tail_lines() -> usize {
    64
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            graceful_stop_secs: default_graceful_stop_secs(),
            tail_lines: default_tail_lines(),
        }
    }
}

/// How a supervised process came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Exited on its own.
    Exited,
    /// Stopped on request within the graceful window.
    Terminated,
    /// Forcibly killed after the graceful window elapsed.
    Killed,
    /// Hit the caller-supplied timeout and was stopped.
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub termination: Termination,
    pub stdout_tail: Vec<String>,
    pub stderr_tail: Vec<String>,
    pub elapsed: Duration,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.termination == Termination::Exited && self.code == Some(0)
    }

    /// Whether the process ended because we asked it to.
    pub fn was_stopped(&self) -> bool {
        matches!(self.termination, Termination::Terminated | Termination::Killed)
    }

    /// stdout and stderr tails combined, stderr last.
    pub fn output_tail(&self) -> Vec<&str> {
        self.stdout_tail
            .iter()
            .chain(self.stderr_tail.iter())
            .map(String::as_str)
            .collect()
    }
}

struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A spawned process. Must be handed back to
/// [`ProcessSupervisor::await_exit`]; dropping it kills the process.
pub struct ProcessHandle {
    child: Child,
    program: String,
    pid: Option<u32>,
    started: Instant,
    drains: Vec<JoinHandle<()>>,
    stdout_tail: Arc<Mutex<TailBuffer>>,
    stderr_tail: Arc<Mutex<TailBuffer>>,
    log: StageLog,
    _running: RunningGuard,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .finish()
    }
}

/// Owns the spawn/wait/terminate cycle of external tools.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    spawned_total: AtomicU64,
    running: Arc<AtomicUsize>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            spawned_total: AtomicU64::new(0),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn spawned_total(&self) -> u64 {
        self.spawned_total.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    fn graceful_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.config.graceful_stop_secs)
    }

    /// Start `spec`. Every stdout/stderr line is written to `log` as it
    /// arrives.
    pub async fn spawn(&self, spec: &CommandSpec, log: StageLog) -> Result<ProcessHandle> {
        log.note(&format!("$ {}", spec.display_line())).await;

        let mut cmd = tokio_command(spec.program());
        cmd.args(spec.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| Error::ProcessSpawn {
            program: spec.program().to_string(),
            source,
        })?;

        self.spawned_total.fetch_add(1, Ordering::SeqCst);
        self.running.fetch_add(1, Ordering::SeqCst);
        let running = RunningGuard(self.running.clone());

        let pid = child.id();
        let tail_lines = self.config.tail_lines;
        let stdout_tail = Arc::new(Mutex::new(TailBuffer::new(tail_lines)));
        let stderr_tail = Arc::new(Mutex::new(TailBuffer::new(tail_lines)));

        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            drains.push(spawn_drain(
                stdout,
                LogStream::Stdout,
                stdout_tail.clone(),
                log.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(spawn_drain(
                stderr,
                LogStream::Stderr,
                stderr_tail.clone(),
                log.clone(),
            ));
        }

        info!(program = %spec.program(), pid = ?pid, "Spawned process");

        Ok(ProcessHandle {
            child,
            program: spec.program().to_string(),
            pid,
            started: Instant::now(),
            drains,
            stdout_tail,
            stderr_tail,
            log,
            _running: running,
        })
    }

    /// Wait for the process to end.
    ///
    /// Cancelling `cancel` or exceeding `timeout` asks the process to
    /// terminate, waits up to the graceful window and then kills it. Output is
    /// fully drained into the stage log before this returns.
    pub async fn await_exit(
        &self,
        handle: ProcessHandle,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<ProcessExit> {
        let ProcessHandle {
            mut child,
            program,
            pid,
            started,
            drains,
            stdout_tail,
            stderr_tail,
            log,
            _running,
        } = handle;

        let deadline = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        let (code, termination) = tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| Error::Other(format!("waiting for {program}: {e}")))?;
                (status.code(), Termination::Exited)
            }
            _ = cancel.cancelled() => {
                debug!(program = %program, pid = ?pid, "Stop requested");
                self.stop_child(&mut child, &program).await
            }
            _ = deadline => {
                warn!(program = %program, pid = ?pid, "Process exceeded its time limit");
                let (code, _) = self.stop_child(&mut child, &program).await;
                (code, Termination::TimedOut)
            }
        };

        for mut drain in drains {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut drain).await.is_err() {
                warn!(program = %program, "Output drain did not finish, abandoning");
                drain.abort();
            }
        }

        let exit = ProcessExit {
            code,
            termination,
            stdout_tail: stdout_tail.lock().snapshot(),
            stderr_tail: stderr_tail.lock().snapshot(),
            elapsed: started.elapsed(),
        };

        log.note(&format!(
            "exit: code={:?} termination={:?} elapsed={:.1}s",
            exit.code,
            exit.termination,
            exit.elapsed.as_secs_f64()
        ))
        .await;

        if exit.success() || exit.was_stopped() {
            info!(program = %program, code = ?exit.code, termination = ?exit.termination, "Process finished");
        } else {
            warn!(program = %program, code = ?exit.code, termination = ?exit.termination, "Process failed");
        }

        Ok(exit)
    }

    /// Terminate request, bounded wait, then kill.
    async fn stop_child(&self, child: &mut Child, program: &str) -> (Option<i32>, Termination) {
        match request_terminate(child.id()) {
            Ok(TerminateRequest::Signalled) | Ok(TerminateRequest::AlreadyExited) => {
                match tokio::time::timeout(self.graceful_stop_timeout(), child.wait()).await {
                    Ok(Ok(status)) => return (status.code(), Termination::Terminated),
                    Ok(Err(e)) => warn!(program = %program, error = %e, "Error waiting for process"),
                    Err(_) => warn!(
                        program = %program,
                        timeout_secs = self.config.graceful_stop_secs,
                        "Process ignored terminate request, killing"
                    ),
                }
            }
            Ok(TerminateRequest::Unsupported) => {}
            Err(e) => warn!(program = %program, error = %e, "Failed to send terminate request"),
        }

        if let Err(e) = child.kill().await {
            warn!(program = %program, error = %e, "Failed to kill process");
        }
        let code = child.wait().await.ok().and_then(|s| s.code());
        (code, Termination::Killed)
    }
}

fn spawn_drain<R>(
    reader: R,
    stream: LogStream,
    tail: Arc<Mutex<TailBuffer>>,
    log: StageLog,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = RecordReader::new(reader);
        loop {
            match reader.next_record().await {
                Ok(Some(line)) => {
                    if line.contains("[cli][error]") {
                        warn!(target: "srec_orchestrator::process::output", "{}", line);
                    } else {
                        debug!(target: "srec_orchestrator::process::output", "{}", line);
                    }
                    log.write(stream, &line).await;
                    tail.lock().push(line);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Output stream closed with error");
                    break;
                }
            }
        }
    })
}

/// Runs a command to completion. Lets the remux pipeline be driven by a fake
/// in tests.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        spec: &CommandSpec,
        log: &StageLog,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<ProcessExit>;
}

#[async_trait]
impl ProcessRunner for ProcessSupervisor {
    async fn run(
        &self,
        spec: &CommandSpec,
        log: &StageLog,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<ProcessExit> {
        let handle = self.spawn(spec, log.clone()).await?;
        self.await_exit(handle, cancel, timeout).await
    }
}
