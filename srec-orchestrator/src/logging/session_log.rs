//! Per-session, per-stage structured logs.
//!
//! Layout: `<log_dir>/<source>/<source>_<YYYYmmdd_HHMMSS>_<stage>.log`, one
//! JSON object per line. Every line is flushed as it is written, so a crash
//! mid-session leaves a partial but readable file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::Result;
use crate::utils::filename::{sanitize_filename, session_stem};
use crate::utils::fs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Capture,
    Remux,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::Remux => "remux",
        }
    }
}

/// Origin of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Lines written by the orchestrator itself (command line, exit summary).
    Orchestrator,
}

/// One line of a stage log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub ts: DateTime<Utc>,
    pub stream: LogStream,
    pub line: String,
}

struct Inner {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

/// Cheaply cloneable writer for one stage log. A disabled log drops
/// everything.
#[derive(Clone)]
pub struct StageLog {
    inner: Option<Arc<Inner>>,
}

impl std::fmt::Debug for StageLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageLog").field("path", &self.path()).finish()
    }
}

/// Deterministic path of a stage log.
pub fn stage_log_path(
    log_dir: &Path,
    source_name: &str,
    started_at: DateTime<Utc>,
    stage: Stage,
) -> PathBuf {
    log_dir.join(sanitize_filename(source_name)).join(format!(
        "{}_{}.log",
        session_stem(source_name, started_at),
        stage.as_str()
    ))
}

impl StageLog {
    /// Open (append) the stage log of a session, creating directories.
    pub async fn open(
        log_dir: &Path,
        source_name: &str,
        started_at: DateTime<Utc>,
        stage: Stage,
    ) -> Result<Self> {
        Self::open_file(stage_log_path(log_dir, source_name, started_at, stage)).await
    }

    /// Open (append) a log at an explicit path.
    pub async fn open_file(path: PathBuf) -> Result<Self> {
        fs::ensure_parent_dir_with_op("creating session log directory", &path).await?;

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| fs::io_error("opening session log", &path, e))?;

        Ok(Self {
            inner: Some(Arc::new(Inner {
                path,
                file: Mutex::new(file),
            })),
        })
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.as_ref().map(|i| i.path.as_path())
    }

    /// Append one line. Write failures are reported through `tracing` and
    /// never interrupt the supervised process.
    pub async fn write(&self, stream: LogStream, line: &str) {
        let Some(inner) = &self.inner else {
            return;
        };

        let record = LogRecord {
            ts: Utc::now(),
            stream,
            line: line.to_string(),
        };
        let mut buf = match serde_json::to_vec(&record) {
            Ok(buf) => buf,
            Err(e) => {
                warn!(error = %e, "Failed to encode session log record");
                return;
            }
        };
        buf.push(b'\n');

        let mut file = inner.file.lock().await;
        let result = async {
            file.write_all(&buf).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!(path = %inner.path.display(), error = %e, "Failed to write session log");
        }
    }

    pub async fn note(&self, line: &str) {
        self.write(LogStream::Orchestrator, line).await;
    }
}

/// Read a stage log back. Trailing partial lines are ignored.
pub async fn read_records(path: &Path) -> Result<Vec<LogRecord>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| fs::io_error("reading session log", path, e))?;
    Ok(content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_path_layout() {
        let started = Utc.with_ymd_and_hms(2024, 3, 9, 21, 5, 7).unwrap();
        let path = stage_log_path(Path::new("/logs"), "alice", started, Stage::Remux);
        assert_eq!(
            path,
            PathBuf::from("/logs/alice/alice_20240309_210507_remux.log")
        );
    }

    #[tokio::test]
    async fn test_lines_are_persisted_incrementally() {
        let dir = tempfile::tempdir().unwrap();
        let started = Utc::now();
        let log = StageLog::open(dir.path(), "bob", started, Stage::Capture)
            .await
            .unwrap();

        log.note("streamlink https://example.com best").await;
        log.write(LogStream::Stderr, "[cli][info] Opening stream").await;

        // Readable without closing the writer.
        let records = read_records(log.path().unwrap()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].stream, LogStream::Stderr);
        assert_eq!(records[1].line, "[cli][info] Opening stream");

        // Reopening appends.
        let again = StageLog::open(dir.path(), "bob", started, Stage::Capture)
            .await
            .unwrap();
        again.write(LogStream::Stdout, "more").await;
        assert_eq!(read_records(log.path().unwrap()).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_disabled_log_is_noop() {
        let log = StageLog::disabled();
        log.note("ignored").await;
        assert!(log.path().is_none());
    }
}
