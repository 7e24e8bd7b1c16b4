//! Recording sessions and their state machine.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::StreamerSource;
use crate::error::{Error, FailureReason, Result};
use crate::proxy::Egress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Capturing,
    Stopping,
    PostProcessing,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a new session may be started for the source.
    pub fn accepts_start(&self) -> bool {
        matches!(self, Self::Idle | Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Idle, Starting)
                | (Starting, Capturing)
                | (Starting, Stopping)
                | (Starting, Failed)
                | (Capturing, Stopping)
                | (Stopping, PostProcessing)
                | (Stopping, Failed)
                | (PostProcessing, Completed)
                | (PostProcessing, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Capturing => "capturing",
            Self::Stopping => "stopping",
            Self::PostProcessing => "post_processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt to capture one live occurrence of a source.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingSession {
    pub id: String,
    pub source_id: String,
    pub source_name: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub egress: Option<Egress>,
    /// One entry per capture part, in order.
    pub raw_artifacts: Vec<PathBuf>,
    pub final_artifacts: Vec<PathBuf>,
    pub failure_reason: Option<FailureReason>,
    /// Verbatim error text for the failure, or for a capture error that
    /// still produced usable data.
    pub error_message: Option<String>,
    pub capture_attempts: u32,
}

impl RecordingSession {
    /// A fresh session, already moved from `Idle` to `Starting`.
    pub fn new(source: &StreamerSource) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_id: source.id.clone(),
            source_name: source.display_name.clone(),
            state: SessionState::Starting,
            started_at: Utc::now(),
            ended_at: None,
            egress: None,
            raw_artifacts: Vec::new(),
            final_artifacts: Vec::new(),
            failure_reason: None,
            error_message: None,
            capture_attempts: 0,
        }
    }

    /// Move to `to`, returning the previous state.
    pub fn transition(&mut self, to: SessionState) -> Result<SessionState> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        let from = self.state;
        self.state = to;
        if to.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(from)
    }

    /// Terminate as `Failed` from any non-terminal state.
    pub fn fail(&mut self, reason: FailureReason, message: impl Into<String>) -> SessionState {
        let from = self.state;
        self.state = SessionState::Failed;
        self.ended_at = Some(Utc::now());
        self.failure_reason = Some(reason);
        self.error_message = Some(message.into());
        from
    }

    pub fn raw_artifact_path(&self) -> Option<&Path> {
        self.raw_artifacts.first().map(PathBuf::as_path)
    }

    pub fn final_artifact_path(&self) -> Option<&Path> {
        self.final_artifacts.first().map(PathBuf::as_path)
    }

    /// Whether `path` is one of this session's raw or final artifacts.
    pub fn owns(&self, path: &Path) -> bool {
        self.raw_artifacts
            .iter()
            .chain(self.final_artifacts.iter())
            .any(|p| p == path)
    }
}

/// A state transition, broadcast to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub session_id: String,
    pub source_id: String,
    pub source_name: String,
    pub from: SessionState,
    pub to: SessionState,
    pub at: DateTime<Utc>,
    pub failure_reason: Option<FailureReason>,
}

impl SessionEvent {
    pub fn new(session: &RecordingSession, from: SessionState) -> Self {
        Self {
            session_id: session.id.clone(),
            source_id: session.source_id.clone(),
            source_name: session.source_name.clone(),
            from,
            to: session.state,
            at: Utc::now(),
            failure_reason: session.failure_reason,
        }
    }
}
