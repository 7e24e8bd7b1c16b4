//! Application-wide error types.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
///
/// The first group of variants is the recording failure taxonomy; each maps to
/// a [`FailureReason`] that is recorded on the session and shown on the status
/// surface.
#[derive(Error, Debug)]
pub enum Error {
    #[error("No usable egress path (all proxies unhealthy and direct fallback disabled)")]
    EgressUnavailable,

    #[error("Authentication rejected: {0}")]
    AuthenticationRejected(String),

    #[error("Transient capture error: {0}")]
    TransientCapture(String),

    #[error("Container repair failure: {0}")]
    ContainerRepair(String),

    #[error("Filesystem conflict on {}: {message}", path.display())]
    FilesystemConflict { path: PathBuf, message: String },

    #[error("Source {0} is already recording")]
    AlreadyRecording(String),

    #[error("Concurrent session limit of {0} reached")]
    CapacityExhausted(usize),

    #[error("Fatal capture error: {0}")]
    FatalCapture(String),

    #[error("Failed to spawn {program}: {source}")]
    ProcessSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error while {op} {}: {source}", path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn fs_conflict(path: &Path, message: impl Into<String>) -> Self {
        Self::FilesystemConflict {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }

    /// The failure category recorded on a session terminated by this error.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            Self::EgressUnavailable => FailureReason::EgressUnavailable,
            Self::AuthenticationRejected(_) => FailureReason::AuthenticationRejected,
            Self::TransientCapture(_) => FailureReason::TransientCaptureError,
            Self::ContainerRepair(_) => FailureReason::RemuxFailed,
            Self::FilesystemConflict { .. } => FailureReason::FilesystemConflict,
            Self::FatalCapture(_) | Self::ProcessSpawn { .. } => FailureReason::CaptureFailed,
            Self::Cancelled => FailureReason::Cancelled,
            _ => FailureReason::Internal,
        }
    }
}

/// Why a session ended in `Failed`.
///
/// Operators use this to tell "wait and retry" situations apart from
/// "fix configuration" ones, so it is never collapsed into a generic error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    EgressUnavailable,
    AuthenticationRejected,
    TransientCaptureError,
    CaptureFailed,
    NoDataCaptured,
    RemuxFailed,
    FilesystemConflict,
    Cancelled,
    Internal,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EgressUnavailable => "EGRESS_UNAVAILABLE",
            Self::AuthenticationRejected => "AUTHENTICATION_REJECTED",
            Self::TransientCaptureError => "TRANSIENT_CAPTURE_ERROR",
            Self::CaptureFailed => "CAPTURE_FAILED",
            Self::NoDataCaptured => "NO_DATA_CAPTURED",
            Self::RemuxFailed => "REMUX_FAILED",
            Self::FilesystemConflict => "FILESYSTEM_CONFLICT",
            Self::Cancelled => "CANCELLED",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether the condition is expected to clear on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::EgressUnavailable
                | Self::TransientCaptureError
                | Self::RemuxFailed
                | Self::Cancelled
        )
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
