//! Per-source recording lifecycle.

pub mod manager;
pub mod session;

pub use manager::{
    CaptureSettings, FailurePattern, RecordingConfig, RecordingLifecycleManager, StopOutcome,
};
pub use session::{RecordingSession, SessionEvent, SessionState};
