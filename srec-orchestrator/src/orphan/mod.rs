//! Recovery of raw artifacts left without a finished counterpart.

pub mod service;

pub use service::{
    ArtifactOwnership, CandidateOutcome, CandidateResult, OrphanCandidate, OrphanConfig,
    OrphanRecoveryService, RecoveryReport, FAILED_MARKER_SUFFIX,
};
