//! Remux work items.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::strategy::RemuxStrategy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ArtifactStatus {
    Pending,
    Completed,
    Failed { reason: String },
}

/// One raw artifact waiting for (or done with) remux.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostProcessArtifact {
    pub raw_path: PathBuf,
    pub target_path: PathBuf,
    /// Strategy that produced the output, or the last one tried.
    pub strategy: Option<RemuxStrategy>,
    pub attempts: u32,
    pub status: ArtifactStatus,
}

impl PostProcessArtifact {
    pub fn new(raw_path: impl Into<PathBuf>, target_path: impl Into<PathBuf>) -> Self {
        Self {
            raw_path: raw_path.into(),
            target_path: target_path.into(),
            strategy: None,
            attempts: 0,
            status: ArtifactStatus::Pending,
        }
    }
}
