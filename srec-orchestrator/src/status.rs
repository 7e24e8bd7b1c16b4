//! "Is it safe to update?" view over active recordings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::recording::RecordingLifecycleManager;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub is_recording: bool,
    pub active_count: usize,
    /// True only when nothing is capturing or post-processing.
    pub safe_to_update: bool,
    /// Display names of sources with a non-terminal session, sorted.
    pub active_streamers: Vec<String>,
    pub checked_at: DateTime<Utc>,
    pub message: String,
}

impl StatusSnapshot {
    pub fn from_active(mut names: Vec<String>) -> Self {
        names.sort();
        let active_count = names.len();
        let message = match active_count {
            0 => "No active recordings, safe to update".to_string(),
            1 => format!("1 active recording: {}", names[0]),
            n => format!("{n} active recordings: {}", names.join(", ")),
        };
        Self {
            is_recording: active_count > 0,
            active_count,
            safe_to_update: active_count == 0,
            active_streamers: names,
            checked_at: Utc::now(),
            message,
        }
    }
}

/// Something that can report recording status.
pub trait StatusSource: Send + Sync {
    fn status(&self) -> Result<StatusSnapshot>;
}

impl StatusSource for RecordingLifecycleManager {
    fn status(&self) -> Result<StatusSnapshot> {
        Ok(RecordingLifecycleManager::status(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_is_safe() {
        let s = StatusSnapshot::from_active(Vec::new());
        assert!(!s.is_recording);
        assert!(s.safe_to_update);
        assert_eq!(s.active_count, 0);
        assert!(s.active_streamers.is_empty());
    }

    #[test]
    fn test_two_sessions_sorted() {
        let s = StatusSnapshot::from_active(vec!["zed".to_string(), "amy".to_string()]);
        assert!(s.is_recording);
        assert!(!s.safe_to_update);
        assert_eq!(s.active_count, 2);
        assert_eq!(s.active_streamers, vec!["amy", "zed"]);
        assert_eq!(s.message, "2 active recordings: amy, zed");
    }

    #[test]
    fn test_serialized_field_names() {
        let json = serde_json::to_value(StatusSnapshot::from_active(vec!["a".into()])).unwrap();
        for key in [
            "is_recording",
            "active_count",
            "safe_to_update",
            "active_streamers",
            "checked_at",
            "message",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }
}
