//! Filename helpers for recording artifacts.
//!
//! Names are derived deterministically from the source display name and the
//! session start time so that raw artifacts, final artifacts and stage logs of
//! one session can always be matched up again (orphan recovery relies on it).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

/// Characters that are invalid in Windows filenames
const WINDOWS_INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Windows reserved filenames (case-insensitive)
const WINDOWS_RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Timestamp layout used in artifact and log names.
pub const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Marker inserted before the part number of a retried capture.
const PART_MARKER: &str = "_part";

/// Sanitize a string for use in filenames across all platforms.
///
/// Control characters and Windows-invalid characters become a single `_`,
/// leading/trailing spaces and dots are trimmed, reserved names get a `_`
/// prefix and an empty result becomes `"unnamed"`.
pub fn sanitize_filename(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut last_was_replacement = false;

    for c in input.chars() {
        if c.is_control() || WINDOWS_INVALID_CHARS.contains(&c) {
            if !last_was_replacement {
                result.push('_');
                last_was_replacement = true;
            }
        } else {
            result.push(c);
            last_was_replacement = false;
        }
    }

    let trimmed = result.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        return "unnamed".to_string();
    }

    let upper = trimmed.to_uppercase();
    for reserved in WINDOWS_RESERVED_NAMES {
        if upper == *reserved || upper.starts_with(&format!("{}.", reserved)) {
            return format!("_{}", trimmed);
        }
    }

    trimmed.to_string()
}

/// `<name>_<YYYYmmdd_HHMMSS>` for one session.
pub fn session_stem(source_name: &str, started_at: DateTime<Utc>) -> String {
    format!(
        "{}_{}",
        sanitize_filename(source_name),
        started_at.format(STAMP_FORMAT)
    )
}

/// Raw capture path for a given part. Part 0 carries no suffix.
pub fn raw_artifact_path(dir: &Path, stem: &str, part: u32, raw_ext: &str) -> PathBuf {
    if part == 0 {
        dir.join(format!("{stem}.{raw_ext}"))
    } else {
        dir.join(format!("{stem}{PART_MARKER}{part}.{raw_ext}"))
    }
}

/// The finished artifact that corresponds to a raw artifact: same directory,
/// same stem, final extension.
pub fn final_artifact_path(raw: &Path, final_ext: &str) -> PathBuf {
    let stem = raw
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    raw.with_file_name(format!("{stem}.{final_ext}"))
}
