//! Media duration probing.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use process_utils::tokio_command;
use tracing::debug;

use crate::error::{Error, Result};
use crate::utils::fs;

const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Reports the playable duration of a media file.
#[async_trait]
pub trait MediaProber: Send + Sync {
    /// Duration in seconds, or `None` when the container does not report one.
    async fn duration(&self, path: &Path) -> Result<Option<f64>>;
}

pub struct FfprobeProber {
    ffprobe: String,
}

impl FfprobeProber {
    pub fn new(ffprobe: impl Into<String>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
        }
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    /// A directory artifact lasts as long as its segments together. Any
    /// segment without a duration makes the total unknown.
    async fn duration(&self, path: &Path) -> Result<Option<f64>> {
        if !path.is_dir() {
            return self.file_duration(path).await;
        }

        let mut segments = Vec::new();
        let listing = |e: std::io::Error| fs::io_error("listing raw artifact", path, e);
        let mut entries = tokio::fs::read_dir(path).await.map_err(listing)?;
        while let Some(entry) = entries.next_entry().await.map_err(listing)? {
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                segments.push(entry.path());
            }
        }
        if segments.is_empty() {
            return Ok(None);
        }
        segments.sort();

        let mut total = 0.0;
        for segment in &segments {
            match self.file_duration(segment).await? {
                Some(d) => total += d,
                None => return Ok(None),
            }
        }
        Ok(Some(total))
    }
}

impl FfprobeProber {
    async fn file_duration(&self, path: &Path) -> Result<Option<f64>> {
        let mut cmd = tokio_command(&self.ffprobe);
        cmd.args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        let output = tokio::time::timeout(PROBE_TIMEOUT, cmd.output())
            .await
            .map_err(|_| Error::Other(format!("ffprobe timed out on {}", path.display())))?
            .map_err(|source| Error::ProcessSpawn {
                program: self.ffprobe.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(path = %path.display(), stderr = %stderr.trim(), "ffprobe failed");
            return Err(Error::ContainerRepair(format!(
                "cannot read duration of {}: {}",
                path.display(),
                stderr.trim()
            )));
        }

        Ok(parse_duration(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse ffprobe's bare `format=duration` output.
fn parse_duration(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("12.480000\n"), Some(12.48));
        assert_eq!(parse_duration("N/A\n"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[tokio::test]
    async fn test_empty_directory_has_no_duration() {
        let dir = tempfile::tempdir().unwrap();
        let prober = FfprobeProber::new("ffprobe");
        assert_eq!(prober.duration(dir.path()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_directory_duration_reads_each_segment() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("00001.ts"), "a").unwrap();
        let prober = FfprobeProber::new("/nonexistent/ffprobe");
        assert!(matches!(
            prober.duration(dir.path()).await,
            Err(Error::ProcessSpawn { .. })
        ));
    }
}
