//! Failure classification for external tool output.
//!
//! A classifier is an ordered pattern table matched against the stderr/stdout
//! tail of a failed process. The first matching rule wins; output that matches
//! nothing is [`FailureClass::Unknown`]. Callers extend the table with
//! [`Classifier::with_rule`] when a tool version changes its wording.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network hiccup, timeout or reset. Retry is expected to help.
    Transient,
    /// Credential rejected by the remote. Never retried.
    AuthenticationRejected,
    /// Invalid invocation or unsupported source. Never retried.
    Fatal,
    /// Output path blocked by a stale file or missing permission.
    PermissionDenied,
    /// Bitstream the muxer refuses without a repair filter.
    MalformedBitstream,
    Unknown,
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: Regex,
    class: FailureClass,
}

/// A classified failure together with the output line that matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub class: FailureClass,
    /// The matching line, verbatim. For `Unknown`, the last non-empty line.
    pub evidence: Option<String>,
}

impl Classification {
    /// Convert into the error the lifecycle records for this class.
    pub fn into_capture_error(self) -> Error {
        let message = self
            .evidence
            .unwrap_or_else(|| "capture process exited with an error".to_string());
        match self.class {
            FailureClass::Transient => Error::TransientCapture(message),
            FailureClass::AuthenticationRejected => Error::AuthenticationRejected(message),
            _ => Error::FatalCapture(message),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Classifier {
    rules: Vec<Rule>,
}

const CAPTURE_RULES: &[(&str, FailureClass)] = &[
    (
        r"(?i)\b401\b|unauthori[sz]ed|authentication (failed|required)|invalid (oauth )?token|token (is )?(expired|invalid)",
        FailureClass::AuthenticationRejected,
    ),
    (
        r"(?i)no plugin can handle url|unrecognized arguments|unknown (option|argument)|invalid (quality|stream)",
        FailureClass::Fatal,
    ),
    (
        r"(?i)timed? ?out|connection (reset|refused|aborted)|temporary failure in name resolution|failed to reload playlist|error when reading from stream|unable to open url|proxyerror|max retries exceeded|\b50[234]\b",
        FailureClass::Transient,
    ),
];

const REMUX_RULES: &[(&str, FailureClass)] = &[
    (
        r"(?i)operation not permitted|permission denied|file exists|resource busy",
        FailureClass::PermissionDenied,
    ),
    (
        r"(?i)malformed (aac )?bitstream|aac_adtstoasc|invalid data found when processing input",
        FailureClass::MalformedBitstream,
    ),
];

impl Classifier {
    /// Rules for streamlink-compatible capture tools.
    pub fn capture() -> Self {
        Self::from_table(CAPTURE_RULES)
    }

    /// Rules for ffmpeg-compatible remux tools.
    pub fn remux() -> Self {
        Self::from_table(REMUX_RULES)
    }

    fn from_table(table: &[(&str, FailureClass)]) -> Self {
        let rules = table
            .iter()
            .filter_map(|(pattern, class)| {
                Regex::new(pattern).ok().map(|pattern| Rule {
                    pattern,
                    class: *class,
                })
            })
            .collect();
        Self { rules }
    }

    /// Append a rule. Appended rules are checked after the built-in ones.
    pub fn with_rule(mut self, pattern: &str, class: FailureClass) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::config(format!("invalid classifier pattern {pattern:?}: {e}")))?;
        self.rules.push(Rule { pattern, class });
        Ok(self)
    }

    /// Classify process output. Lines are scanned newest first so the final
    /// error wins over earlier recovered warnings.
    pub fn classify<S: AsRef<str>>(&self, lines: &[S]) -> Classification {
        for rule in &self.rules {
            if let Some(line) = lines
                .iter()
                .rev()
                .map(AsRef::as_ref)
                .find(|line| rule.pattern.is_match(line))
            {
                return Classification {
                    class: rule.class,
                    evidence: Some(line.to_string()),
                };
            }
        }

        Classification {
            class: FailureClass::Unknown,
            evidence: lines
                .iter()
                .rev()
                .map(AsRef::as_ref)
                .find(|line| !line.trim().is_empty())
                .map(str::to_string),
        }
    }
}
