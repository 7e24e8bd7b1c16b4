//! Recordable sources.

use serde::{Deserialize, Serialize};

/// One recordable live-stream-producing entity.
///
/// `id` is the stable external identity. The policy fields (`quality`,
/// `codecs`, `credential`) are owned by the configuration collaborator and are
/// replaced wholesale when it pushes an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamerSource {
    pub id: String,
    pub display_name: String,
    /// Address handed to the capture tool.
    pub url: String,
    /// Quality selector, e.g. `"best"` or `"720p60,best"`.
    #[serde(default = "default_quality")]
    pub quality: String,
    /// Preferred codecs in order, e.g. `["h265", "h264"]`. Empty = tool default.
    #[serde(default)]
    pub codecs: Vec<String>,
    /// Opaque credential supplied by the auth collaborator.
    #[serde(default, skip_serializing)]
    pub credential: Option<String>,
}

fn default_quality() -> String {
    "best".to_string()
}

impl StreamerSource {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            url: url.into(),
            quality: default_quality(),
            codecs: Vec::new(),
            credential: None,
        }
    }

}

/// Signal from the external liveness detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessSignal {
    Online,
    Offline,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_defaults() {
        let json = r#"{"id":"1","display_name":"alice","url":"https://example.com/alice"}"#;
        let source: StreamerSource = serde_json::from_str(json).unwrap();
        assert_eq!(source.quality, "best");
        assert!(source.codecs.is_empty());
        assert!(source.credential.is_none());
    }

    #[test]
    fn test_credential_is_never_serialized() {
        let mut source = StreamerSource::new("1", "alice", "https://example.com/alice");
        source.credential = Some("secret-token".to_string());
        let json = serde_json::to_string(&source).unwrap();
        assert!(!json.contains("secret-token"));
    }
}
