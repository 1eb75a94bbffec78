//! Artifact metadata records.
//!
//! The engine never stores artifact bytes beyond small inline text payloads;
//! file artifacts are references owned by a storage collaborator.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::errors::ArtifactError;
use crate::utils::Timestamp;

/// What an artifact carries: an external reference or inline text.
///
/// Modelled as an enum so "exactly one of uri / data" holds by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "artifact_type", rename_all = "snake_case")]
pub enum ArtifactPayload {
    /// A reference to bytes held elsewhere (path, object URL, ...).
    File {
        /// Location of the artifact.
        uri: String,
    },
    /// A small inline text payload.
    Text {
        /// The payload.
        data: String,
    },
}

impl ArtifactPayload {
    /// Creates a file reference payload.
    #[must_use]
    pub fn file(uri: impl Into<String>) -> Self {
        Self::File { uri: uri.into() }
    }

    /// Creates an inline text payload.
    #[must_use]
    pub fn text(data: impl Into<String>) -> Self {
        Self::Text { data: data.into() }
    }

    /// Builds a payload from the optional column pair used by API payloads.
    ///
    /// # Errors
    ///
    /// Returns an error unless exactly one of `uri` and `data` is set.
    pub fn from_parts(
        name: &str,
        uri: Option<String>,
        data: Option<String>,
    ) -> Result<Self, ArtifactError> {
        match (uri, data) {
            (Some(uri), None) => Ok(Self::File { uri }),
            (None, Some(data)) => Ok(Self::Text { data }),
            (Some(_), Some(_)) => Err(ArtifactError::PayloadConflict {
                name: name.to_string(),
            }),
            (None, None) => Err(ArtifactError::PayloadMissing {
                name: name.to_string(),
            }),
        }
    }

    /// The external reference, if this is a file artifact.
    #[must_use]
    pub fn uri(&self) -> Option<&str> {
        match self {
            Self::File { uri } => Some(uri),
            Self::Text { .. } => None,
        }
    }

    /// The inline payload, if this is a text artifact.
    #[must_use]
    pub fn data(&self) -> Option<&str> {
        match self {
            Self::Text { data } => Some(data),
            Self::File { .. } => None,
        }
    }

    /// Returns "file" or "text".
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::File { .. } => "file",
            Self::Text { .. } => "text",
        }
    }
}

/// The naming and versioning key of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    /// The run the producing step belongs to.
    pub pipeline_run_id: Uuid,
    /// The producing step.
    pub step: String,
    /// The artifact name.
    pub name: String,
    /// Version, starting at 1, bumped on every re-production.
    pub version: u32,
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@v{}",
            self.pipeline_run_id, self.step, self.name, self.version
        )
    }
}

/// An immutable, versioned output of a step run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Unique id.
    pub id: Uuid,
    /// Naming/versioning key.
    pub key: ArtifactKey,
    /// The step run that produced it.
    pub producer_step_run_id: Uuid,
    /// Reference or inline data.
    pub payload: ArtifactPayload,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// When it was recorded.
    pub created_at: Timestamp,
}

impl Artifact {
    /// The artifact name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.key.name
    }

    /// The artifact version.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.key.version
    }
}

/// How a step run used an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageRole {
    /// The step run consumed the artifact.
    Input,
    /// The step run produced the artifact.
    Output,
}

impl fmt::Display for UsageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// Lineage link between a step run and an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactUsage {
    /// The step run.
    pub step_run_id: Uuid,
    /// The artifact.
    pub artifact_id: Uuid,
    /// Consumed or produced.
    pub role: UsageRole,
    /// When the link was recorded.
    pub recorded_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_from_parts() {
        assert_eq!(
            ArtifactPayload::from_parts("m", Some("s3://m".into()), None).unwrap(),
            ArtifactPayload::file("s3://m")
        );
        assert_eq!(
            ArtifactPayload::from_parts("m", None, Some("hi".into())).unwrap(),
            ArtifactPayload::text("hi")
        );
        assert!(matches!(
            ArtifactPayload::from_parts("m", Some("a".into()), Some("b".into())),
            Err(ArtifactError::PayloadConflict { .. })
        ));
        assert!(matches!(
            ArtifactPayload::from_parts("m", None, None),
            Err(ArtifactError::PayloadMissing { .. })
        ));
    }

    #[test]
    fn test_file_payload_never_exposes_data() {
        let payload = ArtifactPayload::file("/tmp/out.csv");
        assert_eq!(payload.uri(), Some("/tmp/out.csv"));
        assert_eq!(payload.data(), None);
        assert_eq!(payload.kind(), "file");
    }

    #[test]
    fn test_payload_serialization_shape() {
        let json = serde_json::to_value(ArtifactPayload::text("x")).unwrap();
        assert_eq!(json, serde_json::json!({"artifact_type": "text", "data": "x"}));
    }

    #[test]
    fn test_key_display() {
        let key = ArtifactKey {
            pipeline_run_id: Uuid::nil(),
            step: "train".into(),
            name: "model".into(),
            version: 2,
        };
        assert_eq!(
            key.to_string(),
            "00000000-0000-0000-0000-000000000000/train/model@v2"
        );
    }
}
