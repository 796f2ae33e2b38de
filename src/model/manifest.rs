//! Manifest: the metadata document describing a container.

use std::collections::BTreeMap;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Container format version written into every manifest.
pub const SPEC_VERSION: &str = "1.1-json";

/// Caller-supplied session metadata, fixed when a session opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub workflow_id: Uuid,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    #[serde(default)]
    pub metadata_tags: Vec<String>,

    pub created_at: Timestamp,
}

impl SessionMetadata {
    /// Fresh metadata with a new workflow id, created now.
    pub fn new(workflow_name: Option<String>) -> Self {
        Self {
            workflow_id: Uuid::new_v4(),
            workflow_name,
            goal: None,
            notes: None,
            metadata_tags: Vec::new(),
            created_at: Timestamp::now(),
        }
    }
}

/// One per container, stored as `manifest.json`.
///
/// Only `content_digest` is covered by the signature. The descriptive
/// fields travel with it but are not part of what is signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub spec_version: String,

    pub workflow_id: Uuid,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    #[serde(default)]
    pub metadata_tags: Vec<String>,

    pub created_at: Timestamp,

    pub closed_at: Timestamp,

    pub step_count: u64,

    /// SHA-256 (hex) over every digest-covered entry.
    pub content_digest: String,

    /// SHA-256 (hex) of each digest-covered entry, by archive name.
    pub file_manifest: BTreeMap<String, String>,

    /// Set when the container was flushed from an interrupted session.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,

    /// `<algorithm>:<key_id>:<base64 signature>`, null until signed.
    pub signature: Option<String>,
}

impl Manifest {
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }
}
