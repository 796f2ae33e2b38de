//! The `.epi` archive: fixed layout, packaging, and random-access reading.
//!
//! ```text
//! mimetype            # "application/epi+zip", first entry, stored
//! manifest.json       # canonical JSON
//! steps.jsonl         # one canonical step per line, in index order
//! environment.json    # canonical JSON
//! artifacts/<name>    # optional, digest-covered
//! viewer.html         # optional, not digest-covered
//! ```
//!
//! Archives are written to a temporary file in the destination directory
//! and renamed into place, so a reader never observes a half-written file.

mod pack;
mod read;
mod viewer;

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path};

use zip::result::ZipError;

pub use pack::{Packager, pack};
pub use read::Container;

pub(crate) use pack::rewrite_manifest;

/// Literal content of the `mimetype` entry.
pub const MIMETYPE: &str = "application/epi+zip";

pub(crate) const MIMETYPE_ENTRY: &str = "mimetype";
pub(crate) const MANIFEST_ENTRY: &str = "manifest.json";
pub(crate) const STEPS_ENTRY: &str = "steps.jsonl";
pub(crate) const ENVIRONMENT_ENTRY: &str = "environment.json";
pub(crate) const ARTIFACTS_PREFIX: &str = "artifacts/";
pub(crate) const VIEWER_ENTRY: &str = "viewer.html";

/// Caller-attached files, keyed by name relative to `artifacts/`.
pub type Artifacts = BTreeMap<String, Vec<u8>>;

/// Errors that can occur while packaging or reading a container.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt archive: {0}")]
    Corrupt(String),

    #[error("unsupported spec version {found:?} (expected {expected:?})")]
    FormatMismatch {
        found: String,
        expected: &'static str,
    },

    #[error("content digest mismatch: manifest has {expected}, content hashes to {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("invalid artifact name: {0:?}")]
    InvalidArtifactName(String),
}

impl From<ZipError> for ContainerError {
    fn from(err: ZipError) -> Self {
        match err {
            ZipError::Io(e) => Self::Io(e),
            other => Self::Corrupt(other.to_string()),
        }
    }
}

pub type Result<T> = core::result::Result<T, ContainerError>;

/// Checks that an artifact name is a plain relative path that stays
/// inside `artifacts/`.
pub fn validate_artifact_name(name: &str) -> Result<()> {
    let invalid = || ContainerError::InvalidArtifactName(name.to_string());
    if name.is_empty() || name.contains('\\') || name.ends_with('/') {
        return Err(invalid());
    }
    for component in Path::new(name).components() {
        if !matches!(component, Component::Normal(_)) {
            return Err(invalid());
        }
    }
    Ok(())
}
