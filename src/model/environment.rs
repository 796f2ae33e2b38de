//! Environment snapshot: where a session ran.

use std::collections::BTreeMap;
use std::env;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// Runtime metadata captured when a session opens.
///
/// Hashed into the content digest, so every field here is part of what a
/// signature vouches for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    /// Operating system, as reported by `std::env::consts::OS`.
    pub os: String,

    /// CPU architecture, as reported by `std::env::consts::ARCH`.
    pub arch: String,

    /// OS family (`unix` or `windows`).
    pub family: String,

    /// Name of the recording library.
    pub recorder: String,

    /// Version of the recording library.
    pub recorder_version: String,

    pub captured_at: Timestamp,

    /// Caller-declared dependency versions (name → version).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
}

impl Environment {
    /// Captures the current process environment.
    pub fn capture() -> Self {
        Self {
            os: env::consts::OS.to_string(),
            arch: env::consts::ARCH.to_string(),
            family: env::consts::FAMILY.to_string(),
            recorder: env!("CARGO_PKG_NAME").to_string(),
            recorder_version: env!("CARGO_PKG_VERSION").to_string(),
            captured_at: Timestamp::now(),
            dependencies: BTreeMap::new(),
        }
    }

    /// Records a dependency version alongside the captured metadata.
    #[must_use]
    pub fn with_dependency(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.dependencies.insert(name.into(), version.into());
        self
    }
}
