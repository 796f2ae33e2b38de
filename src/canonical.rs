//! Canonical JSON and the content digest.
//!
//! The canonical form is compact JSON with object keys sorted by their
//! UTF-8 bytes at every depth. It does not depend on how a map was built
//! or on serde_json's `preserve_order` feature being switched on somewhere
//! in the dependency graph.
//!
//! The content digest is one SHA-256 over the covered archive entries, each
//! framed as `name || 0x00 || u64_le(len) || bytes`:
//!
//! ```text
//! steps.jsonl
//! environment.json
//! artifacts/<name>    # every artifact, in name order
//! ```

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::container::{
    ARTIFACTS_PREFIX, Artifacts, ContainerError, ENVIRONMENT_ENTRY, STEPS_ENTRY,
    validate_artifact_name,
};
use crate::model::{Environment, Step};

/// Serializes any value to canonical JSON bytes.
pub fn to_canonical_bytes<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    let mut out = Vec::new();
    write_canonical(&value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) -> serde_json::Result<()> {
    match value {
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)?;
                out.push(b':');
                write_canonical(&map[key], out)?;
            }
            out.push(b'}');
        }
        scalar => serde_json::to_writer(&mut *out, scalar)?,
    }
    Ok(())
}

/// Encodes steps as `steps.jsonl`: one canonical object per line, each
/// line terminated by `\n`.
pub fn encode_steps(steps: &[Step]) -> serde_json::Result<Vec<u8>> {
    let mut out = Vec::new();
    for step in steps {
        out.extend(to_canonical_bytes(step)?);
        out.push(b'\n');
    }
    Ok(out)
}

/// The exact bytes of every digest-covered archive entry, in digest order.
///
/// The packager writes these bytes and the verifier reads them back, so
/// hashing always happens over what is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoveredContent {
    entries: Vec<(String, Vec<u8>)>,
}

impl CoveredContent {
    /// Encodes logical content into its persisted form.
    pub fn encode(
        steps: &[Step],
        environment: &Environment,
        artifacts: &Artifacts,
    ) -> Result<Self, ContainerError> {
        let steps = encode_steps(steps)?;
        let environment = to_canonical_bytes(environment)?;
        let artifacts = artifacts
            .iter()
            .map(|(name, bytes)| {
                validate_artifact_name(name)?;
                Ok((name.clone(), bytes.clone()))
            })
            .collect::<Result<Vec<_>, ContainerError>>()?;
        Ok(Self::from_raw(steps, environment, artifacts))
    }

    /// Wraps entry bytes read back from an archive.
    ///
    /// Artifact names are given without the `artifacts/` prefix.
    pub fn from_raw(
        steps: Vec<u8>,
        environment: Vec<u8>,
        artifacts: impl IntoIterator<Item = (String, Vec<u8>)>,
    ) -> Self {
        let mut entries = vec![
            (STEPS_ENTRY.to_string(), steps),
            (ENVIRONMENT_ENTRY.to_string(), environment),
        ];
        let sorted: BTreeMap<String, Vec<u8>> = artifacts.into_iter().collect();
        entries.extend(
            sorted
                .into_iter()
                .map(|(name, bytes)| (format!("{ARTIFACTS_PREFIX}{name}"), bytes)),
        );
        Self { entries }
    }

    /// Covered entries as `(archive name, bytes)`, in digest order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .map(|(name, bytes)| (name.as_str(), bytes.as_slice()))
    }

    /// Raw `steps.jsonl` bytes.
    pub fn steps(&self) -> &[u8] {
        &self.entries[0].1
    }

    /// Raw `environment.json` bytes.
    pub fn environment(&self) -> &[u8] {
        &self.entries[1].1
    }

    /// SHA-256 over all covered entries, as raw bytes.
    pub fn digest_bytes(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for (name, bytes) in self.entries() {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        }
        hasher.finalize().into()
    }

    /// SHA-256 over all covered entries, hex-encoded.
    pub fn digest(&self) -> String {
        hex::encode(self.digest_bytes())
    }

    /// Per-entry SHA-256 (hex), keyed by archive name.
    pub fn file_hashes(&self) -> BTreeMap<String, String> {
        self.entries()
            .map(|(name, bytes)| (name.to_string(), hex::encode(Sha256::digest(bytes))))
            .collect()
    }
}
