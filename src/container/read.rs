//! Random-access reading of a persisted container.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek};
use std::path::{Path, PathBuf};

use zip::ZipArchive;
use zip::result::ZipError;

use crate::canonical::CoveredContent;
use crate::model::{Environment, Manifest, SPEC_VERSION, Step};

use super::{
    ARTIFACTS_PREFIX, ContainerError, ENVIRONMENT_ENTRY, MANIFEST_ENTRY, MIMETYPE,
    MIMETYPE_ENTRY, Result, STEPS_ENTRY, VIEWER_ENTRY,
};

/// An opened `.epi` archive.
///
/// Opening reads only `mimetype` and `manifest.json`; every other entry
/// is read on demand.
pub struct Container {
    path: PathBuf,
    archive: ZipArchive<BufReader<File>>,
    manifest: Manifest,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("path", &self.path)
            .field("manifest", &self.manifest)
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Opens a container and parses its manifest.
    ///
    /// Fails with [`ContainerError::Corrupt`] when the file is not a ZIP
    /// archive or `mimetype`/`manifest.json` is missing or malformed, and
    /// with [`ContainerError::FormatMismatch`] when the manifest declares
    /// an unsupported spec version.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mut archive = ZipArchive::new(BufReader::new(file)).map_err(structure_error)?;

        let mimetype = read_required(&mut archive, MIMETYPE_ENTRY)?;
        if mimetype != MIMETYPE.as_bytes() {
            return Err(ContainerError::Corrupt(format!(
                "unexpected mimetype {:?}",
                String::from_utf8_lossy(&mimetype)
            )));
        }

        let manifest_bytes = read_required(&mut archive, MANIFEST_ENTRY)?;
        let manifest = parse_manifest(&manifest_bytes)?;

        Ok(Self {
            path,
            archive,
            manifest,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Consumes the handle, returning the manifest.
    pub fn into_manifest(self) -> Manifest {
        self.manifest
    }

    /// Names of all entries in archive order.
    pub fn entry_names(&self) -> Vec<String> {
        self.archive.file_names().map(String::from).collect()
    }

    pub fn has_entry(&self, name: &str) -> bool {
        self.archive.index_for_name(name).is_some()
    }

    /// Reads an entry's raw bytes, or `None` if the archive lacks it.
    pub fn read_entry(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        read_optional(&mut self.archive, name)
    }

    /// Parses `steps.jsonl`.
    ///
    /// Rejects blank lines and any break in the `0..N` index sequence.
    pub fn steps(&mut self) -> Result<Vec<Step>> {
        let bytes = read_required(&mut self.archive, STEPS_ENTRY)?;
        parse_steps(&bytes)
    }

    /// Parses `environment.json`.
    pub fn environment(&mut self) -> Result<Environment> {
        let bytes = read_required(&mut self.archive, ENVIRONMENT_ENTRY)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ContainerError::Corrupt(format!("{ENVIRONMENT_ENTRY}: {e}")))
    }

    /// Artifact names, relative to `artifacts/`, sorted.
    pub fn artifact_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .archive
            .file_names()
            .filter_map(|name| name.strip_prefix(ARTIFACTS_PREFIX))
            .filter(|name| !name.is_empty() && !name.ends_with('/'))
            .map(String::from)
            .collect();
        names.sort();
        names
    }

    pub fn artifact(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        self.read_entry(&format!("{ARTIFACTS_PREFIX}{name}"))
    }

    /// The embedded viewer page, if any.
    pub fn viewer(&mut self) -> Result<Option<String>> {
        self.read_entry(VIEWER_ENTRY)?
            .map(|bytes| {
                String::from_utf8(bytes)
                    .map_err(|e| ContainerError::Corrupt(format!("{VIEWER_ENTRY}: {e}")))
            })
            .transpose()
    }

    /// Raw bytes of every digest-covered entry, as persisted.
    pub fn covered_content(&mut self) -> Result<CoveredContent> {
        let steps = read_required(&mut self.archive, STEPS_ENTRY)?;
        let environment = read_required(&mut self.archive, ENVIRONMENT_ENTRY)?;
        let mut artifacts = Vec::new();
        for name in self.artifact_names() {
            let bytes = read_required(&mut self.archive, &format!("{ARTIFACTS_PREFIX}{name}"))?;
            artifacts.push((name, bytes));
        }
        Ok(CoveredContent::from_raw(steps, environment, artifacts))
    }

    /// Re-opens the archive after it was replaced on disk.
    pub(crate) fn reload(&mut self) -> Result<()> {
        *self = Self::open(&self.path)?;
        Ok(())
    }
}

fn parse_manifest(bytes: &[u8]) -> Result<Manifest> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| ContainerError::Corrupt(format!("{MANIFEST_ENTRY}: {e}")))?;
    let version = value
        .get("spec_version")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ContainerError::Corrupt(format!("{MANIFEST_ENTRY}: no spec_version")))?;
    if version != SPEC_VERSION {
        return Err(ContainerError::FormatMismatch {
            found: version.to_string(),
            expected: SPEC_VERSION,
        });
    }
    serde_json::from_value(value)
        .map_err(|e| ContainerError::Corrupt(format!("{MANIFEST_ENTRY}: {e}")))
}

fn parse_steps(bytes: &[u8]) -> Result<Vec<Step>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| ContainerError::Corrupt(format!("{STEPS_ENTRY}: {e}")))?;
    let mut steps: Vec<Step> = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line_no = line_no + 1;
        if line.is_empty() {
            return Err(ContainerError::Corrupt(format!(
                "{STEPS_ENTRY}: blank line {line_no}"
            )));
        }
        let step: Step = serde_json::from_str(line)
            .map_err(|e| ContainerError::Corrupt(format!("{STEPS_ENTRY}:{line_no}: {e}")))?;
        if step.index != steps.len() as u64 {
            return Err(ContainerError::Corrupt(format!(
                "{STEPS_ENTRY}:{line_no}: expected index {}, found {}",
                steps.len(),
                step.index
            )));
        }
        steps.push(step);
    }
    Ok(steps)
}

fn read_required<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Vec<u8>> {
    read_optional(archive, name)?
        .ok_or_else(|| ContainerError::Corrupt(format!("missing entry {name}")))
}

fn read_optional<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<Vec<u8>>> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(structure_error(e)),
    };
    let mut bytes = Vec::new();
    // The file is already open, so a failed read here is a damaged entry
    // (bad deflate stream or checksum), not an I/O problem.
    entry
        .read_to_end(&mut bytes)
        .map_err(|e| ContainerError::Corrupt(format!("{name}: {e}")))?;
    Ok(Some(bytes))
}

/// Maps errors from parsing the archive structure.
///
/// Running out of bytes or reading garbage where a header should be means
/// the archive is damaged; any other I/O error stays [`ContainerError::Io`].
fn structure_error(err: ZipError) -> ContainerError {
    match err {
        ZipError::Io(e)
            if matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::InvalidData
                    | io::ErrorKind::InvalidInput
            ) =>
        {
            ContainerError::Corrupt(e.to_string())
        }
        other => other.into(),
    }
}
