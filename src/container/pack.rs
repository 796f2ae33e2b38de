//! Packager: assemble and atomically persist a container.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use zip::CompressionMethod;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::canonical::{CoveredContent, to_canonical_bytes};
use crate::model::{Environment, Manifest, SPEC_VERSION, Step};

use super::{
    Artifacts, Container, ContainerError, MANIFEST_ENTRY, MIMETYPE, MIMETYPE_ENTRY, Result,
    VIEWER_ENTRY, viewer,
};

/// Writes containers.
#[derive(Debug, Clone, Copy)]
pub struct Packager {
    viewer: bool,
}

impl Default for Packager {
    fn default() -> Self {
        Self { viewer: true }
    }
}

impl Packager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether to embed a `viewer.html` snapshot.
    #[must_use]
    pub fn with_viewer(mut self, viewer: bool) -> Self {
        self.viewer = viewer;
        self
    }

    /// Packages a container at `path` and returns a handle to it.
    ///
    /// The manifest's digest and file hashes must match the encoded
    /// content exactly; a mismatch is reported as
    /// [`ContainerError::DigestMismatch`] and nothing is written.
    pub fn pack(
        &self,
        path: &Path,
        manifest: &Manifest,
        steps: &[Step],
        environment: &Environment,
        artifacts: &Artifacts,
    ) -> Result<Container> {
        if manifest.spec_version != SPEC_VERSION {
            return Err(ContainerError::FormatMismatch {
                found: manifest.spec_version.clone(),
                expected: SPEC_VERSION,
            });
        }
        let covered = CoveredContent::encode(steps, environment, artifacts)?;
        check_digest(manifest, &covered)?;

        let viewer = if self.viewer {
            Some(viewer::render(manifest, steps)?)
        } else {
            None
        };
        write_archive(path, manifest, &covered, viewer.as_deref())?;
        tracing::info!(
            path = %path.display(),
            steps = steps.len(),
            digest = %manifest.content_digest,
            signed = manifest.is_signed(),
            "container written"
        );
        Container::open(path)
    }
}

/// Packages a container at `path` with the default options.
pub fn pack(
    path: impl AsRef<Path>,
    manifest: &Manifest,
    steps: &[Step],
    environment: &Environment,
    artifacts: &Artifacts,
) -> Result<Container> {
    Packager::default().pack(path.as_ref(), manifest, steps, environment, artifacts)
}

/// Re-persists an existing container with a replacement manifest.
///
/// Covered entries are copied byte for byte. A viewer, if the archive has
/// one, is re-rendered so its snapshot matches the new manifest.
pub(crate) fn rewrite_manifest(container: &mut Container, manifest: &Manifest) -> Result<()> {
    let covered = container.covered_content()?;
    check_digest(manifest, &covered)?;

    let viewer = if container.has_entry(VIEWER_ENTRY) {
        let steps = container.steps()?;
        Some(viewer::render(manifest, &steps)?)
    } else {
        None
    };
    let path = container.path().to_path_buf();
    write_archive(&path, manifest, &covered, viewer.as_deref())?;
    tracing::info!(path = %path.display(), "container re-persisted");
    container.reload()
}

fn check_digest(manifest: &Manifest, covered: &CoveredContent) -> Result<()> {
    let actual = covered.digest();
    if manifest.content_digest != actual || manifest.file_manifest != covered.file_hashes() {
        return Err(ContainerError::DigestMismatch {
            expected: manifest.content_digest.clone(),
            actual,
        });
    }
    Ok(())
}

/// Writes the archive to a temporary file beside `path`, then renames it
/// into place.
fn write_archive(
    path: &Path,
    manifest: &Manifest,
    covered: &CoveredContent,
    viewer: Option<&str>,
) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let manifest_bytes = to_canonical_bytes(manifest)?;

    let mut temp = NamedTempFile::new_in(dir)?;
    {
        let mut zip = ZipWriter::new(temp.as_file_mut());
        let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        let deflated =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        zip.start_file(MIMETYPE_ENTRY, stored)?;
        zip.write_all(MIMETYPE.as_bytes())?;

        zip.start_file(MANIFEST_ENTRY, deflated)?;
        zip.write_all(&manifest_bytes)?;

        for (name, bytes) in covered.entries() {
            tracing::debug!(entry = name, bytes = bytes.len(), "writing entry");
            zip.start_file(name, deflated)?;
            zip.write_all(bytes)?;
        }

        if let Some(html) = viewer {
            zip.start_file(VIEWER_ENTRY, deflated)?;
            zip.write_all(html.as_bytes())?;
        }

        zip.finish()?;
    }
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| ContainerError::Io(e.error))?;
    Ok(())
}
