//! Manifest Builder: session metadata + final content → [`Manifest`].

use jiff::Timestamp;

use crate::canonical::CoveredContent;
use crate::container::{Artifacts, ContainerError};
use crate::model::{Environment, Manifest, SPEC_VERSION, SessionMetadata, Step};

/// Builds a manifest with no artifacts, closed now.
pub fn build(
    metadata: &SessionMetadata,
    steps: &[Step],
    environment: &Environment,
) -> Result<Manifest, ContainerError> {
    ManifestBuilder::new(metadata).build(steps, environment)
}

/// Builds manifests with optional artifacts, close time, and partial flag.
#[derive(Debug, Clone)]
pub struct ManifestBuilder<'a> {
    metadata: &'a SessionMetadata,
    artifacts: Option<&'a Artifacts>,
    closed_at: Option<Timestamp>,
    partial: bool,
}

impl<'a> ManifestBuilder<'a> {
    pub fn new(metadata: &'a SessionMetadata) -> Self {
        Self {
            metadata,
            artifacts: None,
            closed_at: None,
            partial: false,
        }
    }

    /// Artifacts to cover in the digest.
    #[must_use]
    pub fn artifacts(mut self, artifacts: &'a Artifacts) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Close time. Defaults to now, or the last step's time if later.
    #[must_use]
    pub fn closed_at(mut self, closed_at: Timestamp) -> Self {
        self.closed_at = Some(closed_at);
        self
    }

    #[must_use]
    pub fn partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    /// Encodes the content and computes its digest.
    ///
    /// The digest depends only on the logical content: the same steps,
    /// environment, and artifacts always yield the same `content_digest`.
    pub fn build(
        self,
        steps: &[Step],
        environment: &Environment,
    ) -> Result<Manifest, ContainerError> {
        let empty = Artifacts::new();
        let artifacts = self.artifacts.unwrap_or(&empty);
        let covered = CoveredContent::encode(steps, environment, artifacts)?;
        Ok(self.finish(steps, &covered))
    }

    fn finish(self, steps: &[Step], covered: &CoveredContent) -> Manifest {
        let closed_at = self.closed_at.unwrap_or_else(|| {
            let now = Timestamp::now();
            steps.last().map_or(now, |last| last.timestamp.max(now))
        });
        let metadata = self.metadata.clone();

        Manifest {
            spec_version: SPEC_VERSION.to_string(),
            workflow_id: metadata.workflow_id,
            workflow_name: metadata.workflow_name,
            goal: metadata.goal,
            notes: metadata.notes,
            metadata_tags: metadata.metadata_tags,
            created_at: metadata.created_at,
            closed_at,
            step_count: steps.len() as u64,
            content_digest: covered.digest(),
            file_manifest: covered.file_hashes(),
            partial: self.partial,
            signature: None,
        }
    }
}
