//! Verifier: does a container's content still match its manifest and
//! signature?
//!
//! Each run is read-only and walks a fixed sequence:
//!
//! 1. open the archive and parse `manifest.json`
//! 2. recompute the content digest from the persisted covered entries
//! 3. compare it with `content_digest` and `file_manifest` (→ `TAMPERED`)
//! 4. check the signature, if any (→ `UNSIGNED`, `SIGNED_VALID`,
//!    `SIGNED_INVALID`)
//!
//! Trust failures and broken archives are report statuses, never errors.
//! Only I/O failures and an unsupported `spec_version` are returned as
//! [`VerifyError`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use ed25519_dalek::Signature;
use serde::Serialize;

use crate::container::{Container, ContainerError};
use crate::keys::{KeyStore, KeyStoreError};
use crate::sign::{ALGORITHM, SignatureString};

/// Errors that stop verification from producing a report.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),
}

/// Terminal state of a verification run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    /// Covered content differs from what the manifest recorded.
    Tampered,
    /// Content is intact but nothing vouches for it.
    Unsigned,
    /// Content is intact and the signature checks out.
    SignedValid,
    /// Content matches the manifest but the signature does not.
    SignedInvalid,
    /// The archive violates the container layout.
    Corrupt,
}

impl VerificationStatus {
    pub fn trust_level(self) -> TrustLevel {
        match self {
            Self::SignedValid => TrustLevel::High,
            Self::Unsigned => TrustLevel::Unverified,
            Self::Tampered | Self::SignedInvalid | Self::Corrupt => TrustLevel::None,
        }
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tampered => "TAMPERED",
            Self::Unsigned => "UNSIGNED",
            Self::SignedValid => "SIGNED_VALID",
            Self::SignedInvalid => "SIGNED_INVALID",
            Self::Corrupt => "CORRUPT",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustLevel {
    High,
    Unverified,
    None,
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::High => "HIGH",
            Self::Unverified => "UNVERIFIED",
            Self::None => "NONE",
        })
    }
}

/// Outcome of verifying one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub path: PathBuf,
    pub status: VerificationStatus,
    /// Digest recomputed from the archive, if its covered entries could be read.
    pub digest: Option<String>,
    /// Digest the manifest recorded.
    pub expected_digest: Option<String>,
    pub signer_key_id: Option<String>,
    /// Covered entries whose hash differs from `file_manifest`, or that
    /// were added or removed.
    pub mismatched_files: Vec<String>,
    pub detail: Option<String>,
}

impl VerificationReport {
    fn new(path: &Path, status: VerificationStatus) -> Self {
        Self {
            path: path.to_path_buf(),
            status,
            digest: None,
            expected_digest: None,
            signer_key_id: None,
            mismatched_files: Vec::new(),
            detail: None,
        }
    }

    pub fn trust_level(&self) -> TrustLevel {
        self.status.trust_level()
    }

    /// True only for [`VerificationStatus::SignedValid`].
    pub fn is_trusted(&self) -> bool {
        self.status == VerificationStatus::SignedValid
    }
}

/// Verifies containers against public keys from a [`KeyStore`].
pub struct Verifier<'k, K: KeyStore + ?Sized> {
    keys: &'k K,
}

impl<K: KeyStore + ?Sized> fmt::Debug for Verifier<'_, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Verifier").finish_non_exhaustive()
    }
}

impl<'k, K: KeyStore + ?Sized> Verifier<'k, K> {
    pub fn new(keys: &'k K) -> Self {
        Self { keys }
    }

    pub fn verify(&self, path: impl AsRef<Path>) -> Result<VerificationReport, VerifyError> {
        let path = path.as_ref();
        let report = self.run(path)?;
        tracing::info!(
            path = %path.display(),
            status = ?report.status,
            signer = report.signer_key_id.as_deref().unwrap_or("-"),
            "container verified"
        );
        Ok(report)
    }

    fn run(&self, path: &Path) -> Result<VerificationReport, VerifyError> {
        // Open + ParseManifest.
        let mut container = match Container::open(path) {
            Ok(container) => container,
            Err(ContainerError::Corrupt(detail)) => return Ok(corrupt(path, detail)),
            Err(e) => return Err(e.into()),
        };

        // RecomputeDigest.
        let covered = match container.covered_content() {
            Ok(covered) => covered,
            Err(ContainerError::Corrupt(detail)) => return Ok(corrupt(path, detail)),
            Err(e) => return Err(e.into()),
        };
        let manifest = container.manifest();
        let mut report = VerificationReport::new(path, VerificationStatus::Unsigned);
        report.digest = Some(covered.digest());
        report.expected_digest = Some(manifest.content_digest.clone());

        // CompareDigest.
        report.mismatched_files = mismatched_files(&manifest.file_manifest, &covered.file_hashes());
        if report.digest.as_ref() != Some(&manifest.content_digest)
            || !report.mismatched_files.is_empty()
        {
            report.status = VerificationStatus::Tampered;
            report.detail = Some("content does not match the manifest".into());
            return Ok(report);
        }

        // CheckSignature.
        let Some(signature) = manifest.signature.as_deref() else {
            return Ok(report);
        };
        let parsed: SignatureString = match signature.parse() {
            Ok(parsed) => parsed,
            Err(e) => return Ok(signed_invalid(report, format!("malformed signature: {e}"))),
        };
        report.signer_key_id = Some(parsed.key_id.clone());

        if parsed.algorithm != ALGORITHM {
            let detail = format!("unsupported algorithm {:?}", parsed.algorithm);
            return Ok(signed_invalid(report, detail));
        }
        let Some(public) = self.keys.verifying_key(&parsed.key_id)? else {
            let detail = format!("no public key for {:?}", parsed.key_id);
            return Ok(signed_invalid(report, detail));
        };
        let signature = match Signature::from_slice(&parsed.signature) {
            Ok(signature) => signature,
            Err(e) => return Ok(signed_invalid(report, e.to_string())),
        };
        match public.verify_strict(&covered.digest_bytes(), &signature) {
            Ok(()) => report.status = VerificationStatus::SignedValid,
            Err(_) => return Ok(signed_invalid(report, "signature does not match".into())),
        }
        Ok(report)
    }
}

/// Verifies the container at `path` with public keys from `keys`.
pub fn verify<K: KeyStore + ?Sized>(
    path: impl AsRef<Path>,
    keys: &K,
) -> Result<VerificationReport, VerifyError> {
    Verifier::new(keys).verify(path)
}

fn corrupt(path: &Path, detail: String) -> VerificationReport {
    tracing::warn!(path = %path.display(), %detail, "corrupt container");
    let mut report = VerificationReport::new(path, VerificationStatus::Corrupt);
    report.detail = Some(detail);
    report
}

fn signed_invalid(mut report: VerificationReport, detail: String) -> VerificationReport {
    report.status = VerificationStatus::SignedInvalid;
    report.detail = Some(detail);
    report
}

fn mismatched_files(
    expected: &BTreeMap<String, String>,
    actual: &BTreeMap<String, String>,
) -> Vec<String> {
    let names: BTreeSet<&String> = expected.keys().chain(actual.keys()).collect();
    names
        .into_iter()
        .filter(|name| expected.get(*name) != actual.get(*name))
        .cloned()
        .collect()
}
