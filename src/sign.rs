//! Signer: a detached Ed25519 signature over a container's content digest.
//!
//! The signed message is the raw 32-byte SHA-256 digest, not the archive
//! bytes, so re-zipping with different compression never invalidates a
//! signature. The result is stored in the manifest as
//! `ed25519:<key_id>:<base64 signature>`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::Signer as _;
use hex::FromHex;

use crate::container::{Container, ContainerError, rewrite_manifest};
use crate::keys::{KeyStore, KeyStoreError, validate_key_id};
use crate::model::Manifest;

/// The only signature algorithm this crate produces or accepts.
pub const ALGORITHM: &str = "ed25519";

/// Errors that can occur while signing.
#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("key {key_id:?} not found")]
    KeyNotFound {
        key_id: String,
        attempts: Vec<SigningAttempt>,
    },

    #[error("signing with key {key_id:?} failed")]
    SigningFailure {
        key_id: String,
        attempts: Vec<SigningAttempt>,
    },

    #[error("{} is already signed", path.display())]
    AlreadySigned { path: PathBuf },

    #[error("manifest is already signed")]
    ManifestAlreadySigned,

    #[error("content digest mismatch: manifest has {expected}, content hashes to {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("content digest {0:?} is not 32 bytes of hex")]
    InvalidDigest(String),

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error(transparent)]
    Container(#[from] ContainerError),
}

pub type Result<T> = core::result::Result<T, SignError>;

// ── Signature string ──

/// Errors that can occur while parsing a signature string.
#[derive(Debug, thiserror::Error)]
pub enum SignatureParseError {
    #[error("expected <algorithm>:<key_id>:<base64>")]
    Shape,

    #[error("invalid key id {0:?}")]
    InvalidKeyId(String),

    #[error("signature is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
}

/// A parsed `<algorithm>:<key_id>:<base64 signature>` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureString {
    pub algorithm: String,
    pub key_id: String,
    pub signature: Vec<u8>,
}

impl fmt::Display for SignatureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.algorithm,
            self.key_id,
            STANDARD.encode(&self.signature)
        )
    }
}

impl FromStr for SignatureString {
    type Err = SignatureParseError;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (Some(algorithm), Some(key_id), Some(encoded)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(SignatureParseError::Shape);
        };
        if algorithm.is_empty() || encoded.is_empty() {
            return Err(SignatureParseError::Shape);
        }
        if validate_key_id(key_id).is_err() {
            return Err(SignatureParseError::InvalidKeyId(key_id.to_string()));
        }
        Ok(Self {
            algorithm: algorithm.to_string(),
            key_id: key_id.to_string(),
            signature: STANDARD.decode(encoded)?,
        })
    }
}

// ── Strategies ──

/// One way of obtaining a signing key, tried in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningStrategy {
    /// Load the named key from the key store.
    ExistingKey,
    /// Generate the named key, then sign with it.
    GenerateKey,
}

/// What happened when a strategy was tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Signed,
    KeyMissing,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningAttempt {
    pub strategy: SigningStrategy,
    pub outcome: AttemptOutcome,
}

/// A successful signature plus every attempt that led to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignOutcome {
    pub signature: String,
    pub attempts: Vec<SigningAttempt>,
}

/// Signs content digests with keys from a [`KeyStore`].
pub struct Signer<'k, K: KeyStore + ?Sized> {
    keys: &'k K,
    strategies: Vec<SigningStrategy>,
}

impl<K: KeyStore + ?Sized> fmt::Debug for Signer<'_, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("strategies", &self.strategies)
            .finish_non_exhaustive()
    }
}

impl<'k, K: KeyStore + ?Sized> Signer<'k, K> {
    /// A signer that only uses keys already in `keys`.
    pub fn new(keys: &'k K) -> Self {
        Self {
            keys,
            strategies: vec![SigningStrategy::ExistingKey],
        }
    }

    /// Whether a missing key is generated on first use.
    #[must_use]
    pub fn with_auto_generate(mut self, auto_generate: bool) -> Self {
        self.strategies = if auto_generate {
            vec![SigningStrategy::ExistingKey, SigningStrategy::GenerateKey]
        } else {
            vec![SigningStrategy::ExistingKey]
        };
        self
    }

    pub fn strategies(&self) -> &[SigningStrategy] {
        &self.strategies
    }

    /// Signs a hex content digest with `key_id`.
    ///
    /// Strategies run in order until one signs. If none does, the error
    /// is [`SignError::SigningFailure`] when any attempt hit an error and
    /// [`SignError::KeyNotFound`] otherwise.
    pub fn sign_digest(&self, content_digest: &str, key_id: &str) -> Result<SignOutcome> {
        let digest = <[u8; 32]>::from_hex(content_digest)
            .map_err(|_| SignError::InvalidDigest(content_digest.to_string()))?;
        validate_key_id(key_id)?;

        let mut attempts = Vec::new();
        for &strategy in &self.strategies {
            let outcome = match self.try_strategy(strategy, key_id, &digest) {
                Ok(Some(signature)) => {
                    attempts.push(SigningAttempt {
                        strategy,
                        outcome: AttemptOutcome::Signed,
                    });
                    let signature = SignatureString {
                        algorithm: ALGORITHM.to_string(),
                        key_id: key_id.to_string(),
                        signature,
                    };
                    tracing::debug!(key_id, ?strategy, "digest signed");
                    return Ok(SignOutcome {
                        signature: signature.to_string(),
                        attempts,
                    });
                }
                Ok(None) => AttemptOutcome::KeyMissing,
                Err(reason) => {
                    tracing::warn!(key_id, ?strategy, %reason, "signing attempt failed");
                    AttemptOutcome::Failed(reason)
                }
            };
            attempts.push(SigningAttempt { strategy, outcome });
        }

        let key_id = key_id.to_string();
        if attempts
            .iter()
            .any(|a| matches!(a.outcome, AttemptOutcome::Failed(_)))
        {
            Err(SignError::SigningFailure { key_id, attempts })
        } else {
            Err(SignError::KeyNotFound { key_id, attempts })
        }
    }

    /// Signs a manifest in place. Refuses one that already has a signature.
    pub fn sign_manifest(&self, manifest: &mut Manifest, key_id: &str) -> Result<SignOutcome> {
        if manifest.is_signed() {
            return Err(SignError::ManifestAlreadySigned);
        }
        let outcome = self.sign_digest(&manifest.content_digest, key_id)?;
        manifest.signature = Some(outcome.signature.clone());
        Ok(outcome)
    }

    /// Signs an unsigned container on disk and re-persists it atomically.
    pub fn sign_container(&self, path: &Path, key_id: &str) -> Result<SignOutcome> {
        let mut container = Container::open(path)?;
        let mut manifest = container.manifest().clone();
        if manifest.is_signed() {
            return Err(SignError::AlreadySigned {
                path: path.to_path_buf(),
            });
        }

        let actual = container.covered_content()?.digest();
        if actual != manifest.content_digest {
            return Err(SignError::DigestMismatch {
                expected: manifest.content_digest,
                actual,
            });
        }

        let outcome = self.sign_manifest(&mut manifest, key_id)?;
        rewrite_manifest(&mut container, &manifest)?;
        tracing::info!(path = %path.display(), key_id, "container signed");
        Ok(outcome)
    }

    /// `Ok(None)` when the strategy found no key; `Err` carries a reason.
    fn try_strategy(
        &self,
        strategy: SigningStrategy,
        key_id: &str,
        digest: &[u8; 32],
    ) -> core::result::Result<Option<Vec<u8>>, String> {
        let key = match strategy {
            SigningStrategy::ExistingKey => self.keys.signing_key(key_id),
            SigningStrategy::GenerateKey => self
                .keys
                .generate(key_id)
                .and_then(|_| self.keys.signing_key(key_id)),
        }
        .map_err(|e| e.to_string())?;

        let Some(key) = key else {
            return Ok(None);
        };
        let signature = key.try_sign(digest).map_err(|e| e.to_string())?;
        Ok(Some(signature.to_bytes().to_vec()))
    }
}

/// Signs the unsigned container at `path` with `key_id`.
pub fn sign<K: KeyStore + ?Sized>(
    path: impl AsRef<Path>,
    key_id: &str,
    signer: &Signer<'_, K>,
) -> Result<SignOutcome> {
    signer.sign_container(path.as_ref(), key_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    use ed25519_dalek::{Signature, SigningKey, VerifyingKey};

    use crate::keys::MemoryKeyStore;

    const DIGEST: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    /// A store whose every operation fails.
    struct BrokenStore;

    impl KeyStore for BrokenStore {
        fn signing_key(&self, _: &str) -> crate::keys::Result<Option<SigningKey>> {
            Err(std::io::Error::other("disk unplugged").into())
        }
        fn verifying_key(&self, _: &str) -> crate::keys::Result<Option<VerifyingKey>> {
            Err(std::io::Error::other("disk unplugged").into())
        }
        fn generate(&self, _: &str) -> crate::keys::Result<VerifyingKey> {
            Err(std::io::Error::other("disk unplugged").into())
        }
        fn list(&self) -> crate::keys::Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn outcomes(attempts: &[SigningAttempt]) -> Vec<(SigningStrategy, AttemptOutcome)> {
        attempts
            .iter()
            .map(|a| (a.strategy, a.outcome.clone()))
            .collect()
    }

    #[test]
    fn signature_string_round_trips() {
        let sig = SignatureString {
            algorithm: ALGORITHM.into(),
            key_id: "default".into(),
            signature: vec![1, 2, 3, 250],
        };
        let text = sig.to_string();

        assert_eq!(text, "ed25519:default:AQID+g==");
        assert_eq!(text.parse::<SignatureString>().unwrap(), sig);
    }

    #[test]
    fn signature_string_rejects_bad_shapes() {
        assert!(matches!(
            "ed25519:default".parse::<SignatureString>(),
            Err(SignatureParseError::Shape)
        ));
        assert!(matches!(
            "ed25519:a/b:AAAA".parse::<SignatureString>(),
            Err(SignatureParseError::InvalidKeyId(_))
        ));
        assert!(matches!(
            "ed25519:default:not base64!".parse::<SignatureString>(),
            Err(SignatureParseError::Encoding(_))
        ));
    }

    #[test]
    fn signs_with_existing_key() {
        let keys = MemoryKeyStore::new();
        let public = keys.generate("default").unwrap();

        let outcome = Signer::new(&keys).sign_digest(DIGEST, "default").unwrap();

        let parsed: SignatureString = outcome.signature.parse().unwrap();
        assert_eq!(parsed.algorithm, "ed25519");
        assert_eq!(parsed.key_id, "default");
        let signature = Signature::from_slice(&parsed.signature).unwrap();
        let digest = <[u8; 32]>::from_hex(DIGEST).unwrap();
        assert!(public.verify_strict(&digest, &signature).is_ok());
        assert_eq!(
            outcomes(&outcome.attempts),
            [(SigningStrategy::ExistingKey, AttemptOutcome::Signed)]
        );
    }

    #[test]
    fn missing_key_without_auto_generate() {
        let keys = MemoryKeyStore::new();

        let err = Signer::new(&keys)
            .sign_digest(DIGEST, "default")
            .unwrap_err();

        let SignError::KeyNotFound { key_id, attempts } = err else {
            panic!("expected KeyNotFound, got {err:?}");
        };
        assert_eq!(key_id, "default");
        assert_eq!(
            outcomes(&attempts),
            [(SigningStrategy::ExistingKey, AttemptOutcome::KeyMissing)]
        );
        assert!(keys.list().unwrap().is_empty());
    }

    #[test]
    fn auto_generate_records_both_attempts() {
        let keys = MemoryKeyStore::new();

        let outcome = Signer::new(&keys)
            .with_auto_generate(true)
            .sign_digest(DIGEST, "fresh")
            .unwrap();

        assert_eq!(
            outcomes(&outcome.attempts),
            [
                (SigningStrategy::ExistingKey, AttemptOutcome::KeyMissing),
                (SigningStrategy::GenerateKey, AttemptOutcome::Signed),
            ]
        );
        assert_eq!(keys.list().unwrap(), ["fresh"]);
    }

    #[test]
    fn backend_errors_are_signing_failures() {
        let err = Signer::new(&BrokenStore)
            .with_auto_generate(true)
            .sign_digest(DIGEST, "default")
            .unwrap_err();

        let SignError::SigningFailure { attempts, .. } = err else {
            panic!("expected SigningFailure, got {err:?}");
        };
        assert_eq!(attempts.len(), 2);
        assert!(
            attempts
                .iter()
                .all(|a| matches!(a.outcome, AttemptOutcome::Failed(_)))
        );
    }

    #[test]
    fn rejects_malformed_digest_and_key_id() {
        let keys = MemoryKeyStore::new();
        let signer = Signer::new(&keys);

        assert!(matches!(
            signer.sign_digest("abc", "default"),
            Err(SignError::InvalidDigest(_))
        ));
        assert!(matches!(
            signer.sign_digest(DIGEST, "a:b"),
            Err(SignError::KeyStore(KeyStoreError::InvalidKeyId(_)))
        ));
    }

    #[test]
    fn manifest_is_signed_once() {
        let keys = MemoryKeyStore::new();
        keys.generate("default").unwrap();
        let signer = Signer::new(&keys);
        let mut manifest = crate::manifest::build(
            &crate::model::SessionMetadata::new(None),
            &[],
            &crate::model::Environment::capture(),
        )
        .unwrap();

        signer.sign_manifest(&mut manifest, "default").unwrap();
        assert!(manifest.is_signed());

        let err = signer.sign_manifest(&mut manifest, "default").unwrap_err();
        assert!(matches!(err, SignError::ManifestAlreadySigned));
    }
}
