//! Tamper-evident evidence containers.
//!
//! An `.epi` file is a ZIP archive holding a recorded sequence of steps,
//! the environment they ran in, optional artifacts, and a manifest whose
//! content digest can carry a detached Ed25519 signature:
//!
//! ```text
//! mimetype            # "application/epi+zip", stored first, uncompressed
//! manifest.json       # Manifest, canonical JSON
//! steps.jsonl         # One canonical JSON step per line, in index order
//! environment.json    # Captured runtime metadata
//! artifacts/*         # Optional caller-attached files
//! viewer.html         # Optional self-contained snapshot page
//! ```
//!
//! The usual flow is [`record`] → [`Session::log_step`] → [`Session::close`],
//! then [`verify`] on the resulting file. [`sign`] signs an existing
//! unsigned container after the fact.

mod canonical;
mod config;
mod container;
mod keys;
mod manifest;
mod model;
mod session;
mod sign;
mod steplog;
mod verify;

pub use canonical::{CoveredContent, to_canonical_bytes};
pub use config::{Config, ConfigError, KEYS_DIR_ENV};
pub use container::{
    Artifacts, Container, ContainerError, MIMETYPE, Packager, pack, validate_artifact_name,
};
pub use keys::{FileKeyStore, KeyStore, KeyStoreError, MemoryKeyStore, validate_key_id};
pub use manifest::{ManifestBuilder, build};
pub use model::{Content, Environment, Manifest, SPEC_VERSION, SessionMetadata, Step};
pub use session::{RecordOptions, Session, SessionError, SessionReport, record, recover};
pub use sign::{
    ALGORITHM, AttemptOutcome, SignError, SignOutcome, SignatureParseError, SignatureString,
    Signer, SigningAttempt, SigningStrategy, sign,
};
pub use steplog::{StepError, StepLog};
pub use verify::{TrustLevel, VerificationReport, VerificationStatus, VerifyError, Verifier, verify};
