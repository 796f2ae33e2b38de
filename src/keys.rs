//! Named Ed25519 keys.
//!
//! The signer and verifier only see the [`KeyStore`] trait. Two stores
//! ship with the crate:
//!
//! - [`MemoryKeyStore`] for tests and embedding
//! - [`FileKeyStore`], one directory of hex files:
//!
//! ```text
//! <dir>/<key_id>.key    # 32-byte secret seed, hex, mode 0600
//! <dir>/<key_id>.pub    # 32-byte public key, hex
//! ```
//!
//! A directory may hold only `.pub` files, which is enough to verify.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use crate::config::Config;

/// Errors that can occur while loading or creating keys.
#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("invalid key id {0:?}: use letters, digits, '.', '_', or '-'")]
    InvalidKeyId(String),

    #[error("key {0:?} already exists")]
    AlreadyExists(String),

    #[error("key {key_id:?} is malformed: {reason}")]
    Malformed { key_id: String, reason: String },

    #[error("no key directory: set {} or keys-dir in config", crate::config::KEYS_DIR_ENV)]
    NoKeysDir,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = core::result::Result<T, KeyStoreError>;

/// Resolves key ids to Ed25519 keys.
pub trait KeyStore {
    /// The private key for `key_id`, or `None` if the store has none.
    fn signing_key(&self, key_id: &str) -> Result<Option<SigningKey>>;

    /// The public key for `key_id`, or `None` if the store has none.
    fn verifying_key(&self, key_id: &str) -> Result<Option<VerifyingKey>>;

    /// Creates a new key pair under `key_id`.
    ///
    /// Fails with [`KeyStoreError::AlreadyExists`] rather than replacing
    /// an existing key.
    fn generate(&self, key_id: &str) -> Result<VerifyingKey>;

    /// Known key ids, sorted.
    fn list(&self) -> Result<Vec<String>>;
}

/// Checks that a key id is non-empty and uses only `[A-Za-z0-9._-]`.
///
/// Key ids appear in file names and inside `ed25519:<key_id>:<sig>`, so
/// `:` and path separators are never allowed.
pub fn validate_key_id(key_id: &str) -> Result<()> {
    let valid = !key_id.is_empty()
        && key_id != "."
        && key_id != ".."
        && key_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(KeyStoreError::InvalidKeyId(key_id.to_string()))
    }
}

// ── In-memory ──

#[derive(Debug, Clone)]
enum KeyEntry {
    Pair(SigningKey),
    Public(VerifyingKey),
}

/// Keys held in memory.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: Mutex<BTreeMap<String, KeyEntry>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a key pair.
    pub fn insert(&self, key_id: &str, key: SigningKey) -> Result<()> {
        validate_key_id(key_id)?;
        self.entries().insert(key_id.to_string(), KeyEntry::Pair(key));
        Ok(())
    }

    /// Adds (or replaces) a public key with no private half.
    pub fn insert_verifying_key(&self, key_id: &str, key: VerifyingKey) -> Result<()> {
        validate_key_id(key_id)?;
        self.entries()
            .insert(key_id.to_string(), KeyEntry::Public(key));
        Ok(())
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, KeyEntry>> {
        // Entries are plain values; a panic mid-insert cannot leave one half-written.
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeyStore for MemoryKeyStore {
    fn signing_key(&self, key_id: &str) -> Result<Option<SigningKey>> {
        validate_key_id(key_id)?;
        Ok(match self.entries().get(key_id) {
            Some(KeyEntry::Pair(key)) => Some(key.clone()),
            _ => None,
        })
    }

    fn verifying_key(&self, key_id: &str) -> Result<Option<VerifyingKey>> {
        validate_key_id(key_id)?;
        Ok(self.entries().get(key_id).map(|entry| match entry {
            KeyEntry::Pair(key) => key.verifying_key(),
            KeyEntry::Public(key) => *key,
        }))
    }

    fn generate(&self, key_id: &str) -> Result<VerifyingKey> {
        validate_key_id(key_id)?;
        let mut entries = self.entries();
        if entries.contains_key(key_id) {
            return Err(KeyStoreError::AlreadyExists(key_id.to_string()));
        }
        let key = SigningKey::generate(&mut OsRng);
        let public = key.verifying_key();
        entries.insert(key_id.to_string(), KeyEntry::Pair(key));
        tracing::info!(key_id, "generated in-memory key");
        Ok(public)
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(self.entries().keys().cloned().collect())
    }
}

// ── Directory ──

const SECRET_EXT: &str = "key";
const PUBLIC_EXT: &str = "pub";

/// Keys stored as hex files in one directory.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    /// A store rooted at `dir`. The directory is created on first
    /// [`KeyStore::generate`].
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// A store at the directory the config resolves to.
    pub fn from_config(config: &Config) -> Result<Self> {
        config
            .resolve_keys_dir(None)
            .map(Self::new)
            .ok_or(KeyStoreError::NoKeysDir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, key_id: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{key_id}.{ext}"))
    }
}

impl KeyStore for FileKeyStore {
    fn signing_key(&self, key_id: &str) -> Result<Option<SigningKey>> {
        validate_key_id(key_id)?;
        let Some(seed) = read_hex_key(&self.key_path(key_id, SECRET_EXT), key_id)? else {
            return Ok(None);
        };
        Ok(Some(SigningKey::from_bytes(&seed)))
    }

    fn verifying_key(&self, key_id: &str) -> Result<Option<VerifyingKey>> {
        validate_key_id(key_id)?;
        if let Some(bytes) = read_hex_key(&self.key_path(key_id, PUBLIC_EXT), key_id)? {
            let key = VerifyingKey::from_bytes(&bytes).map_err(|e| KeyStoreError::Malformed {
                key_id: key_id.to_string(),
                reason: e.to_string(),
            })?;
            return Ok(Some(key));
        }
        Ok(self.signing_key(key_id)?.map(|key| key.verifying_key()))
    }

    fn generate(&self, key_id: &str) -> Result<VerifyingKey> {
        validate_key_id(key_id)?;
        fs::create_dir_all(&self.dir)?;

        let key = SigningKey::generate(&mut OsRng);
        let public = key.verifying_key();
        let secret_path = self.key_path(key_id, SECRET_EXT);
        match write_secret(&secret_path, &hex::encode(key.to_bytes())) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(KeyStoreError::AlreadyExists(key_id.to_string()));
            }
            other => other?,
        }
        fs::write(
            self.key_path(key_id, PUBLIC_EXT),
            hex::encode(public.to_bytes()),
        )?;

        tracing::info!(key_id, dir = %self.dir.display(), "generated key");
        Ok(public)
    }

    fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_key = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == SECRET_EXT || e == PUBLIC_EXT);
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && is_key
                && validate_key_id(stem).is_ok()
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

/// Reads a 32-byte hex key file. A missing file is `None`.
fn read_hex_key(path: &Path, key_id: &str) -> Result<Option<[u8; 32]>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let malformed = |reason: String| KeyStoreError::Malformed {
        key_id: key_id.to_string(),
        reason,
    };
    let bytes = hex::decode(text.trim()).map_err(|e| malformed(e.to_string()))?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| malformed(format!("expected 32 bytes, found {}", b.len())))?;
    Ok(Some(key))
}

/// Creates a secret key file readable only by its owner.
fn write_secret(path: &Path, contents: &str) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()
}
