//! Recorder configuration.
//!
//! Loaded from `~/.epi/config.toml`. A missing file means defaults:
//!
//! ```toml
//! keys-dir = "/home/me/.epi/keys"
//! default-key = "default"
//! auto-generate-keys = true
//! write-ahead = true
//! viewer = true
//! ```
//!
//! The key directory is resolved through a chain:
//!
//! 1. an explicit path from the caller
//! 2. the `EPI_KEYS_DIR` environment variable
//! 3. `keys-dir` in the config file
//! 4. `~/.epi/keys`

use std::path::{Path, PathBuf};
use std::{env, fs, io};

use serde::{Deserialize, Serialize};

/// Environment variable that overrides the key directory.
pub const KEYS_DIR_ENV: &str = "EPI_KEYS_DIR";

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("invalid config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Recorder configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    /// Where signing keys live. See the module docs for the full chain.
    pub keys_dir: Option<PathBuf>,

    /// Key used when a session signs without naming one.
    pub default_key: String,

    /// Generate the named key on first use instead of failing.
    pub auto_generate_keys: bool,

    /// Stream steps to a journal beside the archive while recording.
    pub write_ahead: bool,

    /// Embed `viewer.html` in new containers.
    pub viewer: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keys_dir: None,
            default_key: "default".to_string(),
            auto_generate_keys: true,
            write_ahead: true,
            viewer: true,
        }
    }
}

impl Config {
    /// Loads `~/.epi/config.toml`, or defaults if there is no such file.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Loads config from a specific file, or defaults if it doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The recorder home: `~/.epi`.
    pub fn home() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".epi"))
    }

    /// The config file path: `~/.epi/config.toml`.
    pub fn path() -> Option<PathBuf> {
        Self::home().map(|h| h.join("config.toml"))
    }

    /// Resolves the key directory through the chain in the module docs.
    pub fn resolve_keys_dir(&self, explicit: Option<&Path>) -> Option<PathBuf> {
        // 1. Explicit path.
        if let Some(dir) = explicit {
            return Some(dir.to_path_buf());
        }

        // 2. EPI_KEYS_DIR.
        if let Ok(dir) = env::var(KEYS_DIR_ENV)
            && !dir.is_empty()
        {
            return Some(PathBuf::from(dir));
        }

        // 3. Config file, 4. ~/.epi/keys.
        self.keys_dir
            .clone()
            .or_else(|| Self::home().map(|h| h.join("keys")))
    }
}
