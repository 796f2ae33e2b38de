//! Recording Session: open → log steps → close into one container.
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let keys = epi::MemoryKeyStore::new();
//! let mut session = epi::record("trade.epi", epi::RecordOptions::new("Trade"), &keys)?;
//! session.log_step("market.analysis", serde_json::json!({ "symbol": "AAPL" }))?;
//! let _report = session.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! A session that is dropped without [`Session::close`] flushes whatever
//! it has as an unsigned `partial` container. With write-ahead on, steps
//! also stream to `<archive>.wal` as they are logged, and [`recover`]
//! turns a journal left by a crashed process into a partial container.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use uuid::Uuid;

use crate::config::Config;
use crate::container::{Artifacts, Container, ContainerError, Packager, validate_artifact_name};
use crate::keys::KeyStore;
use crate::manifest::ManifestBuilder;
use crate::model::{Environment, SessionMetadata, Step};
use crate::sign::{SignError, Signer, SigningAttempt};
use crate::steplog::{Journal, StepError, StepLog, journal_path};

/// Errors that can occur during a recording session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Step(#[from] StepError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    /// The container was written unsigned because signing failed.
    #[error("{} was written unsigned: {source}", path.display())]
    AutoSign { path: PathBuf, source: SignError },

    #[error("a session is already recording to {} (journal exists)", .0.display())]
    JournalExists(PathBuf),

    #[error("no journal to recover for {}", .0.display())]
    NoJournal(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = core::result::Result<T, SessionError>;

/// How a session records, packages, and signs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOptions {
    pub workflow_name: Option<String>,
    pub goal: Option<String>,
    pub notes: Option<String>,
    pub metadata_tags: Vec<String>,

    /// Sign the container on close.
    pub auto_sign: bool,
    pub key_id: String,
    pub auto_generate_keys: bool,

    /// Stream steps to `<archive>.wal` as they are logged.
    pub write_ahead: bool,
    pub viewer: bool,

    /// Dependency versions to record in `environment.json`.
    pub dependencies: BTreeMap<String, String>,
}

impl Default for RecordOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RecordOptions {
    pub fn new(workflow_name: impl Into<String>) -> Self {
        Self {
            workflow_name: Some(workflow_name.into()),
            ..Self::default()
        }
    }

    /// Options seeded from configuration, with no descriptive fields.
    pub fn from_config(config: &Config) -> Self {
        Self {
            workflow_name: None,
            goal: None,
            notes: None,
            metadata_tags: Vec::new(),
            auto_sign: true,
            key_id: config.default_key.clone(),
            auto_generate_keys: config.auto_generate_keys,
            write_ahead: config.write_ahead,
            viewer: config.viewer,
            dependencies: BTreeMap::new(),
        }
    }
}

/// What a finished session produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub path: PathBuf,
    pub workflow_id: Uuid,
    pub content_digest: String,
    pub signature: Option<String>,
    pub step_count: u64,
    pub partial: bool,
    #[serde(skip)]
    pub attempts: Vec<SigningAttempt>,
}

/// A live recording.
pub struct Session<'k, K: KeyStore + ?Sized> {
    path: PathBuf,
    options: RecordOptions,
    metadata: SessionMetadata,
    environment: Environment,
    log: StepLog,
    artifacts: Artifacts,
    keys: &'k K,
    finished: bool,
}

impl<K: KeyStore + ?Sized> fmt::Debug for Session<'_, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("path", &self.path)
            .field("workflow_id", &self.metadata.workflow_id)
            .field("steps", &self.log.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// Starts recording to `path`.
///
/// `keys` is used on close when `options.auto_sign` is set. Fails with
/// [`SessionError::JournalExists`] if another session's journal is
/// already beside `path`.
pub fn record<'k, K: KeyStore + ?Sized>(
    path: impl AsRef<Path>,
    options: RecordOptions,
    keys: &'k K,
) -> Result<Session<'k, K>> {
    let path = path.as_ref().to_path_buf();
    let wal = journal_path(&path)?;
    let metadata = SessionMetadata {
        workflow_name: options.workflow_name.clone(),
        goal: options.goal.clone(),
        notes: options.notes.clone(),
        metadata_tags: options.metadata_tags.clone(),
        ..SessionMetadata::new(None)
    };
    let mut environment = Environment::capture();
    environment.dependencies.clone_from(&options.dependencies);

    let log = if options.write_ahead {
        let journal = Journal::create(wal, &metadata, &environment).map_err(
            |e| match e.kind() {
                io::ErrorKind::AlreadyExists => SessionError::JournalExists(path.clone()),
                _ => SessionError::Io(e),
            },
        )?;
        StepLog::with_journal(journal)
    } else {
        StepLog::new()
    };

    tracing::info!(
        path = %path.display(),
        workflow_id = %metadata.workflow_id,
        write_ahead = options.write_ahead,
        "recording started"
    );
    Ok(Session {
        path,
        options,
        metadata,
        environment,
        log,
        artifacts: Artifacts::new(),
        keys,
        finished: false,
    })
}

impl<K: KeyStore + ?Sized> Session<'_, K> {
    /// Appends a step. A failed append leaves the log unchanged.
    pub fn log_step(
        &mut self,
        kind: impl Into<String>,
        content: impl Serialize,
    ) -> core::result::Result<u64, StepError> {
        self.log.append(kind, content)
    }

    /// Attaches a file to be stored under `artifacts/<name>`.
    ///
    /// Attaching the same name again replaces the earlier bytes.
    pub fn attach_artifact(
        &mut self,
        name: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> core::result::Result<(), ContainerError> {
        let name = name.into();
        validate_artifact_name(&name)?;
        self.artifacts.insert(name, bytes.into());
        Ok(())
    }

    pub fn steps(&self) -> &[Step] {
        self.log.snapshot()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn workflow_id(&self) -> Uuid {
        self.metadata.workflow_id
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Packages the session, signing it if `auto_sign` is set.
    ///
    /// If signing fails the container is still written, unsigned, and the
    /// error is [`SessionError::AutoSign`].
    pub fn close(mut self) -> Result<SessionReport> {
        self.finish(false)
    }

    /// Runs `f` against the session, then closes it.
    ///
    /// If `f` fails, a partial container is flushed and `f`'s error is
    /// returned.
    pub fn run<T, E, F>(mut self, f: F) -> core::result::Result<(T, SessionReport), E>
    where
        F: FnOnce(&mut Self) -> core::result::Result<T, E>,
        E: From<SessionError>,
    {
        match f(&mut self) {
            Ok(value) => {
                let report = self.close()?;
                Ok((value, report))
            }
            Err(e) => {
                if let Err(flush) = self.finish(true) {
                    tracing::warn!(path = %self.path.display(), error = %flush, "partial flush failed");
                }
                Err(e)
            }
        }
    }

    fn finish(&mut self, partial: bool) -> Result<SessionReport> {
        // Whatever happens below, Drop must not try again.
        self.finished = true;

        let steps = self.log.snapshot();
        let mut manifest = ManifestBuilder::new(&self.metadata)
            .artifacts(&self.artifacts)
            .partial(partial)
            .build(steps, &self.environment)?;

        let mut attempts = Vec::new();
        let mut sign_error = None;
        if self.options.auto_sign && !partial {
            let signer = Signer::new(self.keys).with_auto_generate(self.options.auto_generate_keys);
            match signer.sign_manifest(&mut manifest, &self.options.key_id) {
                Ok(outcome) => attempts = outcome.attempts,
                Err(e) => {
                    tracing::warn!(key_id = %self.options.key_id, error = %e, "auto-sign failed; writing unsigned");
                    sign_error = Some(e);
                }
            }
        }

        Packager::new()
            .with_viewer(self.options.viewer)
            .pack(
                &self.path,
                &manifest,
                steps,
                &self.environment,
                &self.artifacts,
            )?;

        if let Some(journal) = self.log.take_journal() {
            let journal_path = journal.path().to_path_buf();
            if let Err(e) = journal.remove() {
                tracing::warn!(path = %journal_path.display(), error = %e, "failed to remove journal");
            }
        }

        if let Some(source) = sign_error {
            return Err(SessionError::AutoSign {
                path: self.path.clone(),
                source,
            });
        }

        Ok(SessionReport {
            path: self.path.clone(),
            workflow_id: manifest.workflow_id,
            content_digest: manifest.content_digest,
            signature: manifest.signature,
            step_count: manifest.step_count,
            partial,
            attempts,
        })
    }
}

impl<K: KeyStore + ?Sized> Drop for Session<'_, K> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        tracing::warn!(
            path = %self.path.display(),
            steps = self.log.len(),
            "session dropped without close; flushing partial container"
        );
        if let Err(e) = self.finish(true) {
            tracing::warn!(path = %self.path.display(), error = %e, "partial flush failed");
        }
    }
}

/// Packs the journal left beside `path` by an interrupted session.
///
/// The result is an unsigned `partial` container holding every step the
/// journal recorded. Artifacts are not journaled and are not recovered.
pub fn recover(path: impl AsRef<Path>) -> Result<Container> {
    let path = path.as_ref();
    let journal = journal_path(path)?;
    let recovered = Journal::load(&journal).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => SessionError::NoJournal(path.to_path_buf()),
        _ => SessionError::Io(e),
    })?;

    let manifest = ManifestBuilder::new(&recovered.metadata)
        .partial(true)
        .build(&recovered.steps, &recovered.environment)?;
    let container = Packager::new().pack(
        path,
        &manifest,
        &recovered.steps,
        &recovered.environment,
        &Artifacts::new(),
    )?;

    match fs::remove_file(&journal) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            tracing::warn!(path = %journal.display(), error = %e, "failed to remove journal");
        }
        _ => {}
    }
    tracing::info!(
        path = %path.display(),
        steps = recovered.steps.len(),
        "recovered partial container"
    );
    Ok(container)
}
