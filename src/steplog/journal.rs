//! Write-ahead journal: steps streamed to disk as they are appended.
//!
//! Lives beside the target archive as `<archive>.wal`:
//!
//! ```text
//! {"record":"open","metadata":{..},"environment":{..}}
//! {"record":"step","index":0,"kind":"..","timestamp":"..","content":{..}}
//! ...
//! ```
//!
//! A missing journal means no session is in flight for that path.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::{Environment, SessionMetadata, Step};

/// One line of the journal.
///
/// Tagged so each line is self-describing when read back.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "camelCase")]
enum JournalRecord {
    Open {
        metadata: SessionMetadata,
        environment: Environment,
    },
    Step(Step),
}

/// What a leftover journal holds.
#[derive(Debug)]
pub(crate) struct RecoveredJournal {
    pub metadata: SessionMetadata,
    pub environment: Environment,
    pub steps: Vec<Step>,
}

/// An open journal file.
#[derive(Debug)]
pub(crate) struct Journal {
    path: PathBuf,
    file: File,
}

/// The journal path for an archive: `<archive file name>.wal`, same directory.
///
/// Fails with [`io::ErrorKind::InvalidInput`] when `archive` has no file
/// name (`/`, `..`).
pub(crate) fn journal_path(archive: &Path) -> io::Result<PathBuf> {
    let Some(file_name) = archive.file_name() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("archive path {} has no file name", archive.display()),
        ));
    };
    let mut name = file_name.to_os_string();
    name.push(".wal");
    Ok(archive.with_file_name(name))
}

impl Journal {
    /// Creates a new journal and writes its `open` record.
    ///
    /// Fails with [`io::ErrorKind::AlreadyExists`] if one is already there.
    pub fn create(
        path: impl Into<PathBuf>,
        metadata: &SessionMetadata,
        environment: &Environment,
    ) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        let mut journal = Self { path, file };
        journal.write_record(&JournalRecord::Open {
            metadata: metadata.clone(),
            environment: environment.clone(),
        })?;
        Ok(journal)
    }

    /// Appends a step and syncs it to disk.
    pub fn append(&mut self, step: &Step) -> io::Result<()> {
        self.write_record(&JournalRecord::Step(step.clone()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes and deletes the journal.
    pub fn remove(self) -> io::Result<()> {
        let Self { path, file } = self;
        drop(file);
        match fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Reads a journal left behind by an interrupted session.
    ///
    /// A trailing line that fails to parse is taken to be a write torn by
    /// the interruption and is dropped. Anything else malformed is
    /// [`io::ErrorKind::InvalidData`].
    pub fn load(path: &Path) -> io::Result<RecoveredJournal> {
        let reader = BufReader::new(File::open(path)?);
        let lines: Vec<String> = reader.lines().collect::<io::Result<_>>()?;
        let last = lines.len().saturating_sub(1);

        let mut opened = None;
        let mut steps: Vec<Step> = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            if line.is_empty() {
                continue;
            }
            let record: JournalRecord = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(e) if i == last => {
                    tracing::warn!(path = %path.display(), error = %e, "dropping torn journal line");
                    break;
                }
                Err(e) => return Err(invalid(path, format!("line {}: {e}", i + 1))),
            };
            match record {
                JournalRecord::Open {
                    metadata,
                    environment,
                } if opened.is_none() && i == 0 => opened = Some((metadata, environment)),
                JournalRecord::Open { .. } => {
                    return Err(invalid(path, format!("unexpected open record on line {}", i + 1)));
                }
                JournalRecord::Step(step) => {
                    if opened.is_none() {
                        return Err(invalid(path, "step before open record".into()));
                    }
                    if step.index != steps.len() as u64 {
                        return Err(invalid(
                            path,
                            format!("expected step {}, found {}", steps.len(), step.index),
                        ));
                    }
                    steps.push(step);
                }
            }
        }

        let (metadata, environment) =
            opened.ok_or_else(|| invalid(path, "no open record".into()))?;
        Ok(RecoveredJournal {
            metadata,
            environment,
            steps,
        })
    }

    fn write_record(&mut self, record: &JournalRecord) -> io::Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()
    }
}

fn invalid(path: &Path, detail: String) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("malformed journal {}: {detail}", path.display()),
    )
}
