//! Step Log: the append-only record of a live session.
//!
//! Indices are assigned at append time and only after everything that can
//! fail has succeeded, so a failed append never leaves a gap.

mod journal;

use std::io;

use jiff::Timestamp;
use serde::Serialize;
use serde_json::Value;

use crate::model::{Content, Step};

pub(crate) use journal::{Journal, journal_path};

/// Errors that can occur while appending a step.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("step content is not serializable: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("step content must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("failed to write step to journal: {0}")]
    Io(#[from] io::Error),
}

/// In-order, append-only sequence of steps.
#[derive(Debug, Default)]
pub struct StepLog {
    steps: Vec<Step>,
    journal: Option<Journal>,
}

impl StepLog {
    /// An in-memory log with no journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// A log that streams every append to `journal` before accepting it.
    pub(crate) fn with_journal(journal: Journal) -> Self {
        Self {
            steps: Vec::new(),
            journal: Some(journal),
        }
    }

    /// Appends a step and returns its index.
    ///
    /// `content` must serialize to a JSON object. The timestamp is the
    /// current time, held back to the previous step's if the clock moved
    /// backwards.
    pub fn append(
        &mut self,
        kind: impl Into<String>,
        content: impl Serialize,
    ) -> Result<u64, StepError> {
        let content = to_content(content)?;
        let now = Timestamp::now();
        let timestamp = match self.steps.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        let step = Step {
            index: self.steps.len() as u64,
            kind: kind.into(),
            timestamp,
            content,
        };

        if let Some(journal) = self.journal.as_mut() {
            journal.append(&step)?;
        }
        tracing::debug!(index = step.index, kind = %step.kind, "step appended");

        let index = step.index;
        self.steps.push(step);
        Ok(index)
    }

    /// All steps in append order.
    pub fn snapshot(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Detaches the journal so the caller can remove it once the steps are
    /// safely packaged.
    pub(crate) fn take_journal(&mut self) -> Option<Journal> {
        self.journal.take()
    }
}

fn to_content(content: impl Serialize) -> Result<Content, StepError> {
    match serde_json::to_value(content)? {
        Value::Object(map) => Ok(map),
        Value::Null => Err(StepError::NotAnObject("null")),
        Value::Bool(_) => Err(StepError::NotAnObject("a boolean")),
        Value::Number(_) => Err(StepError::NotAnObject("a number")),
        Value::String(_) => Err(StepError::NotAnObject("a string")),
        Value::Array(_) => Err(StepError::NotAnObject("an array")),
    }
}
