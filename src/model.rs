//! Core data model for evidence containers.
//!
//! Steps are what a session records, the environment is where it ran,
//! and the manifest summarizes both for packaging and signing.

mod environment;
mod manifest;
mod step;

pub use environment::Environment;
pub use manifest::{Manifest, SPEC_VERSION, SessionMetadata};
pub use step::{Content, Step};
