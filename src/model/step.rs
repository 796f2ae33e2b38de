//! Step: one recorded event in a session's timeline.

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// Free-form step payload: any JSON object.
///
/// Backed by `serde_json::Map`; key order carries no meaning because
/// the canonical encoding sorts keys.
pub type Content = serde_json::Map<String, serde_json::Value>;

/// A single recorded step, serialized as one line of `steps.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Position in the session, starting at 0 with no gaps.
    pub index: u64,

    /// Short category tag, e.g. `market.analysis` or `llm.request`.
    pub kind: String,

    /// Capture time. Never earlier than the previous step's.
    pub timestamp: Timestamp,

    pub content: Content,
}
