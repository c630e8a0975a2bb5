//! Composed prompts: the append-only output of the composition pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PromptStatus {
    /// Every input loaded.
    Complete,
    /// An optional input failed to load; dependent sections were skipped.
    Degraded,
}

impl PromptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "COMPLETE",
            Self::Degraded => "DEGRADED",
        }
    }
}

/// A stored composition. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposedPrompt {
    pub id: String,

    pub caller_id: String,

    /// The call this composition was made for, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_call_id: Option<String>,

    /// Operator-readable rendering.
    pub prompt_text: String,

    /// Speech-friendly rendering.
    pub voice_text: String,

    /// Structured prompt both renderings were derived from.
    pub llm_prompt: Value,

    /// Activation decisions, load errors and timings.
    pub metadata: Value,

    /// Fingerprint of the loaded inputs; equal fingerprints compose equally.
    pub inputs_hash: String,

    pub status: PromptStatus,

    pub composed_at: DateTime<Utc>,
}
