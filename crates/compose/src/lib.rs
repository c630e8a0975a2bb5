//! Composition Pipeline for Promptloom.
//!
//! Assembles one deterministic prompt per caller from resolved targets,
//! layered specifications, the learner profile, memories, attributes and
//! enrollment state.
//!
//! # Steps (always in this order)
//!
//! | Step | Module | Notes |
//! |------|--------|-------|
//! | 1. Load | [`snapshot`] | Concurrent reads; optional inputs may fail |
//! | 2. Activate | [`activation`] | Declarative rule per section, with reasons |
//! | 3. Transform | [`sections`] | Section payloads from the snapshot |
//! | 4. Render | [`render`] | `llmPrompt`, summary and voice renderings |
//!
//! [`Composer`] runs the steps under a timeout and stores the result unless
//! previewing, reusing the latest record when the inputs fingerprint matches.

pub mod activation;
pub mod pipeline;
pub mod render;
pub mod sections;
pub mod snapshot;
pub mod token;

#[cfg(test)]
mod testing;

pub use activation::{Condition, Decision, Facts, SectionName, SectionRule, Signal, section_rules};
pub use pipeline::{
    ComposeMetadata, ComposeOptions, ComposeResult, Composer, Timings, TokenEstimates, assemble,
};
pub use render::{LlmPrompt, VOICE_MAX_ITEMS, render_summary, render_voice};
pub use sections::{Band, SectionPayload, TargetInstruction};
pub use snapshot::{LoadedSpec, Snapshot, SnapshotLoader};
