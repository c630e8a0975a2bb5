//! Archetype/overlay layering for Promptloom.
//!
//! An overlay specification declares only the fields it changes relative to
//! the archetype named by its `extendsArchetype` reference. This crate:
//!
//! - classifies every field as overridden, added or inherited ([`diff`])
//! - resolves archetype references and computes layer diffs ([`LayerResolver`])
//! - merges an overlay chain into the config a consumer actually sees

pub mod diff;
pub mod resolver;

pub use diff::{FieldDiff, FieldValue, OverriddenField, deep_merge, diff_objects};
pub use resolver::{
    EffectiveConfig, LayerDiff, LayerResolver, MAX_ARCHETYPE_DEPTH, base_slug_candidates,
};
