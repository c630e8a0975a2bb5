//! Behavior target resolution for Promptloom.
//!
//! [`TargetResolver`] answers "which target is in force for this parameter
//! and caller" and owns the supersede-then-insert write path.

pub mod resolver;

pub use resolver::{
    ResolvedTarget, SetTargetOutcome, SetTargetRequest, TargetResolution, TargetResolver,
};
