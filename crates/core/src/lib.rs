//! # Promptloom Core
//!
//! Domain types, storage traits, and error definitions for Promptloom, the
//! specification-resolution and prompt-composition engine behind a tutoring
//! agent. This crate has **no storage or framework dependencies**; it
//! defines the model every other crate implements against.
//!
//! - [`spec`]: specifications and their role-tagged configs
//! - [`target`]: behavior targets, scopes and the parameter catalog
//! - [`versioned`]: append-only supersession chains
//! - [`caller`]: callers, profiles, memories, enrollments, scores, attributes
//! - [`prompt`]: composed prompt records
//! - [`store`]: the storage traits

pub mod caller;
pub mod error;
pub mod prompt;
pub mod spec;
pub mod store;
pub mod target;
pub mod versioned;

// Re-export key types at crate root for ergonomics
pub use caller::{
    AttributeValue, Caller, CallerAttribute, Enrollment, EnrollmentStatus, MeasurementScore,
    MemoryFact, PersonalityProfile, Playbook, PlaybookStatus, SegmentMembership,
};
pub use error::{Error, Result, StoreError};
pub use prompt::{ComposedPrompt, PromptStatus};
pub use spec::{
    AggregateConfig, AggregationOperator, AggregationRule, ContentConfig, CurriculumModule,
    IdentityConfig, MeasureConfig, OrchestrateConfig, OrchestrationCheck, RuleDefinition,
    RuleSource, SpecConfig, SpecRole, SpecScope, Specification, VoiceStyle,
};
pub use store::{CallerStore, PromptStore, SpecStore, Store, TargetStore};
pub use target::{
    BehaviorParameter, BehaviorTarget, TargetKey, TargetScope, TargetSource, check_unit_interval,
};
pub use versioned::{ChainDefect, Supersedable, Versioned};
