//! Storage traits: the relational store as seen by the core.
//!
//! Every subsystem talks to storage through these traits. Implementations
//! live in `promptloom-store` (in-memory for tests, SQLite for real use).
//! Read methods return records in a deterministic order so that callers
//! never have to re-sort for reproducibility.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::caller::{
    Caller, CallerAttribute, Enrollment, MeasurementScore, MemoryFact, PersonalityProfile, Playbook,
};
use crate::error::StoreError;
use crate::prompt::ComposedPrompt;
use crate::spec::{SpecRole, Specification};
use crate::target::{BehaviorParameter, BehaviorTarget, TargetKey};

type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait SpecStore: Send + Sync {
    async fn get_spec(&self, id: &str) -> StoreResult<Option<Specification>>;

    async fn get_spec_by_slug(&self, slug: &str) -> StoreResult<Option<Specification>>;

    /// Specs ordered by slug, optionally filtered by role and active flag.
    async fn list_specs(
        &self,
        role: Option<SpecRole>,
        active_only: bool,
    ) -> StoreResult<Vec<Specification>>;

    /// Insert or replace a specification (authoring / seeding path).
    async fn put_spec(&self, spec: Specification) -> StoreResult<()>;
}

#[async_trait]
pub trait TargetStore: Send + Sync {
    /// The single active target for an exact tuple, if any.
    async fn active_target(&self, key: &TargetKey) -> StoreResult<Option<BehaviorTarget>>;

    /// Atomically retire the tuple's active target (if any) in favour of
    /// `next` and insert `next` as the new active target.
    ///
    /// The active-target lookup happens inside the same transaction as the
    /// writes. Returns the id of the retired target. Fails with
    /// [`StoreError::Conflict`] when a concurrent writer changed the tuple
    /// between the lookup and the writes; nothing is written in that case.
    async fn supersede_active(
        &self,
        key: &TargetKey,
        next: BehaviorTarget,
    ) -> StoreResult<Option<String>>;

    /// Every version for a tuple, oldest first.
    async fn target_history(&self, key: &TargetKey) -> StoreResult<Vec<BehaviorTarget>>;

    async fn put_parameter(&self, parameter: BehaviorParameter) -> StoreResult<()>;

    /// Catalog entries for the given ids, ordered by id. Unknown ids are
    /// simply absent.
    async fn get_parameters(&self, ids: &[String]) -> StoreResult<Vec<BehaviorParameter>>;
}

#[async_trait]
pub trait CallerStore: Send + Sync {
    async fn get_caller(&self, id: &str) -> StoreResult<Option<Caller>>;

    async fn put_caller(&self, caller: Caller) -> StoreResult<()>;

    async fn get_profile(&self, caller_id: &str) -> StoreResult<Option<PersonalityProfile>>;

    async fn put_profile(&self, profile: PersonalityProfile) -> StoreResult<()>;

    /// Newest first, ties broken by id.
    async fn recent_memory_facts(
        &self,
        caller_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<MemoryFact>>;

    async fn put_memory_fact(&self, fact: MemoryFact) -> StoreResult<()>;

    /// Ordered by enrollment time, then playbook id.
    async fn enrollments(&self, caller_id: &str) -> StoreResult<Vec<Enrollment>>;

    async fn put_enrollment(&self, enrollment: Enrollment) -> StoreResult<()>;

    async fn get_playbook(&self, id: &str) -> StoreResult<Option<Playbook>>;

    async fn put_playbook(&self, playbook: Playbook) -> StoreResult<()>;

    /// Scores at or after `since`, newest first, at most `limit`.
    async fn recent_scores(
        &self,
        caller_id: &str,
        parameter_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<MeasurementScore>>;

    async fn put_score(&self, score: MeasurementScore) -> StoreResult<()>;

    /// Insert or overwrite by (caller, key).
    async fn upsert_attribute(&self, attribute: CallerAttribute) -> StoreResult<()>;

    /// Ordered by key.
    async fn attributes(&self, caller_id: &str) -> StoreResult<Vec<CallerAttribute>>;
}

#[async_trait]
pub trait PromptStore: Send + Sync {
    async fn insert_prompt(&self, prompt: ComposedPrompt) -> StoreResult<()>;

    async fn latest_prompt(&self, caller_id: &str) -> StoreResult<Option<ComposedPrompt>>;

    /// Newest first.
    async fn list_prompts(&self, caller_id: &str, limit: usize)
    -> StoreResult<Vec<ComposedPrompt>>;
}

/// A complete backend.
pub trait Store: SpecStore + TargetStore + CallerStore + PromptStore {
    /// The backend name (e.g. "sqlite", "in_memory").
    fn name(&self) -> &str;
}
