//! In-memory store, useful for testing and ephemeral sessions.
//!
//! Everything lives behind a single `RwLock`, so a supersede is trivially
//! atomic: the active-target lookup and both writes happen under one write
//! guard.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use promptloom_core::caller::{
    Caller, CallerAttribute, Enrollment, MeasurementScore, MemoryFact, PersonalityProfile, Playbook,
};
use promptloom_core::error::StoreError;
use promptloom_core::prompt::ComposedPrompt;
use promptloom_core::spec::{SpecRole, Specification};
use promptloom_core::store::{CallerStore, PromptStore, SpecStore, Store, TargetStore};
use promptloom_core::target::{BehaviorParameter, BehaviorTarget, TargetKey};
use promptloom_core::versioned::Versioned;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    specs: HashMap<String, Specification>,
    targets: HashMap<TargetKey, Versioned<BehaviorTarget>>,
    parameters: BTreeMap<String, BehaviorParameter>,
    callers: HashMap<String, Caller>,
    profiles: HashMap<String, PersonalityProfile>,
    facts: Vec<MemoryFact>,
    playbooks: HashMap<String, Playbook>,
    enrollments: Vec<Enrollment>,
    scores: Vec<MeasurementScore>,
    attributes: BTreeMap<(String, String), CallerAttribute>,
    /// Insertion order; later entries win ties on `composed_at`.
    prompts: Vec<ComposedPrompt>,
}

/// A store that keeps every table in process memory.
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }
}

#[async_trait]
impl SpecStore for InMemoryStore {
    async fn get_spec(&self, id: &str) -> Result<Option<Specification>, StoreError> {
        Ok(self.tables.read().await.specs.get(id).cloned())
    }

    async fn get_spec_by_slug(&self, slug: &str) -> Result<Option<Specification>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.specs.values().find(|s| s.slug == slug).cloned())
    }

    async fn list_specs(
        &self,
        role: Option<SpecRole>,
        active_only: bool,
    ) -> Result<Vec<Specification>, StoreError> {
        let tables = self.tables.read().await;
        let mut specs: Vec<Specification> = tables
            .specs
            .values()
            .filter(|s| role.is_none_or(|r| s.role == r))
            .filter(|s| !active_only || s.is_active)
            .cloned()
            .collect();
        specs.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(specs)
    }

    async fn put_spec(&self, spec: Specification) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(other) = tables
            .specs
            .values()
            .find(|s| s.slug == spec.slug && s.id != spec.id)
        {
            return Err(StoreError::Storage(format!(
                "slug '{}' already belongs to specification {}",
                spec.slug, other.id
            )));
        }
        tables.specs.insert(spec.id.clone(), spec);
        Ok(())
    }
}

#[async_trait]
impl TargetStore for InMemoryStore {
    async fn active_target(&self, key: &TargetKey) -> Result<Option<BehaviorTarget>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .targets
            .get(key)
            .map(|chain| chain.current())
            .filter(|t| t.is_active())
            .cloned())
    }

    async fn supersede_active(
        &self,
        key: &TargetKey,
        next: BehaviorTarget,
    ) -> Result<Option<String>, StoreError> {
        if next.key() != *key {
            return Err(StoreError::Storage(format!(
                "target {} does not belong to {key}",
                next.id
            )));
        }

        let mut tables = self.tables.write().await;
        match tables.targets.get_mut(key) {
            Some(chain) => {
                let at = next.effective_from;
                let (_, retired) = chain.supersede(next, at);
                Ok(Some(retired.id.clone()))
            }
            None => {
                tables.targets.insert(key.clone(), Versioned::new(next));
                Ok(None)
            }
        }
    }

    async fn target_history(&self, key: &TargetKey) -> Result<Vec<BehaviorTarget>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .targets
            .get(key)
            .map(|chain| chain.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn put_parameter(&self, parameter: BehaviorParameter) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .parameters
            .insert(parameter.id.clone(), parameter);
        Ok(())
    }

    async fn get_parameters(&self, ids: &[String]) -> Result<Vec<BehaviorParameter>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .parameters
            .values()
            .filter(|p| ids.contains(&p.id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CallerStore for InMemoryStore {
    async fn get_caller(&self, id: &str) -> Result<Option<Caller>, StoreError> {
        Ok(self.tables.read().await.callers.get(id).cloned())
    }

    async fn put_caller(&self, caller: Caller) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .callers
            .insert(caller.id.clone(), caller);
        Ok(())
    }

    async fn get_profile(&self, caller_id: &str) -> Result<Option<PersonalityProfile>, StoreError> {
        Ok(self.tables.read().await.profiles.get(caller_id).cloned())
    }

    async fn put_profile(&self, profile: PersonalityProfile) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .profiles
            .insert(profile.caller_id.clone(), profile);
        Ok(())
    }

    async fn recent_memory_facts(
        &self,
        caller_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryFact>, StoreError> {
        let tables = self.tables.read().await;
        let mut facts: Vec<MemoryFact> = tables
            .facts
            .iter()
            .filter(|f| f.caller_id == caller_id)
            .cloned()
            .collect();
        facts.sort_by(|a, b| {
            b.extracted_at
                .cmp(&a.extracted_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        facts.truncate(limit);
        Ok(facts)
    }

    async fn put_memory_fact(&self, fact: MemoryFact) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.facts.retain(|f| f.id != fact.id);
        tables.facts.push(fact);
        Ok(())
    }

    async fn enrollments(&self, caller_id: &str) -> Result<Vec<Enrollment>, StoreError> {
        let tables = self.tables.read().await;
        let mut enrollments: Vec<Enrollment> = tables
            .enrollments
            .iter()
            .filter(|e| e.caller_id == caller_id)
            .cloned()
            .collect();
        enrollments.sort_by(|a, b| {
            a.enrolled_at
                .cmp(&b.enrolled_at)
                .then_with(|| a.playbook_id.cmp(&b.playbook_id))
        });
        Ok(enrollments)
    }

    async fn put_enrollment(&self, enrollment: Enrollment) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.enrollments.retain(|e| {
            !(e.caller_id == enrollment.caller_id && e.playbook_id == enrollment.playbook_id)
        });
        tables.enrollments.push(enrollment);
        Ok(())
    }

    async fn get_playbook(&self, id: &str) -> Result<Option<Playbook>, StoreError> {
        Ok(self.tables.read().await.playbooks.get(id).cloned())
    }

    async fn put_playbook(&self, playbook: Playbook) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .playbooks
            .insert(playbook.id.clone(), playbook);
        Ok(())
    }

    async fn recent_scores(
        &self,
        caller_id: &str,
        parameter_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MeasurementScore>, StoreError> {
        let tables = self.tables.read().await;
        let mut scores: Vec<MeasurementScore> = tables
            .scores
            .iter()
            .filter(|s| s.caller_id == caller_id && s.parameter_id == parameter_id)
            .filter(|s| s.scored_at >= since)
            .cloned()
            .collect();
        scores.sort_by(|a, b| b.scored_at.cmp(&a.scored_at).then_with(|| a.id.cmp(&b.id)));
        scores.truncate(limit);
        Ok(scores)
    }

    async fn put_score(&self, score: MeasurementScore) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.scores.retain(|s| s.id != score.id);
        tables.scores.push(score);
        Ok(())
    }

    async fn upsert_attribute(&self, attribute: CallerAttribute) -> Result<(), StoreError> {
        let key = (attribute.caller_id.clone(), attribute.key.clone());
        self.tables.write().await.attributes.insert(key, attribute);
        Ok(())
    }

    async fn attributes(&self, caller_id: &str) -> Result<Vec<CallerAttribute>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .attributes
            .values()
            .filter(|a| a.caller_id == caller_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PromptStore for InMemoryStore {
    async fn insert_prompt(&self, prompt: ComposedPrompt) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.prompts.iter().any(|p| p.id == prompt.id) {
            return Err(StoreError::Storage(format!(
                "composed prompt {} already exists",
                prompt.id
            )));
        }
        tables.prompts.push(prompt);
        Ok(())
    }

    async fn latest_prompt(&self, caller_id: &str) -> Result<Option<ComposedPrompt>, StoreError> {
        Ok(self.list_prompts(caller_id, 1).await?.into_iter().next())
    }

    async fn list_prompts(
        &self,
        caller_id: &str,
        limit: usize,
    ) -> Result<Vec<ComposedPrompt>, StoreError> {
        let tables = self.tables.read().await;
        // Newest insert first, then a stable sort keeps that order among equal timestamps.
        let mut prompts: Vec<ComposedPrompt> = tables
            .prompts
            .iter()
            .rev()
            .filter(|p| p.caller_id == caller_id)
            .cloned()
            .collect();
        prompts.sort_by(|a, b| b.composed_at.cmp(&a.composed_at));
        prompts.truncate(limit);
        Ok(prompts)
    }
}
