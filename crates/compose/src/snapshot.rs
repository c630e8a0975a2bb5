//! Load step: gather every input one composition needs.
//!
//! Loading runs in three phases. The caller record comes first; then the
//! playbook specs, profile, memories and attributes are fetched
//! concurrently; finally targets and parameter definitions are resolved for
//! every parameter the loaded specs reference. A missing IDENTITY spec
//! aborts the load. Any other failing input is recorded in
//! [`Snapshot::load_errors`] and left empty.

use futures::future::try_join_all;
use promptloom_core::caller::{
    Caller, CallerAttribute, Enrollment, EnrollmentStatus, MemoryFact, PersonalityProfile,
    PlaybookStatus,
};
use promptloom_core::error::{Error, Result};
use promptloom_core::spec::{
    ContentConfig, IdentityConfig, OrchestrateConfig, SpecConfig, SpecRole, SpecScope,
    Specification,
};
use promptloom_core::store::{SpecStore, Store};
use promptloom_core::target::BehaviorParameter;
use promptloom_layering::LayerResolver;
use promptloom_targets::{ResolvedTarget, TargetResolver};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, warn};

/// Names of the optional inputs, as used in `load_errors`.
pub mod input {
    pub const ENROLLMENTS: &str = "enrollments";
    pub const PROFILE: &str = "profile";
    pub const MEMORIES: &str = "memories";
    pub const ATTRIBUTES: &str = "attributes";
    pub const CONTENT: &str = "content";
    pub const ORCHESTRATION: &str = "orchestration";
    pub const TARGETS: &str = "targets";
    pub const PARAMETERS: &str = "parameters";

    /// Load error key for one parameter's target, e.g. `targets.challenge`.
    pub fn target(parameter_id: &str) -> String {
        format!("{TARGETS}.{parameter_id}")
    }

    /// Whether a `load_errors` key belongs to `input`.
    pub fn covers(input: &str, key: &str) -> bool {
        key.strip_prefix(input)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
    }
}

/// A spec resolved for composition, with its archetype chain merged in.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedSpec<T> {
    pub id: String,
    pub slug: String,
    pub version: u32,
    /// Slugs from this spec down to its root archetype.
    pub chain: Vec<String>,
    pub config: T,
}

impl<T> LoadedSpec<T> {
    /// The archetype directly beneath this spec, when it is an overlay.
    pub fn archetype_slug(&self) -> Option<&str> {
        self.chain.get(1).map(String::as_str)
    }
}

/// Everything the later pipeline steps read. Nothing after the load step
/// touches the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub caller: Caller,
    pub identity: LoadedSpec<IdentityConfig>,
    pub content: Option<LoadedSpec<ContentConfig>>,
    pub orchestration: Vec<LoadedSpec<OrchestrateConfig>>,
    /// First active enrollment in a published playbook.
    pub enrollment: Option<Enrollment>,
    pub profile: Option<PersonalityProfile>,
    pub memories: Vec<MemoryFact>,
    pub attributes: Vec<CallerAttribute>,
    pub targets: BTreeMap<String, ResolvedTarget>,
    pub parameters: BTreeMap<String, BehaviorParameter>,
    /// Optional inputs that failed to load, keyed by input name. Target
    /// failures are keyed per parameter.
    pub load_errors: BTreeMap<String, String>,
}

impl Snapshot {
    pub fn is_degraded(&self) -> bool {
        !self.load_errors.is_empty()
    }

    /// SHA-256 over the snapshot's JSON form plus the render settings that
    /// shape output. Equal fingerprints compose to equal prompts.
    ///
    /// Write timestamps and target row ids are left out: rewriting an input
    /// with the same content does not change the fingerprint.
    pub fn fingerprint(&self, upcoming_modules: usize) -> Result<String> {
        let mut view = serde_json::to_value(self)?;
        strip_bookkeeping(&mut view);
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(&view)?);
        hasher.update((upcoming_modules as u64).to_le_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }
}

fn strip_bookkeeping(view: &mut Value) {
    fn drop_field(value: Option<&mut Value>, field: &str) {
        if let Some(Value::Object(map)) = value {
            map.remove(field);
        }
    }
    fn drop_each(values: Option<&mut Value>, field: &str) {
        match values {
            Some(Value::Array(items)) => items.iter_mut().for_each(|v| drop_field(Some(v), field)),
            Some(Value::Object(map)) => map.values_mut().for_each(|v| drop_field(Some(v), field)),
            _ => {}
        }
    }

    drop_field(view.get_mut("caller"), "createdAt");
    drop_field(view.get_mut("profile"), "lastUpdatedAt");
    drop_field(view.get_mut("enrollment"), "enrolledAt");
    drop_each(view.get_mut("memories"), "extractedAt");
    drop_each(view.get_mut("attributes"), "updatedAt");
    drop_each(view.get_mut("targets"), "targetId");
}

struct PlaybookInputs {
    enrollment: Option<Enrollment>,
    specs: Vec<Specification>,
}

pub struct SnapshotLoader {
    store: Arc<dyn Store>,
    targets: TargetResolver,
    layers: LayerResolver,
    memory_fact_limit: usize,
}

impl SnapshotLoader {
    pub fn new(store: Arc<dyn Store>, memory_fact_limit: usize) -> Self {
        let specs: Arc<dyn SpecStore> = store.clone();
        Self {
            targets: TargetResolver::from_store(store.clone()),
            layers: LayerResolver::new(specs),
            store,
            memory_fact_limit: memory_fact_limit.max(1),
        }
    }

    pub async fn load(&self, caller_id: &str) -> Result<Snapshot> {
        let caller = self
            .store
            .get_caller(caller_id)
            .await?
            .ok_or_else(|| Error::not_found("caller", caller_id))?;
        let mut load_errors = BTreeMap::new();

        let (playbooks, profile, memories, attributes) = tokio::join!(
            self.playbook_inputs(&caller.id),
            self.store.get_profile(&caller.id),
            self.store
                .recent_memory_facts(&caller.id, self.memory_fact_limit),
            self.store.attributes(&caller.id),
        );
        let playbooks = optional(&mut load_errors, input::ENROLLMENTS, playbooks).unwrap_or(
            PlaybookInputs {
                enrollment: None,
                specs: Vec::new(),
            },
        );
        let profile = optional(&mut load_errors, input::PROFILE, profile).flatten();
        let memories = optional(&mut load_errors, input::MEMORIES, memories).unwrap_or_default();
        let attributes =
            optional(&mut load_errors, input::ATTRIBUTES, attributes).unwrap_or_default();

        let identity_spec = match first_of_role(&playbooks.specs, SpecRole::Identity) {
            Some(spec) => spec.clone(),
            None => self
                .domain_spec(&caller, SpecRole::Identity)
                .await?
                .ok_or_else(|| Error::DomainNotReady {
                    caller_id: caller.id.clone(),
                    reason: match caller.domain.as_deref() {
                        Some(domain) => {
                            format!("no active IDENTITY specification for domain '{domain}'")
                        }
                        None => "caller has no domain and no enrolled playbook provides an \
                                 IDENTITY specification"
                            .into(),
                    },
                })?,
        };
        let identity = self
            .load_layered(&identity_spec, |c| match c {
                SpecConfig::Identity(cfg) => Some(cfg),
                _ => None,
            })
            .await?;

        let content = self
            .load_content(&caller, &playbooks.specs)
            .await
            .map_err(|e| record(&mut load_errors, input::CONTENT, e))
            .ok()
            .flatten();

        let mut orchestration = Vec::new();
        for spec in playbooks
            .specs
            .iter()
            .filter(|s| s.role == SpecRole::Orchestrate)
        {
            match self
                .load_layered(spec, |c| match c {
                    SpecConfig::Orchestrate(cfg) => Some(cfg),
                    _ => None,
                })
                .await
            {
                Ok(loaded) => orchestration.push(loaded),
                Err(e) => record(&mut load_errors, input::ORCHESTRATION, e),
            }
        }

        let mut referenced: BTreeSet<String> = identity.config.parameters.iter().cloned().collect();
        if let Some(content) = &content {
            referenced.extend(content.config.parameters.iter().cloned());
        }
        for loaded in &orchestration {
            referenced.extend(loaded.config.parameters.iter().cloned());
        }
        for spec in playbooks.specs.iter().filter(|s| {
            matches!(s.role, SpecRole::Measure | SpecRole::Aggregate)
        }) {
            if let Ok(cfg) = spec.typed_config() {
                referenced.extend(cfg.referenced_parameters());
            }
        }
        let referenced: Vec<String> = referenced.into_iter().collect();

        let (targets, parameters) = tokio::join!(
            self.targets.resolve_many(&referenced, &caller),
            self.store.get_parameters(&referenced),
        );
        for (parameter_id, error) in &targets.failed {
            record(&mut load_errors, &input::target(parameter_id), error);
        }
        let targets = targets.resolved;
        let parameters = optional(&mut load_errors, input::PARAMETERS, parameters)
            .unwrap_or_default()
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        debug!(
            caller_id = %caller.id,
            identity = %identity.slug,
            parameters = referenced.len(),
            targets = targets.len(),
            load_errors = load_errors.len(),
            "Loaded composition snapshot"
        );

        Ok(Snapshot {
            caller,
            identity,
            content,
            orchestration,
            enrollment: playbooks.enrollment,
            profile,
            memories,
            attributes,
            targets,
            parameters,
            load_errors,
        })
    }

    /// Active specs of every published playbook the caller is actively
    /// enrolled in, deduplicated, in enrollment then authoring order.
    async fn playbook_inputs(&self, caller_id: &str) -> Result<PlaybookInputs> {
        let enrollments: Vec<Enrollment> = self
            .store
            .enrollments(caller_id)
            .await?
            .into_iter()
            .filter(|e| e.status == EnrollmentStatus::Active)
            .collect();
        let playbooks = try_join_all(
            enrollments
                .iter()
                .map(|e| self.store.get_playbook(&e.playbook_id)),
        )
        .await?;

        let mut inputs = PlaybookInputs {
            enrollment: None,
            specs: Vec::new(),
        };
        let mut seen = HashSet::new();
        for (enrollment, playbook) in enrollments.iter().zip(playbooks) {
            let Some(playbook) = playbook.filter(|p| p.status == PlaybookStatus::Published) else {
                debug!(caller_id, playbook_id = %enrollment.playbook_id, "Ignoring enrollment in unpublished playbook");
                continue;
            };
            if inputs.enrollment.is_none() {
                inputs.enrollment = Some(enrollment.clone());
            }
            for reference in &playbook.spec_ids {
                match self.layers.find_spec(reference).await? {
                    Some(spec) if spec.is_active => {
                        if seen.insert(spec.id.clone()) {
                            inputs.specs.push(spec);
                        }
                    }
                    Some(spec) => {
                        debug!(playbook_id = %playbook.id, spec = %spec.slug, "Skipping inactive playbook spec")
                    }
                    None => {
                        warn!(playbook_id = %playbook.id, reference = %reference, "Playbook references an unknown specification")
                    }
                }
            }
        }
        Ok(inputs)
    }

    /// The active DOMAIN-scoped spec of `role` for the caller's domain.
    async fn domain_spec(&self, caller: &Caller, role: SpecRole) -> Result<Option<Specification>> {
        let Some(domain) = caller.domain.as_deref() else {
            return Ok(None);
        };
        Ok(self
            .store
            .list_specs(Some(role), true)
            .await?
            .into_iter()
            .find(|s| s.scope == SpecScope::Domain && s.domain.as_deref() == Some(domain)))
    }

    async fn load_content(
        &self,
        caller: &Caller,
        playbook_specs: &[Specification],
    ) -> Result<Option<LoadedSpec<ContentConfig>>> {
        let spec = match first_of_role(playbook_specs, SpecRole::Content) {
            Some(spec) => spec.clone(),
            None => match self.domain_spec(caller, SpecRole::Content).await? {
                Some(spec) => spec,
                None => return Ok(None),
            },
        };
        let loaded = self
            .load_layered(&spec, |c| match c {
                SpecConfig::Content(cfg) => Some(cfg),
                _ => None,
            })
            .await?;
        Ok(Some(loaded))
    }

    /// Merge the spec over its archetypes and parse the result for its role.
    async fn load_layered<T>(
        &self,
        spec: &Specification,
        extract: fn(SpecConfig) -> Option<T>,
    ) -> Result<LoadedSpec<T>> {
        let (raw, chain) = if spec.is_overlay() {
            let effective = self.layers.effective_config(spec).await?;
            (effective.config, effective.chain)
        } else {
            (spec.config.clone(), vec![spec.slug.clone()])
        };

        let parsed = SpecConfig::parse(spec.role, &raw).map_err(|reason| {
            Error::Validation(format!(
                "specification '{}' has a malformed config: {reason}",
                spec.slug
            ))
        })?;
        let config = extract(parsed).ok_or_else(|| {
            Error::Internal(format!("specification '{}' parsed as the wrong role", spec.slug))
        })?;

        Ok(LoadedSpec {
            id: spec.id.clone(),
            slug: spec.slug.clone(),
            version: spec.version,
            chain,
            config,
        })
    }
}

fn first_of_role(specs: &[Specification], role: SpecRole) -> Option<&Specification> {
    specs.iter().find(|s| s.role == role)
}

fn record(errors: &mut BTreeMap<String, String>, input: &str, error: impl Display) {
    warn!(input, error = %error, "Optional composition input failed to load");
    let message = error.to_string();
    errors
        .entry(input.to_string())
        .and_modify(|existing| {
            existing.push_str("; ");
            existing.push_str(&message);
        })
        .or_insert(message);
}

fn optional<T, E: Display>(
    errors: &mut BTreeMap<String, String>,
    input: &str,
    result: std::result::Result<T, E>,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            record(errors, input, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seeded_store, spec};
    use promptloom_core::caller::{AttributeValue, Playbook, SegmentMembership};
    use promptloom_core::store::{CallerStore, SpecStore};
    use promptloom_core::target::{TargetScope, TargetSource};
    use promptloom_store::InMemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn loads_playbook_specs_and_targets() {
        let store = seeded_store().await;
        let loader = SnapshotLoader::new(store, 20);
        let snapshot = loader.load("caller_1").await.unwrap();

        assert_eq!(snapshot.identity.slug, "tutor-math");
        assert_eq!(snapshot.identity.archetype_slug(), Some("tutor-base"));
        // merged from the archetype
        assert_eq!(snapshot.identity.config.boundaries, vec!["Never give homework answers outright."]);
        assert_eq!(snapshot.content.as_ref().unwrap().slug, "math-curriculum");
        assert_eq!(snapshot.orchestration.len(), 1);
        assert!(snapshot.targets.contains_key("warmth"));
        assert!(snapshot.parameters.contains_key("warmth"));
        assert!(snapshot.load_errors.is_empty());
    }

    #[tokio::test]
    async fn falls_back_to_domain_identity_without_enrollment() {
        let store = Arc::new(InMemoryStore::new());
        store
            .put_caller(Caller {
                id: "c".into(),
                name: "C".into(),
                domain: Some("history".into()),
                segments: vec![],
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        let mut identity = spec(
            "id_hist",
            "tutor-history",
            SpecRole::Identity,
            json!({ "roleStatement": "You tutor history." }),
        );
        identity.domain = Some("history".into());
        store.put_spec(identity).await.unwrap();

        let snapshot = SnapshotLoader::new(store, 5).load("c").await.unwrap();
        assert_eq!(snapshot.identity.slug, "tutor-history");
        assert!(snapshot.content.is_none());
        assert!(snapshot.enrollment.is_none());
    }

    #[tokio::test]
    async fn missing_identity_is_domain_not_ready() {
        let store = Arc::new(InMemoryStore::new());
        store
            .put_caller(Caller {
                id: "c".into(),
                name: String::new(),
                domain: Some("chemistry".into()),
                segments: vec![],
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        let err = SnapshotLoader::new(store, 5).load("c").await.unwrap_err();
        assert!(matches!(err, Error::DomainNotReady { .. }), "{err}");
    }

    #[tokio::test]
    async fn unpublished_playbooks_are_ignored() {
        let store = seeded_store().await;
        let mut playbook = store.get_playbook("pb_math").await.unwrap().unwrap();
        playbook.status = PlaybookStatus::Draft;
        store.put_playbook(playbook).await.unwrap();

        // domain fallback still finds an identity
        let snapshot = SnapshotLoader::new(store, 20).load("caller_1").await.unwrap();
        assert!(snapshot.enrollment.is_none());
        assert!(snapshot.orchestration.is_empty());
    }

    #[tokio::test]
    async fn malformed_content_degrades() {
        let store = seeded_store().await;
        store
            .put_spec(spec(
                "content_bad",
                "broken-curriculum",
                SpecRole::Content,
                json!({ "modules": "not a list" }),
            ))
            .await
            .unwrap();
        store
            .put_playbook(Playbook {
                id: "pb_math".into(),
                name: "Math".into(),
                domain: Some("math".into()),
                status: PlaybookStatus::Published,
                spec_ids: vec!["tutor-math".into(), "broken-curriculum".into()],
            })
            .await
            .unwrap();

        let snapshot = SnapshotLoader::new(store, 20).load("caller_1").await.unwrap();
        assert!(snapshot.content.is_none());
        assert!(snapshot.is_degraded());
        assert!(snapshot.load_errors[input::CONTENT].contains("broken-curriculum"));
    }

    #[tokio::test]
    async fn ambiguous_segment_target_degrades_only_that_parameter() {
        let store = seeded_store().await;
        let mut caller = store.get_caller("caller_1").await.unwrap().unwrap();
        caller.segments = vec![
            SegmentMembership {
                segment_id: "evening".into(),
                is_primary: false,
            },
            SegmentMembership {
                segment_id: "weekend".into(),
                is_primary: false,
            },
        ];
        store.put_caller(caller).await.unwrap();
        TargetResolver::from_store(store.clone())
            .set_target(promptloom_targets::SetTargetRequest {
                parameter_id: "challenge".into(),
                scope: TargetScope::Segment,
                scope_target_id: Some("weekend".into()),
                value: 0.2,
                confidence: 0.5,
                source: TargetSource::Manual,
            })
            .await
            .unwrap();

        let snapshot = SnapshotLoader::new(store, 20).load("caller_1").await.unwrap();
        assert_eq!(snapshot.targets["warmth"].value, 0.8);
        assert_eq!(snapshot.targets["pace"].value, 0.3);
        assert!(!snapshot.targets.contains_key("challenge"));
        let keys: Vec<&str> = snapshot.load_errors.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["targets.challenge"]);
        assert!(snapshot.load_errors["targets.challenge"].contains("conflicting SEGMENT targets"));
    }

    #[test]
    fn load_error_keys_match_their_input() {
        assert!(input::covers(input::TARGETS, "targets"));
        assert!(input::covers(input::TARGETS, "targets.challenge"));
        assert!(!input::covers(input::TARGETS, "targetsx"));
        assert!(!input::covers(input::MEMORIES, "targets.memories"));
    }

    #[tokio::test]
    async fn fingerprint_tracks_inputs() {
        let store = seeded_store().await;
        let loader = SnapshotLoader::new(store.clone(), 20);
        let a = loader.load("caller_1").await.unwrap().fingerprint(3).unwrap();
        let b = loader.load("caller_1").await.unwrap().fingerprint(3).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let c = loader.load("caller_1").await.unwrap().fingerprint(1).unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn rewriting_same_attribute_keeps_fingerprint() {
        let store = seeded_store().await;
        let loader = SnapshotLoader::new(store.clone(), 20);
        let before = loader.load("caller_1").await.unwrap();

        let mut attribute = before.attributes[0].clone();
        attribute.updated_at = chrono::Utc::now();
        store.upsert_attribute(attribute.clone()).await.unwrap();
        let rewritten = loader.load("caller_1").await.unwrap();
        assert_ne!(rewritten.attributes[0].updated_at, before.attributes[0].updated_at);
        assert_eq!(rewritten.fingerprint(3).unwrap(), before.fingerprint(3).unwrap());

        attribute.value = AttributeValue::Number(0.1);
        store.upsert_attribute(attribute).await.unwrap();
        let changed = loader.load("caller_1").await.unwrap();
        assert_ne!(changed.fingerprint(3).unwrap(), before.fingerprint(3).unwrap());
    }

    #[tokio::test]
    async fn resetting_same_target_value_keeps_fingerprint() {
        let store = seeded_store().await;
        let loader = SnapshotLoader::new(store.clone(), 20);
        let before = loader.load("caller_1").await.unwrap();

        TargetResolver::from_store(store.clone())
            .set_target(promptloom_targets::SetTargetRequest {
                parameter_id: "pace".into(),
                scope: TargetScope::System,
                scope_target_id: None,
                value: 0.3,
                confidence: 0.9,
                source: TargetSource::Seed,
            })
            .await
            .unwrap();
        let after = loader.load("caller_1").await.unwrap();
        assert_ne!(after.targets["pace"].target_id, before.targets["pace"].target_id);
        assert_eq!(after.fingerprint(3).unwrap(), before.fingerprint(3).unwrap());
    }
}
