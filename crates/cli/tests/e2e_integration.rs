//! End-to-end tests: every operation driven over one seeded store, run
//! against both the in-memory and the SQLite backend.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use promptloom_aggregation::{AggregationEngine, IssueKind};
use promptloom_compose::{ComposeOptions, Composer, render_summary, render_voice};
use promptloom_config::{AggregationConfig, CompositionConfig};
use promptloom_core::caller::{
    AttributeValue, Caller, Enrollment, EnrollmentStatus, MeasurementScore, MemoryFact, Playbook,
    PlaybookStatus, SegmentMembership,
};
use promptloom_core::error::Error;
use promptloom_core::spec::{SpecRole, SpecScope, Specification};
use promptloom_core::store::Store;
use promptloom_core::target::{TargetKey, TargetScope, TargetSource};
use promptloom_layering::LayerResolver;
use promptloom_targets::{SetTargetRequest, TargetResolver};
use serde_json::{Value, json};

// ── Fixtures ─────────────────────────────────────────────────────────────

async fn stores() -> Vec<Arc<dyn Store>> {
    vec![
        promptloom_store::open(promptloom_store::MEMORY_URL, 1)
            .await
            .unwrap(),
        promptloom_store::open("sqlite::memory:", 1).await.unwrap(),
    ]
}

fn spec(id: &str, slug: &str, role: SpecRole, config: Value) -> Specification {
    Specification {
        id: id.into(),
        slug: slug.into(),
        name: slug.into(),
        role,
        scope: SpecScope::Domain,
        domain: Some("math".into()),
        is_active: true,
        is_locked: false,
        extends_archetype: None,
        config,
        version: 1,
        updated_at: Utc::now(),
    }
}

fn request(
    parameter_id: &str,
    scope: TargetScope,
    scope_target_id: Option<&str>,
    value: f64,
    confidence: f64,
    source: TargetSource,
) -> SetTargetRequest {
    SetTargetRequest {
        parameter_id: parameter_id.into(),
        scope,
        scope_target_id: scope_target_id.map(str::to_string),
        value,
        confidence,
        source,
    }
}

/// One caller in segment "evening" (primary) and "weekend", enrolled in a
/// published math playbook whose identity overlays `tutor-base`.
async fn seed(store: &Arc<dyn Store>) {
    store
        .put_caller(Caller {
            id: "caller_1".into(),
            name: "Ada".into(),
            domain: Some("math".into()),
            segments: vec![
                SegmentMembership {
                    segment_id: "evening".into(),
                    is_primary: true,
                },
                SegmentMembership {
                    segment_id: "weekend".into(),
                    is_primary: false,
                },
            ],
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let mut base = spec(
        "spec_base",
        "tutor-base",
        SpecRole::Identity,
        json!({
            "roleStatement": "You are a patient tutor.",
            "voice": { "tone": "neutral", "pace": "slow" },
            "parameters": ["politeness"]
        }),
    );
    base.scope = SpecScope::System;
    base.domain = None;
    let mut overlay = spec(
        "spec_math",
        "tutor-math",
        SpecRole::Identity,
        json!({ "roleStatement": "You are a patient math tutor.", "voice": { "tone": "warm" } }),
    );
    overlay.extends_archetype = Some("tutor-base".into());
    let content = spec(
        "spec_content",
        "math-curriculum",
        SpecRole::Content,
        json!({
            "modules": [
                { "id": "m1", "title": "Counting" },
                { "id": "m2", "title": "Fractions" },
                { "id": "m3", "title": "Decimals" }
            ]
        }),
    );
    let aggregate = spec(
        "spec_agg",
        "learner-readiness",
        SpecRole::Aggregate,
        json!({
            "aggregationRules": [
                {
                    "outputKey": "readiness",
                    "operator": "weighted_mean",
                    "sources": [
                        { "parameterId": "focus", "weight": 3.0 },
                        { "parameterId": "recall", "weight": 1.0 }
                    ]
                },
                {
                    "outputKey": "persistence",
                    "operator": "mean",
                    "sources": [{ "parameterId": "persistence" }]
                }
            ]
        }),
    );
    for s in [base, overlay, content, aggregate] {
        store.put_spec(s).await.unwrap();
    }

    store
        .put_playbook(Playbook {
            id: "pb_math".into(),
            name: "Math".into(),
            domain: Some("math".into()),
            status: PlaybookStatus::Published,
            spec_ids: vec!["tutor-math".into(), "math-curriculum".into()],
        })
        .await
        .unwrap();
    store
        .put_enrollment(Enrollment {
            caller_id: "caller_1".into(),
            playbook_id: "pb_math".into(),
            status: EnrollmentStatus::Active,
            current_module_id: Some("m2".into()),
            completed_module_ids: vec!["m1".into()],
            enrolled_at: Utc::now(),
        })
        .await
        .unwrap();

    store
        .put_memory_fact(MemoryFact {
            id: "fact_1".into(),
            caller_id: "caller_1".into(),
            category: "preference".into(),
            key: "favorite_topic".into(),
            value: "space".into(),
            confidence: 0.9,
            extracted_at: Utc::now() - Duration::days(1),
        })
        .await
        .unwrap();

    for (id, parameter_id, score, days_ago) in [
        ("s1", "focus", 0.8, 1),
        ("s2", "focus", 0.6, 2),
        ("s3", "recall", 0.3, 1),
    ] {
        store
            .put_score(MeasurementScore {
                id: id.into(),
                caller_id: "caller_1".into(),
                parameter_id: parameter_id.into(),
                score,
                call_id: None,
                scored_at: Utc::now() - Duration::days(days_ago),
            })
            .await
            .unwrap();
    }
}

fn resolver(store: &Arc<dyn Store>) -> TargetResolver {
    TargetResolver::from_store(store.clone())
}

// ── Target Scope Resolver ────────────────────────────────────────────────

#[tokio::test]
async fn caller_target_overrides_system_without_touching_it() {
    for store in stores().await {
        seed(&store).await;
        let targets = resolver(&store);

        targets
            .set_target(request("politeness", TargetScope::System, None, 0.5, 0.9, TargetSource::Seed))
            .await
            .unwrap();
        let resolved = targets
            .resolve_target("politeness", "caller_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.value, 0.5);
        assert_eq!(resolved.scope, TargetScope::System);

        let outcome = targets
            .set_target(request(
                "politeness",
                TargetScope::Caller,
                Some("caller_1"),
                0.8,
                0.9,
                TargetSource::Manual,
            ))
            .await
            .unwrap();
        assert_eq!(outcome.superseded_target_id, None);

        let resolved = targets
            .resolve_target("politeness", "caller_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.value, 0.8);
        assert_eq!(resolved.scope, TargetScope::Caller);

        let system = store
            .active_target(&TargetKey::system("politeness"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(system.target_value, 0.5);
        assert!(system.effective_until.is_none());
    }
}

#[tokio::test]
async fn scope_priority_is_caller_then_segment_then_system() {
    for store in stores().await {
        seed(&store).await;
        let targets = resolver(&store);

        targets
            .set_target(request("pace", TargetScope::System, None, 0.2, 1.0, TargetSource::Seed))
            .await
            .unwrap();
        targets
            .set_target(request("pace", TargetScope::Segment, Some("evening"), 0.4, 1.0, TargetSource::Seed))
            .await
            .unwrap();
        let segment = targets.resolve_target("pace", "caller_1").await.unwrap().unwrap();
        assert_eq!(segment.scope, TargetScope::Segment);
        assert_eq!(segment.scope_target_id.as_deref(), Some("evening"));

        targets
            .set_target(request("pace", TargetScope::Caller, Some("caller_1"), 0.9, 1.0, TargetSource::Manual))
            .await
            .unwrap();
        let caller = targets.resolve_target("pace", "caller_1").await.unwrap().unwrap();
        assert_eq!(caller.scope, TargetScope::Caller);
        assert_eq!(caller.value, 0.9);

        assert!(targets.resolve_target("unknown", "caller_1").await.unwrap().is_none());
    }
}

#[tokio::test]
async fn primary_segment_decides_between_memberships() {
    for store in stores().await {
        seed(&store).await;
        let targets = resolver(&store);

        targets
            .set_target(request("challenge", TargetScope::Segment, Some("weekend"), 0.7, 1.0, TargetSource::Seed))
            .await
            .unwrap();
        let only_weekend = targets.resolve_target("challenge", "caller_1").await.unwrap().unwrap();
        assert_eq!(only_weekend.scope_target_id.as_deref(), Some("weekend"));

        targets
            .set_target(request("challenge", TargetScope::Segment, Some("evening"), 0.3, 1.0, TargetSource::Seed))
            .await
            .unwrap();
        let primary = targets.resolve_target("challenge", "caller_1").await.unwrap().unwrap();
        assert_eq!(primary.scope_target_id.as_deref(), Some("evening"));
        assert_eq!(primary.value, 0.3);
    }
}

#[tokio::test]
async fn repeated_sets_leave_one_active_target_and_a_linear_chain() {
    for store in stores().await {
        seed(&store).await;
        let targets = resolver(&store);
        let key = TargetKey::segment("warmth", "evening");

        let mut ids = Vec::new();
        for value in [0.1, 0.4, 0.6, 0.9] {
            let outcome = targets
                .set_target(request("warmth", TargetScope::Segment, Some("evening"), value, 0.8, TargetSource::Learned))
                .await
                .unwrap();
            assert_eq!(outcome.superseded_target_id, ids.last().cloned());
            ids.push(outcome.new_target_id);

            let history = store.target_history(&key).await.unwrap();
            let active: Vec<_> = history.iter().filter(|t| t.effective_until.is_none()).collect();
            assert_eq!(active.len(), 1);
            assert_eq!(&active[0].id, ids.last().unwrap());
        }

        let chain = targets.target_history(&key).await.unwrap().unwrap();
        chain.verify().unwrap();
        let chain_ids: Vec<&str> = chain.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(chain_ids, ids.iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(chain.current().target_value, 0.9);
    }
}

#[tokio::test]
async fn invalid_targets_are_rejected_before_writing() {
    for store in stores().await {
        seed(&store).await;
        let targets = resolver(&store);

        let out_of_range = targets
            .set_target(request("warmth", TargetScope::System, None, 1.2, 0.5, TargetSource::Manual))
            .await;
        assert!(matches!(out_of_range, Err(Error::Validation(_))));

        let missing_segment = targets
            .set_target(request("warmth", TargetScope::Segment, None, 0.5, 0.5, TargetSource::Manual))
            .await;
        assert!(matches!(missing_segment, Err(Error::Validation(_))));

        assert!(
            store
                .target_history(&TargetKey::system("warmth"))
                .await
                .unwrap()
                .is_empty()
        );
    }
}

// ── Archetype Layering Resolver ──────────────────────────────────────────

#[tokio::test]
async fn overlay_diff_matches_the_worked_example() {
    for store in stores().await {
        let mut base = spec("b", "tutor-base", SpecRole::Identity, json!({ "tone": "neutral", "pace": "slow" }));
        base.scope = SpecScope::System;
        let mut overlay = spec("o", "tutor-warm", SpecRole::Identity, json!({ "tone": "warm" }));
        overlay.extends_archetype = Some("tutor-base".into());
        store.put_spec(base).await.unwrap();
        store.put_spec(overlay).await.unwrap();

        let layers = LayerResolver::new(store.clone());
        let diff = layers.compute_layer_diff("o").await.unwrap();
        let as_json = serde_json::to_value(&diff).unwrap();
        assert_eq!(
            as_json["overridden"],
            json!([{ "field": "tone", "old": "neutral", "new": "warm" }])
        );
        assert_eq!(
            as_json["inheritedUnchanged"],
            json!([{ "field": "pace", "value": "slow" }])
        );
        assert_eq!(as_json["added"], json!([]));

        let again = layers.compute_layer_diff("o").await.unwrap();
        assert_eq!(
            serde_json::to_vec(&diff).unwrap(),
            serde_json::to_vec(&again).unwrap()
        );
    }
}

#[tokio::test]
async fn diff_sets_partition_the_field_set() {
    for store in stores().await {
        seed(&store).await;
        let layers = LayerResolver::new(store.clone());
        let diff = layers.compute_layer_diff("spec_math").await.unwrap();

        let fields: Vec<&str> = diff.fields.fields().collect();
        let unique: BTreeSet<&str> = fields.iter().copied().collect();
        assert_eq!(fields.len(), unique.len());
        assert_eq!(
            unique,
            BTreeSet::from(["parameters", "roleStatement", "voice.pace", "voice.tone"])
        );
    }
}

#[tokio::test]
async fn missing_or_inactive_archetypes_are_not_found() {
    for store in stores().await {
        let mut orphan = spec("orphan", "orphan", SpecRole::Identity, json!({ "tone": "warm" }));
        orphan.extends_archetype = Some("no-such-base".into());
        store.put_spec(orphan).await.unwrap();
        let mut retired = spec("retired", "retired-base", SpecRole::Identity, json!({}));
        retired.is_active = false;
        store.put_spec(retired).await.unwrap();
        let mut child = spec("child", "child", SpecRole::Identity, json!({}));
        child.extends_archetype = Some("retired-base".into());
        store.put_spec(child).await.unwrap();

        let layers = LayerResolver::new(store.clone());
        assert!(matches!(
            layers.compute_layer_diff("orphan").await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            layers.compute_layer_diff("nope").await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            layers.compute_layer_diff("child").await,
            Err(Error::InvalidState { .. })
        ));
    }
}

// ── Aggregation Engine ───────────────────────────────────────────────────

#[tokio::test]
async fn rule_without_scores_is_skipped_and_others_still_write() {
    for store in stores().await {
        seed(&store).await;
        let engine = AggregationEngine::new(store.clone(), AggregationConfig::default());

        let report = engine.run_aggregation("caller_1").await.unwrap();
        assert_eq!(report.specs_run, 1);
        assert_eq!(report.attributes_updated, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].rule, "persistence");
        assert_eq!(report.errors[0].kind, IssueKind::Skipped);

        let attributes = store.attributes("caller_1").await.unwrap();
        assert_eq!(attributes.len(), 1);
        assert_eq!(attributes[0].key, "readiness");
        let AttributeValue::Number(readiness) = attributes[0].value else {
            panic!("readiness should be numeric, got {:?}", attributes[0].value);
        };
        // focus mean 0.7 weighted 3, recall 0.3 weighted 1.
        assert!((readiness - 0.6).abs() < 1e-9);
    }
}

#[tokio::test]
async fn aggregation_is_safe_to_rerun() {
    for store in stores().await {
        seed(&store).await;
        let engine = AggregationEngine::new(store.clone(), AggregationConfig::default());
        let now = Utc::now();

        let first = engine.run_aggregation_at("caller_1", now).await.unwrap();
        let values_after_first: Vec<_> = store
            .attributes("caller_1")
            .await
            .unwrap()
            .into_iter()
            .map(|a| (a.key, a.value))
            .collect();

        let second = engine.run_aggregation_at("caller_1", now).await.unwrap();
        let values_after_second: Vec<_> = store
            .attributes("caller_1")
            .await
            .unwrap()
            .into_iter()
            .map(|a| (a.key, a.value))
            .collect();

        assert_eq!(first, second);
        assert_eq!(values_after_first, values_after_second);
    }
}

// ── Composition Pipeline ─────────────────────────────────────────────────

#[tokio::test]
async fn preview_is_deterministic_and_renderings_derive_from_llm_prompt() {
    for store in stores().await {
        seed(&store).await;
        resolver(&store)
            .set_target(request("politeness", TargetScope::System, None, 0.5, 0.9, TargetSource::Seed))
            .await
            .unwrap();
        let composer = Composer::new(store.clone(), CompositionConfig::default());

        let first = composer.compose("caller_1", ComposeOptions::preview()).await.unwrap();
        let second = composer.compose("caller_1", ComposeOptions::preview()).await.unwrap();

        assert_eq!(
            serde_json::to_vec(&first.llm_prompt).unwrap(),
            serde_json::to_vec(&second.llm_prompt).unwrap()
        );
        assert_eq!(first.summary_text, second.summary_text);
        assert_eq!(first.voice_text, second.voice_text);
        assert_eq!(render_summary(&first.llm_prompt), first.summary_text);
        assert_eq!(render_voice(&first.llm_prompt), first.voice_text);

        assert!(first.prompt_id.is_none());
        assert!(store.latest_prompt("caller_1").await.unwrap().is_none());
        assert_eq!(first.metadata.archetype.as_deref(), Some("tutor-base"));
        assert!(first.summary_text.contains("Fractions"));
        assert!(first.summary_text.contains("favorite_topic"));
    }
}

#[tokio::test]
async fn aggregated_attributes_flow_into_the_prompt() {
    for store in stores().await {
        seed(&store).await;
        let composer = Composer::new(store.clone(), CompositionConfig::default());
        let before = composer.compose("caller_1", ComposeOptions::preview()).await.unwrap();

        AggregationEngine::new(store.clone(), AggregationConfig::default())
            .run_aggregation("caller_1")
            .await
            .unwrap();
        let after = composer.compose("caller_1", ComposeOptions::preview()).await.unwrap();

        assert!(!before.summary_text.contains("readiness"));
        assert!(after.summary_text.contains("readiness"));
        assert_ne!(before.metadata.inputs_hash, after.metadata.inputs_hash);
    }
}

#[tokio::test]
async fn cache_hit_appends_a_record_for_each_call() {
    for store in stores().await {
        seed(&store).await;
        let composer = Composer::new(store.clone(), CompositionConfig::default());
        let call = |id: &str| ComposeOptions {
            trigger_call_id: Some(id.to_string()),
            ..ComposeOptions::persist()
        };

        let stored = composer.compose("caller_1", call("call_A")).await.unwrap();
        let cached = composer.compose("caller_1", call("call_B")).await.unwrap();

        assert!(!stored.metadata.cache_hit);
        assert!(cached.metadata.cache_hit);
        assert!(cached.prompt_id.is_some());
        assert_ne!(cached.prompt_id, stored.prompt_id);
        assert_eq!(cached.llm_prompt, stored.llm_prompt);

        let rows = composer.list_prompts("caller_1", 10).await.unwrap();
        let triggers: Vec<_> = rows.iter().map(|p| p.trigger_call_id.as_deref()).collect();
        assert_eq!(triggers, vec![Some("call_B"), Some("call_A")], "{}", store.name());
        assert_eq!(Some(rows[0].id.clone()), cached.prompt_id);
        assert_eq!(rows[0].prompt_text, stored.summary_text);
        assert_eq!(rows[0].llm_prompt, rows[1].llm_prompt);
        assert_eq!(rows[0].inputs_hash, rows[1].inputs_hash);
    }
}

#[tokio::test]
async fn compose_without_identity_writes_nothing() {
    for store in stores().await {
        store
            .put_caller(Caller {
                id: "caller_2".into(),
                name: "Bo".into(),
                domain: Some("history".into()),
                segments: vec![],
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let composer = Composer::new(store.clone(), CompositionConfig::default());

        let result = composer.compose("caller_2", ComposeOptions::persist()).await;
        assert!(matches!(result, Err(Error::DomainNotReady { .. })));
        assert!(store.latest_prompt("caller_2").await.unwrap().is_none());

        assert!(matches!(
            composer.compose("ghost", ComposeOptions::preview()).await,
            Err(Error::NotFound { .. })
        ));
    }
}
