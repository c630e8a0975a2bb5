//! Shared fixtures for this crate's tests.

use crate::snapshot::{Snapshot, SnapshotLoader};
use chrono::{DateTime, TimeZone, Utc};
use promptloom_core::caller::{
    AttributeValue, Caller, CallerAttribute, Enrollment, EnrollmentStatus, MemoryFact,
    PersonalityProfile, Playbook, PlaybookStatus, SegmentMembership,
};
use promptloom_core::spec::{SpecRole, SpecScope, Specification};
use promptloom_core::store::{CallerStore, SpecStore, TargetStore};
use promptloom_core::target::{BehaviorParameter, TargetScope, TargetSource};
use promptloom_store::InMemoryStore;
use promptloom_targets::{SetTargetRequest, TargetResolver};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;

pub fn at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, day, 9, 0, 0).unwrap()
}

/// An active DOMAIN spec for "math".
pub fn spec(id: &str, slug: &str, role: SpecRole, config: Value) -> Specification {
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
        updated_at: at(1),
    }
}

/// caller_1: enrolled in a published math playbook whose identity overlays
/// `tutor-base`, with targets at all three scopes, a profile, memories and
/// one derived attribute.
pub async fn seeded_store() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());

    store
        .put_caller(Caller {
            id: "caller_1".into(),
            name: "Ada".into(),
            domain: Some("math".into()),
            segments: vec![SegmentMembership {
                segment_id: "evening".into(),
                is_primary: true,
            }],
            created_at: at(1),
        })
        .await
        .unwrap();

    let mut base = spec(
        "id_base",
        "tutor-base",
        SpecRole::Identity,
        json!({
            "roleStatement": "You are a patient tutor.",
            "boundaries": ["Never give homework answers outright."],
            "voice": { "tone": "neutral", "pace": "slow" },
            "parameters": ["warmth"]
        }),
    );
    base.scope = SpecScope::System;
    base.domain = None;
    let mut overlay = spec(
        "id_math",
        "tutor-math",
        SpecRole::Identity,
        json!({
            "roleStatement": "You are a patient math tutor.",
            "styleGuidelines": ["Use concrete examples."],
            "voice": { "tone": "warm" },
            "parameters": ["warmth", "pace"]
        }),
    );
    overlay.extends_archetype = Some("tutor-base".into());
    let content = spec(
        "content_math",
        "math-curriculum",
        SpecRole::Content,
        json!({
            "modules": [
                { "id": "m1", "title": "Counting" },
                { "id": "m2", "title": "Fractions", "objectives": ["Compare halves and quarters"] },
                { "id": "m3", "title": "Decimals" },
                { "id": "m4", "title": "Percentages" }
            ],
            "parameters": ["challenge"]
        }),
    );
    let flow = spec(
        "flow_math",
        "session-flow",
        SpecRole::Orchestrate,
        json!({
            "checks": [
                { "name": "warm-up", "instruction": "Open with a quick recap of last session." },
                { "name": "check-understanding", "instruction": "Ask the learner to explain a step back." }
            ]
        }),
    );
    for s in [base, overlay, content, flow] {
        store.put_spec(s).await.unwrap();
    }

    store
        .put_playbook(Playbook {
            id: "pb_math".into(),
            name: "Math".into(),
            domain: Some("math".into()),
            status: PlaybookStatus::Published,
            spec_ids: vec![
                "tutor-math".into(),
                "math-curriculum".into(),
                "session-flow".into(),
            ],
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
            enrolled_at: at(2),
        })
        .await
        .unwrap();

    let resolver = TargetResolver::from_store(store.clone());
    for (parameter_id, scope, scope_target_id, value) in [
        ("warmth", TargetScope::System, None, 0.5),
        ("warmth", TargetScope::Caller, Some("caller_1"), 0.8),
        ("pace", TargetScope::System, None, 0.3),
        ("challenge", TargetScope::Segment, Some("evening"), 0.6),
    ] {
        resolver
            .set_target(SetTargetRequest {
                parameter_id: parameter_id.into(),
                scope,
                scope_target_id: scope_target_id.map(str::to_string),
                value,
                confidence: 0.9,
                source: TargetSource::Seed,
            })
            .await
            .unwrap();
    }
    store
        .put_parameter(BehaviorParameter {
            id: "warmth".into(),
            name: "warmth".into(),
            description: "Emotional warmth of replies".into(),
            high_label: Some("a warm, encouraging tone".into()),
            low_label: Some("a neutral, matter-of-fact tone".into()),
        })
        .await
        .unwrap();

    store
        .put_profile(PersonalityProfile {
            caller_id: "caller_1".into(),
            parameter_values: BTreeMap::from([("focus".into(), 0.72), ("recall".into(), 0.4)]),
            calls_used: 3,
            last_updated_at: at(3),
        })
        .await
        .unwrap();
    for (id, key, value, day) in [
        ("f1", "favorite_topic", "space", 2),
        ("f2", "pet", "a cat named Pixel", 3),
    ] {
        store
            .put_memory_fact(MemoryFact {
                id: id.into(),
                caller_id: "caller_1".into(),
                category: "preference".into(),
                key: key.into(),
                value: value.into(),
                confidence: 0.8,
                extracted_at: at(day),
            })
            .await
            .unwrap();
    }
    store
        .upsert_attribute(CallerAttribute {
            caller_id: "caller_1".into(),
            key: "readiness".into(),
            scope: "learner-profile".into(),
            value: AttributeValue::Number(0.66),
            source_spec: "learner-readiness".into(),
            updated_at: at(3),
        })
        .await
        .unwrap();

    store
}

pub async fn snapshot() -> Snapshot {
    SnapshotLoader::new(seeded_store().await, 20)
        .load("caller_1")
        .await
        .unwrap()
}
