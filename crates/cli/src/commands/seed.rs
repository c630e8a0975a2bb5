//! `promptloom seed`: load a JSON fixture into the store.
//!
//! Targets go through the resolver's write path so that seeding the same
//! tuple twice leaves a proper supersession chain instead of two active
//! rows. Everything else is written as-is.

use super::open_store;
use anyhow::Context;
use promptloom_config::AppConfig;
use promptloom_core::caller::{
    Caller, CallerAttribute, Enrollment, MeasurementScore, MemoryFact, PersonalityProfile,
    Playbook,
};
use promptloom_core::spec::Specification;
use promptloom_core::store::Store;
use promptloom_core::target::BehaviorParameter;
use promptloom_targets::{SetTargetRequest, TargetResolver};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Fixture {
    #[serde(default)]
    pub specs: Vec<Specification>,
    #[serde(default)]
    pub callers: Vec<Caller>,
    #[serde(default)]
    pub playbooks: Vec<Playbook>,
    #[serde(default)]
    pub enrollments: Vec<Enrollment>,
    #[serde(default)]
    pub parameters: Vec<BehaviorParameter>,
    /// Applied in order; a later entry for the same tuple supersedes an
    /// earlier one.
    #[serde(default)]
    pub targets: Vec<SetTargetRequest>,
    #[serde(default)]
    pub profiles: Vec<PersonalityProfile>,
    #[serde(default)]
    pub memory_facts: Vec<MemoryFact>,
    #[serde(default)]
    pub scores: Vec<MeasurementScore>,
    #[serde(default)]
    pub attributes: Vec<CallerAttribute>,
}

/// Record counts written by [`apply`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub specs: usize,
    pub callers: usize,
    pub targets: usize,
    pub other: usize,
}

pub fn parse(json: &str) -> anyhow::Result<Fixture> {
    serde_json::from_str(json).context("fixture is not valid JSON for a seed file")
}

/// Write every record in `fixture` to `store`. Callers are written before
/// targets so CALLER-scope targets can find their caller.
pub async fn apply(
    store: Arc<dyn Store>,
    fixture: Fixture,
    max_write_attempts: u32,
) -> anyhow::Result<SeedReport> {
    let mut report = SeedReport::default();

    for spec in fixture.specs {
        store.put_spec(spec).await?;
        report.specs += 1;
    }
    for caller in fixture.callers {
        store.put_caller(caller).await?;
        report.callers += 1;
    }
    for playbook in fixture.playbooks {
        store.put_playbook(playbook).await?;
        report.other += 1;
    }
    for enrollment in fixture.enrollments {
        store.put_enrollment(enrollment).await?;
        report.other += 1;
    }
    for parameter in fixture.parameters {
        store.put_parameter(parameter).await?;
        report.other += 1;
    }

    let resolver = TargetResolver::from_store(store.clone()).with_max_write_attempts(max_write_attempts);
    for request in fixture.targets {
        let label = format!("{}@{}", request.parameter_id, request.scope.as_str());
        resolver
            .set_target(request)
            .await
            .with_context(|| format!("failed to seed target {label}"))?;
        report.targets += 1;
    }

    for profile in fixture.profiles {
        store.put_profile(profile).await?;
        report.other += 1;
    }
    for fact in fixture.memory_facts {
        store.put_memory_fact(fact).await?;
        report.other += 1;
    }
    for score in fixture.scores {
        store.put_score(score).await?;
        report.other += 1;
    }
    for attribute in fixture.attributes {
        store.upsert_attribute(attribute).await?;
        report.other += 1;
    }

    Ok(report)
}

pub async fn run(config: &AppConfig, file: &Path) -> anyhow::Result<()> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let fixture = parse(&json)?;
    let store = open_store(config).await?;
    let report = apply(store, fixture, config.targets.max_write_attempts).await?;

    info!(
        specs = report.specs,
        callers = report.callers,
        targets = report.targets,
        "Fixture loaded"
    );
    println!(
        "Seeded {} specs, {} callers, {} targets and {} other records into {}",
        report.specs, report.callers, report.targets, report.other, config.database.url
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptloom_compose::{ComposeOptions, Composer};
    use promptloom_store::InMemoryStore;

    const DEMO: &str = include_str!("../../../../demos/tutoring.json");

    #[test]
    fn demo_fixture_parses() {
        let fixture = parse(DEMO).unwrap();
        assert!(!fixture.specs.is_empty());
        assert!(!fixture.callers.is_empty());
        assert!(!fixture.targets.is_empty());
    }

    #[test]
    fn unknown_sections_are_rejected() {
        assert!(parse(r#"{ "widgets": [] }"#).is_err());
    }

    #[tokio::test]
    async fn demo_fixture_composes() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let report = apply(store.clone(), parse(DEMO).unwrap(), 3).await.unwrap();
        assert_eq!(report.callers, 2);

        let composer = Composer::new(store, Default::default());
        let result = composer
            .compose("caller_ada", ComposeOptions::preview())
            .await
            .unwrap();
        assert!(result.summary_text.starts_with("[Identity]\n"));
        assert_eq!(result.metadata.archetype.as_deref(), Some("tutor-base"));
    }

    #[tokio::test]
    async fn caller_targets_need_their_caller() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let fixture = parse(
            r#"{ "targets": [{ "parameterId": "warmth", "scope": "CALLER",
                 "scopeTargetId": "ghost", "value": 0.5, "confidence": 1.0, "source": "SEED" }] }"#,
        )
        .unwrap();
        assert!(apply(store, fixture, 3).await.is_err());
    }
}
