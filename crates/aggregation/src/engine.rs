//! Aggregation Engine.
//!
//! Runs every active AGGREGATE specification's rules for one caller. Rules
//! are evaluated concurrently against a snapshot of recent scores and never
//! see each other's output; attribute writes happen afterwards, in spec-slug
//! then rule order, so a key produced by two rules ends with the later one.

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use promptloom_config::AggregationConfig;
use promptloom_core::caller::{AttributeValue, CallerAttribute};
use promptloom_core::error::{Error, Result};
use promptloom_core::spec::{AggregationRule, RuleDefinition, SpecConfig, SpecRole};
use promptloom_core::store::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::operator::{self, SourceScores};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Not enough recent scores; nothing was written.
    Skipped,
    /// The rule (or its spec) could not be evaluated or written.
    Failed,
}

/// One entry of the run's error/skip list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleIssue {
    pub spec_slug: String,
    /// The rule's output key, or `rule[i]` when it has none.
    pub rule: String,
    pub kind: IssueKind,
    pub reason: String,
}

/// `runAggregation` output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationReport {
    pub specs_run: usize,
    pub attributes_updated: usize,
    pub errors: Vec<RuleIssue>,
}

struct Evaluation<'a> {
    spec_slug: &'a str,
    rule: &'a AggregationRule,
    outcome: std::result::Result<AttributeValue, RuleIssue>,
}

pub struct AggregationEngine {
    store: Arc<dyn Store>,
    config: AggregationConfig,
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn Store>, config: AggregationConfig) -> Self {
        Self { store, config }
    }

    /// `runAggregation(callerId)`.
    pub async fn run_aggregation(&self, caller_id: &str) -> Result<AggregationReport> {
        self.run_aggregation_at(caller_id, Utc::now()).await
    }

    /// Run with an explicit "now", which anchors the lookback window.
    pub async fn run_aggregation_at(
        &self,
        caller_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AggregationReport> {
        if self.store.get_caller(caller_id).await?.is_none() {
            return Err(Error::not_found("caller", caller_id));
        }

        let specs = self
            .store
            .list_specs(Some(SpecRole::Aggregate), true)
            .await?;
        let mut report = AggregationReport::default();

        let mut parsed = Vec::new();
        for spec in &specs {
            match spec.typed_config() {
                Ok(SpecConfig::Aggregate(cfg)) => parsed.push((spec.slug.as_str(), cfg)),
                Ok(_) => {}
                Err(e) => {
                    warn!(spec = %spec.slug, "Skipping AGGREGATE spec with malformed config: {e}");
                    report.errors.push(RuleIssue {
                        spec_slug: spec.slug.clone(),
                        rule: "*".into(),
                        kind: IssueKind::Failed,
                        reason: e.to_string(),
                    });
                }
            }
        }
        report.specs_run = parsed.len();

        let since = now - Duration::days(i64::from(self.config.lookback_days));
        let mut pending = Vec::new();
        for (slug, cfg) in &parsed {
            for definition in &cfg.rules {
                match definition {
                    RuleDefinition::Valid(rule) => {
                        pending.push(self.evaluate(caller_id, slug, rule, since));
                    }
                    RuleDefinition::Malformed { label, reason, .. } => {
                        report.errors.push(RuleIssue {
                            spec_slug: (*slug).to_string(),
                            rule: label.clone(),
                            kind: IssueKind::Failed,
                            reason: reason.clone(),
                        });
                    }
                }
            }
        }

        for evaluation in join_all(pending).await {
            let value = match evaluation.outcome {
                Ok(value) => value,
                Err(issue) => {
                    debug!(caller_id, rule = %issue.rule, "Rule not applied: {}", issue.reason);
                    report.errors.push(issue);
                    continue;
                }
            };

            let attribute = CallerAttribute {
                caller_id: caller_id.to_string(),
                key: evaluation.rule.output_key.clone(),
                scope: evaluation.rule.attribute_scope.clone(),
                value,
                source_spec: evaluation.spec_slug.to_string(),
                updated_at: now,
            };
            match self.store.upsert_attribute(attribute).await {
                Ok(()) => report.attributes_updated += 1,
                Err(e) => report.errors.push(RuleIssue {
                    spec_slug: evaluation.spec_slug.to_string(),
                    rule: evaluation.rule.output_key.clone(),
                    kind: IssueKind::Failed,
                    reason: format!("attribute write failed: {e}"),
                }),
            }
        }

        info!(
            caller_id,
            specs_run = report.specs_run,
            attributes_updated = report.attributes_updated,
            issues = report.errors.len(),
            "Aggregation complete"
        );
        Ok(report)
    }

    async fn evaluate<'a>(
        &self,
        caller_id: &str,
        spec_slug: &'a str,
        rule: &'a AggregationRule,
        since: DateTime<Utc>,
    ) -> Evaluation<'a> {
        let issue = |kind, reason: String| RuleIssue {
            spec_slug: spec_slug.to_string(),
            rule: rule.output_key.clone(),
            kind,
            reason,
        };
        let min_scores = rule.min_scores.unwrap_or(self.config.min_scores).max(1);

        let mut sources = Vec::with_capacity(rule.sources.len());
        for source in &rule.sources {
            let scores = match self
                .store
                .recent_scores(
                    caller_id,
                    &source.parameter_id,
                    since,
                    self.config.max_scores_per_parameter,
                )
                .await
            {
                Ok(scores) => scores,
                Err(e) => {
                    return Evaluation {
                        spec_slug,
                        rule,
                        outcome: Err(issue(
                            IssueKind::Failed,
                            format!("reading scores for '{}': {e}", source.parameter_id),
                        )),
                    };
                }
            };

            if scores.len() < min_scores {
                return Evaluation {
                    spec_slug,
                    rule,
                    outcome: Err(issue(
                        IssueKind::Skipped,
                        format!(
                            "insufficient data: '{}' has {} recent score(s), {} required",
                            source.parameter_id,
                            scores.len(),
                            min_scores
                        ),
                    )),
                };
            }

            sources.push(SourceScores {
                parameter_id: source.parameter_id.clone(),
                weight: source.weight,
                scores: scores.into_iter().map(|s| s.score).collect(),
            });
        }

        let outcome = operator::apply(rule, &sources).map_err(|reason| issue(IssueKind::Failed, reason));
        Evaluation {
            spec_slug,
            rule,
            outcome,
        }
    }
}
