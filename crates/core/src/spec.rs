//! Specifications: versioned behavioral definitions authored elsewhere.
//!
//! A specification carries a loosely-shaped JSON `config` whose meaning
//! depends on its [`SpecRole`]. The raw payload is kept as-is (the layering
//! diff works structurally on it); consumers that need to *interpret* a
//! config go through [`SpecConfig::parse`], which validates the shape for
//! the role and rejects malformed configs at the load boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// What a specification is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpecRole {
    Identity,
    Content,
    Measure,
    Aggregate,
    Orchestrate,
}

impl SpecRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "IDENTITY",
            Self::Content => "CONTENT",
            Self::Measure => "MEASURE",
            Self::Aggregate => "AGGREGATE",
            Self::Orchestrate => "ORCHESTRATE",
        }
    }
}

impl fmt::Display for SpecRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpecRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "IDENTITY" => Ok(Self::Identity),
            "CONTENT" => Ok(Self::Content),
            "MEASURE" => Ok(Self::Measure),
            "AGGREGATE" => Ok(Self::Aggregate),
            "ORCHESTRATE" => Ok(Self::Orchestrate),
            other => Err(Error::Validation(format!("unknown specification role '{other}'"))),
        }
    }
}

/// Breadth at which a specification applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpecScope {
    /// Applies to every domain.
    System,
    /// Applies to callers of one domain.
    Domain,
}

impl SpecScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "SYSTEM",
            Self::Domain => "DOMAIN",
        }
    }
}

impl FromStr for SpecScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SYSTEM" => Ok(Self::System),
            "DOMAIN" => Ok(Self::Domain),
            other => Err(Error::Validation(format!("unknown specification scope '{other}'"))),
        }
    }
}

/// A stored specification record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Specification {
    pub id: String,

    /// Stable human-readable key, unique across specifications.
    pub slug: String,

    #[serde(default)]
    pub name: String,

    pub role: SpecRole,

    pub scope: SpecScope,

    /// Owning domain for DOMAIN-scoped specs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default = "default_true")]
    pub is_active: bool,

    /// Locked specs are read-only for the authoring workflow.
    #[serde(default)]
    pub is_locked: bool,

    /// Reference (id or slug) to the archetype this spec overlays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends_archetype: Option<String>,

    /// Role-dependent payload; see [`SpecConfig`].
    #[serde(default)]
    pub config: Value,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

fn default_version() -> u32 {
    1
}

impl Specification {
    /// Whether this spec declares only deltas against an archetype.
    pub fn is_overlay(&self) -> bool {
        self.extends_archetype
            .as_deref()
            .is_some_and(|r| !r.trim().is_empty())
    }

    /// Interpret the stored config according to this spec's role.
    pub fn typed_config(&self) -> Result<SpecConfig> {
        SpecConfig::parse(self.role, &self.config).map_err(|reason| {
            Error::Validation(format!("specification '{}' has a malformed config: {reason}", self.slug))
        })
    }
}

// ── Role-tagged configs ───────────────────────────────────────────────────

/// A specification config, interpreted for its role.
#[derive(Debug, Clone, PartialEq)]
pub enum SpecConfig {
    Identity(IdentityConfig),
    Content(ContentConfig),
    Measure(MeasureConfig),
    Aggregate(AggregateConfig),
    Orchestrate(OrchestrateConfig),
}

impl SpecConfig {
    /// Parse and validate a raw config for the given role.
    pub fn parse(role: SpecRole, raw: &Value) -> std::result::Result<Self, String> {
        let empty = Value::Object(Default::default());
        let raw = if raw.is_null() { &empty } else { raw };
        if !raw.is_object() {
            return Err("config must be a JSON object".into());
        }

        match role {
            SpecRole::Identity => {
                let cfg: IdentityConfig = from_value(raw)?;
                cfg.validate()?;
                Ok(Self::Identity(cfg))
            }
            SpecRole::Content => {
                let cfg: ContentConfig = from_value(raw)?;
                cfg.validate()?;
                Ok(Self::Content(cfg))
            }
            SpecRole::Measure => Ok(Self::Measure(from_value(raw)?)),
            SpecRole::Aggregate => Ok(Self::Aggregate(AggregateConfig::parse(raw)?)),
            SpecRole::Orchestrate => Ok(Self::Orchestrate(from_value(raw)?)),
        }
    }

    /// Every behavior parameter this config refers to.
    pub fn referenced_parameters(&self) -> BTreeSet<String> {
        match self {
            Self::Identity(c) => c.parameters.iter().cloned().collect(),
            Self::Content(c) => c.parameters.iter().cloned().collect(),
            Self::Measure(c) => c.parameters.iter().map(|p| p.parameter_id.clone()).collect(),
            Self::Aggregate(c) => c
                .valid_rules()
                .flat_map(|r| r.sources.iter().map(|s| s.parameter_id.clone()))
                .collect(),
            Self::Orchestrate(c) => c.parameters.iter().cloned().collect(),
        }
    }
}

fn from_value<T: serde::de::DeserializeOwned>(raw: &Value) -> std::result::Result<T, String> {
    T::deserialize(raw).map_err(|e| e.to_string())
}

/// IDENTITY: who the agent is for this caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityConfig {
    pub role_statement: String,

    #[serde(default)]
    pub style_guidelines: Vec<String>,

    /// Things the agent must or must not do.
    #[serde(default)]
    pub boundaries: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceStyle>,

    #[serde(default)]
    pub parameters: Vec<String>,
}

impl IdentityConfig {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.role_statement.trim().is_empty() {
            return Err("roleStatement cannot be empty".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceStyle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pace: Option<String>,

    #[serde(default)]
    pub guidance: Vec<String>,
}

impl VoiceStyle {
    pub fn is_empty(&self) -> bool {
        self.tone.is_none() && self.pace.is_none() && self.guidance.is_empty()
    }
}

/// CONTENT: the curriculum a caller works through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentConfig {
    #[serde(default)]
    pub modules: Vec<CurriculumModule>,

    #[serde(default)]
    pub parameters: Vec<String>,
}

impl ContentConfig {
    fn validate(&self) -> std::result::Result<(), String> {
        let mut seen = BTreeSet::new();
        for module in &self.modules {
            if module.id.trim().is_empty() {
                return Err("curriculum module id cannot be empty".into());
            }
            if !seen.insert(module.id.as_str()) {
                return Err(format!("duplicate curriculum module id '{}'", module.id));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurriculumModule {
    pub id: String,

    pub title: String,

    #[serde(default)]
    pub objectives: Vec<String>,
}

/// MEASURE: which parameters a scoring pass measures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasureConfig {
    #[serde(default)]
    pub parameters: Vec<MeasuredParameter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasuredParameter {
    pub parameter_id: String,

    #[serde(default)]
    pub description: String,
}

/// ORCHESTRATE: session-flow checks the agent runs through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrateConfig {
    #[serde(default)]
    pub checks: Vec<OrchestrationCheck>,

    #[serde(default)]
    pub parameters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationCheck {
    pub name: String,

    pub instruction: String,
}

// ── Aggregation rules ─────────────────────────────────────────────────────

/// AGGREGATE: rules turning recent scores into caller attributes.
///
/// Rules are parsed one by one so that a single malformed rule does not
/// take the rest of the spec down with it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateConfig {
    pub rules: Vec<RuleDefinition>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleDefinition {
    Valid(AggregationRule),
    Malformed {
        index: usize,
        /// The rule's output key when it could be read, else `rule[index]`.
        label: String,
        reason: String,
    },
}

impl AggregateConfig {
    fn parse(raw: &Value) -> std::result::Result<Self, String> {
        let rules = match raw.get("aggregationRules") {
            None | Some(Value::Null) => return Ok(Self::default()),
            Some(Value::Array(items)) => items,
            Some(_) => return Err("aggregationRules must be an array".into()),
        };

        let rules = rules
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let label = item
                    .get("outputKey")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("rule[{index}]"));
                match from_value::<AggregationRule>(item).and_then(|r| r.validate().map(|_| r)) {
                    Ok(rule) => RuleDefinition::Valid(rule),
                    Err(reason) => RuleDefinition::Malformed {
                        index,
                        label,
                        reason,
                    },
                }
            })
            .collect();

        Ok(Self { rules })
    }

    pub fn valid_rules(&self) -> impl Iterator<Item = &AggregationRule> {
        self.rules.iter().filter_map(|r| match r {
            RuleDefinition::Valid(rule) => Some(rule),
            RuleDefinition::Malformed { .. } => None,
        })
    }
}

/// One aggregation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationRule {
    /// Attribute key written on the caller.
    pub output_key: String,

    pub sources: Vec<RuleSource>,

    #[serde(flatten)]
    pub operator: AggregationOperator,

    /// Per-source minimum number of scores; falls back to the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_scores: Option<usize>,

    #[serde(default = "default_attribute_scope")]
    pub attribute_scope: String,
}

fn default_attribute_scope() -> String {
    "learner-profile".into()
}

impl AggregationRule {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.output_key.trim().is_empty() {
            return Err("outputKey cannot be empty".into());
        }
        if self.sources.is_empty() {
            return Err("at least one source parameter is required".into());
        }
        for source in &self.sources {
            if source.parameter_id.trim().is_empty() {
                return Err("source parameterId cannot be empty".into());
            }
            if !source.weight.is_finite() || source.weight < 0.0 {
                return Err(format!(
                    "weight for '{}' must be a finite non-negative number",
                    source.parameter_id
                ));
            }
        }
        match &self.operator {
            AggregationOperator::WeightedMean => {
                let total: f64 = self.sources.iter().map(|s| s.weight).sum();
                if total <= 0.0 {
                    return Err("weighted_mean needs a positive total weight".into());
                }
            }
            AggregationOperator::Threshold { threshold, .. } if !threshold.is_finite() => {
                return Err("threshold must be a finite number".into());
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSource {
    pub parameter_id: String,

    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

/// How source scores collapse into one value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operator", rename_all = "snake_case")]
pub enum AggregationOperator {
    Mean,
    WeightedMean,
    /// Mean compared against `threshold`. With labels the attribute is the
    /// matching label, otherwise a boolean.
    Threshold {
        threshold: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        above: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        below: Option<String>,
    },
}

impl AggregationOperator {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::WeightedMean => "weighted_mean",
            Self::Threshold { .. } => "threshold",
        }
    }
}
