//! Behavior targets: "parameter X should trend toward value V" at a scope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::versioned::Supersedable;

/// Breadth at which a target applies. Ordered from most to least specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetScope {
    /// One caller; scope target is the caller id.
    Caller,
    /// A named cohort; scope target is the segment id.
    Segment,
    /// Everyone; no scope target.
    System,
}

impl TargetScope {
    /// Resolution order: first match wins.
    pub const PRIORITY: [TargetScope; 3] = [Self::Caller, Self::Segment, Self::System];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Caller => "CALLER",
            Self::Segment => "SEGMENT",
            Self::System => "SYSTEM",
        }
    }

    /// Whether targets at this scope must name a scope target.
    pub fn requires_scope_target(&self) -> bool {
        !matches!(self, Self::System)
    }
}

impl fmt::Display for TargetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CALLER" => Ok(Self::Caller),
            "SEGMENT" => Ok(Self::Segment),
            "SYSTEM" => Ok(Self::System),
            other => Err(Error::Validation(format!("unknown target scope '{other}'"))),
        }
    }
}

/// Who declared a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetSource {
    Seed,
    Learned,
    Manual,
}

impl TargetSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seed => "SEED",
            Self::Learned => "LEARNED",
            Self::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for TargetSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SEED" => Ok(Self::Seed),
            "LEARNED" => Ok(Self::Learned),
            "MANUAL" => Ok(Self::Manual),
            other => Err(Error::Validation(format!("unknown target source '{other}'"))),
        }
    }
}

/// The (parameter, scope, scope target) tuple a supersession chain is keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetKey {
    pub parameter_id: String,
    pub scope: TargetScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_target_id: Option<String>,
}

impl TargetKey {
    /// Build a key, enforcing that SEGMENT/CALLER name a scope target and
    /// SYSTEM does not.
    pub fn new(
        parameter_id: impl Into<String>,
        scope: TargetScope,
        scope_target_id: Option<String>,
    ) -> Result<Self> {
        let parameter_id = parameter_id.into();
        if parameter_id.trim().is_empty() {
            return Err(Error::Validation("parameterId cannot be empty".into()));
        }
        let scope_target_id = scope_target_id.filter(|s| !s.trim().is_empty());
        match (scope.requires_scope_target(), &scope_target_id) {
            (true, None) => Err(Error::Validation(format!(
                "{scope} scope requires a scope target id"
            ))),
            (false, Some(id)) => Err(Error::Validation(format!(
                "SYSTEM scope does not take a scope target id (got '{id}')"
            ))),
            _ => Ok(Self {
                parameter_id,
                scope,
                scope_target_id,
            }),
        }
    }

    pub fn system(parameter_id: impl Into<String>) -> Self {
        Self {
            parameter_id: parameter_id.into(),
            scope: TargetScope::System,
            scope_target_id: None,
        }
    }

    pub fn segment(parameter_id: impl Into<String>, segment_id: impl Into<String>) -> Self {
        Self {
            parameter_id: parameter_id.into(),
            scope: TargetScope::Segment,
            scope_target_id: Some(segment_id.into()),
        }
    }

    pub fn caller(parameter_id: impl Into<String>, caller_id: impl Into<String>) -> Self {
        Self {
            parameter_id: parameter_id.into(),
            scope: TargetScope::Caller,
            scope_target_id: Some(caller_id.into()),
        }
    }

    /// Flattened scope target used as a storage column (`""` for SYSTEM).
    pub fn scope_column(&self) -> &str {
        self.scope_target_id.as_deref().unwrap_or("")
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope_target_id {
            Some(id) => write!(f, "{}@{}:{}", self.parameter_id, self.scope, id),
            None => write!(f, "{}@{}", self.parameter_id, self.scope),
        }
    }
}

/// A stored behavior target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorTarget {
    pub id: String,

    pub parameter_id: String,

    pub scope: TargetScope,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_target_id: Option<String>,

    /// Desired value in [0, 1].
    pub target_value: f64,

    /// Confidence in [0, 1].
    pub confidence: f64,

    pub source: TargetSource,

    pub effective_from: DateTime<Utc>,

    /// `None` while this target is the active one for its tuple.
    #[serde(default)]
    pub effective_until: Option<DateTime<Utc>>,

    #[serde(default)]
    pub superseded_by_id: Option<String>,
}

impl BehaviorTarget {
    pub fn key(&self) -> TargetKey {
        TargetKey {
            parameter_id: self.parameter_id.clone(),
            scope: self.scope,
            scope_target_id: self.scope_target_id.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.effective_until.is_none()
    }
}

impl Supersedable for BehaviorTarget {
    fn version_id(&self) -> &str {
        &self.id
    }

    fn retire(&mut self, at: DateTime<Utc>, successor_id: &str) {
        self.effective_until = Some(at);
        self.superseded_by_id = Some(successor_id.to_string());
    }

    fn superseded_by(&self) -> Option<&str> {
        self.superseded_by_id.as_deref()
    }

    fn is_retired(&self) -> bool {
        self.effective_until.is_some()
    }
}

/// Reject values outside the unit interval (NaN included).
pub fn check_unit_interval(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::Validation(format!("{field} must be within [0, 1], got {value}")))
    }
}

/// Catalog entry describing a behavior parameter, used to phrase targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorParameter {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Phrase for the high end, e.g. "a warm, encouraging tone".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_label: Option<String>,

    /// Phrase for the low end, e.g. "a neutral, matter-of-fact tone".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_label: Option<String>,
}
