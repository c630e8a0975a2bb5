//! Caller-side records: the learner, their cohort memberships, and the
//! read-only inputs (profile, memories, enrollments, scores) that feed
//! aggregation and composition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// A learner interacting with the tutoring agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Caller {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Domain the caller is studying in; selects DOMAIN-scoped specs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default)]
    pub segments: Vec<SegmentMembership>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMembership {
    pub segment_id: String,

    #[serde(default)]
    pub is_primary: bool,
}

/// Per-caller parameter → value map maintained by an external process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonalityProfile {
    pub caller_id: String,

    /// Sorted so that iteration order is stable.
    #[serde(default)]
    pub parameter_values: BTreeMap<String, f64>,

    #[serde(default)]
    pub calls_used: u32,

    #[serde(default = "Utc::now")]
    pub last_updated_at: DateTime<Utc>,
}

/// A fact remembered about a caller from earlier conversations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryFact {
    pub id: String,

    pub caller_id: String,

    /// e.g. "preference", "goal", "context".
    #[serde(default = "default_category")]
    pub category: String,

    pub key: String,

    pub value: String,

    #[serde(default = "default_confidence")]
    pub confidence: f64,

    #[serde(default = "Utc::now")]
    pub extracted_at: DateTime<Utc>,
}

fn default_category() -> String {
    "fact".into()
}

fn default_confidence() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlaybookStatus {
    Draft,
    Published,
    Archived,
}

/// A bundle of specifications published for a domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playbook {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    pub status: PlaybookStatus,

    /// Member specifications (ids or slugs), in authoring order.
    #[serde(default)]
    pub spec_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    Completed,
}

/// A caller's progress through a playbook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub caller_id: String,

    pub playbook_id: String,

    pub status: EnrollmentStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_module_id: Option<String>,

    #[serde(default)]
    pub completed_module_ids: Vec<String>,

    #[serde(default = "Utc::now")]
    pub enrolled_at: DateTime<Utc>,
}

/// One measured score for a caller on a behavior parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementScore {
    pub id: String,

    pub caller_id: String,

    pub parameter_id: String,

    pub score: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,

    #[serde(default = "Utc::now")]
    pub scored_at: DateTime<Utc>,
}

/// A typed derived value attached to a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Json(Value),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n:.2}"),
            Self::Boolean(b) => write!(f, "{}", if *b { "yes" } else { "no" }),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

/// Derived attribute, overwritten in place on each aggregation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerAttribute {
    pub caller_id: String,

    pub key: String,

    /// Grouping tag, e.g. "learner-profile".
    pub scope: String,

    pub value: AttributeValue,

    /// Slug of the AGGREGATE spec whose rule produced the value.
    pub source_spec: String,

    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_value_display() {
        assert_eq!(AttributeValue::Number(0.6666).to_string(), "0.67");
        assert_eq!(AttributeValue::Boolean(true).to_string(), "yes");
        assert_eq!(AttributeValue::String("ready".into()).to_string(), "ready");
    }

    #[test]
    fn attribute_value_round_trips_tagged() {
        let json = serde_json::to_string(&AttributeValue::Number(0.5)).unwrap();
        assert_eq!(json, r#"{"type":"number","value":0.5}"#);
        let back: AttributeValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, AttributeValue::Number(0.5));
    }

    #[test]
    fn caller_defaults_from_minimal_json() {
        let caller: Caller = serde_json::from_str(r#"{ "id": "c1" }"#).unwrap();
        assert!(caller.segments.is_empty());
        assert!(caller.domain.is_none());
    }
}
