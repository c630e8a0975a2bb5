//! Transform step: turn the snapshot into per-section payloads.
//!
//! Payloads hold only values taken from stored data, never the time of
//! composition, so the same snapshot always yields the same payloads.

use crate::activation::SectionName;
use crate::snapshot::Snapshot;
use promptloom_core::spec::{CurriculumModule, OrchestrationCheck};
use promptloom_core::target::{BehaviorParameter, TargetScope};
use promptloom_targets::ResolvedTarget;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Target values at or above this read as a strong lean.
pub const STRONG_BAND: f64 = 0.7;
/// Target values below this read as a lean toward the low end.
pub const LOW_BAND: f64 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    Strong,
    Moderate,
    Low,
}

impl Band {
    pub fn for_value(value: f64) -> Self {
        if value >= STRONG_BAND {
            Self::Strong
        } else if value >= LOW_BAND {
            Self::Moderate
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInstruction {
    pub parameter_id: String,
    pub label: String,
    pub value: f64,
    pub confidence: f64,
    pub scope: TargetScope,
    pub band: Band,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileTrait {
    pub parameter_id: String,
    pub label: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeLine {
    pub key: String,
    pub scope: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSummary {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub objectives: Vec<String>,
}

impl From<&CurriculumModule> for ModuleSummary {
    fn from(m: &CurriculumModule) -> Self {
        Self {
            id: m.id.clone(),
            title: m.title.clone(),
            objectives: m.objectives.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactLine {
    pub category: String,
    pub key: String,
    pub value: String,
}

/// One activated section's template variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "section", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SectionPayload {
    Identity {
        role_statement: String,
        spec: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        archetype: Option<String>,
    },
    VoiceStyle {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tone: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pace: Option<String>,
        guidance: Vec<String>,
        style_guidelines: Vec<String>,
    },
    BehaviorTargets {
        instructions: Vec<TargetInstruction>,
    },
    LearnerProfile {
        traits: Vec<ProfileTrait>,
        attributes: Vec<AttributeLine>,
        calls_used: u32,
    },
    Curriculum {
        spec: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current: Option<ModuleSummary>,
        completed: usize,
        total: usize,
        upcoming: Vec<ModuleSummary>,
    },
    Memories {
        facts: Vec<FactLine>,
    },
    SessionFlow {
        checks: Vec<OrchestrationCheck>,
    },
    Boundaries {
        rules: Vec<String>,
    },
}

impl SectionPayload {
    pub fn name(&self) -> SectionName {
        match self {
            Self::Identity { .. } => SectionName::Identity,
            Self::VoiceStyle { .. } => SectionName::VoiceStyle,
            Self::BehaviorTargets { .. } => SectionName::BehaviorTargets,
            Self::LearnerProfile { .. } => SectionName::LearnerProfile,
            Self::Curriculum { .. } => SectionName::Curriculum,
            Self::Memories { .. } => SectionName::Memories,
            Self::SessionFlow { .. } => SectionName::SessionFlow,
            Self::Boundaries { .. } => SectionName::Boundaries,
        }
    }
}

/// Build the payload for one section.
pub fn build_section(section: SectionName, snapshot: &Snapshot, upcoming_modules: usize) -> SectionPayload {
    let identity = &snapshot.identity;
    match section {
        SectionName::Identity => SectionPayload::Identity {
            role_statement: identity.config.role_statement.trim().to_string(),
            spec: identity.slug.clone(),
            archetype: identity.archetype_slug().map(str::to_string),
        },
        SectionName::VoiceStyle => {
            let voice = identity.config.voice.clone().unwrap_or_default();
            SectionPayload::VoiceStyle {
                tone: voice.tone,
                pace: voice.pace,
                guidance: voice.guidance,
                style_guidelines: identity.config.style_guidelines.clone(),
            }
        }
        SectionName::BehaviorTargets => SectionPayload::BehaviorTargets {
            instructions: snapshot
                .targets
                .values()
                .map(|t| target_instruction(t, snapshot.parameters.get(&t.parameter_id)))
                .collect(),
        },
        SectionName::LearnerProfile => learner_profile(snapshot),
        SectionName::Curriculum => curriculum(snapshot, upcoming_modules),
        SectionName::Memories => SectionPayload::Memories {
            facts: snapshot
                .memories
                .iter()
                .map(|f| FactLine {
                    category: f.category.clone(),
                    key: f.key.clone(),
                    value: f.value.clone(),
                })
                .collect(),
        },
        SectionName::SessionFlow => SectionPayload::SessionFlow {
            checks: snapshot
                .orchestration
                .iter()
                .flat_map(|o| o.config.checks.iter().cloned())
                .collect(),
        },
        SectionName::Boundaries => SectionPayload::Boundaries {
            rules: identity.config.boundaries.clone(),
        },
    }
}

fn label_for(parameter_id: &str, parameter: Option<&BehaviorParameter>) -> String {
    parameter
        .map(|p| p.name.trim())
        .filter(|name| !name.is_empty())
        .unwrap_or(parameter_id)
        .to_string()
}

/// Phrase a resolved target as an instruction, e.g. "Lean toward a soothing tone."
pub fn target_instruction(
    target: &ResolvedTarget,
    parameter: Option<&BehaviorParameter>,
) -> TargetInstruction {
    let label = label_for(&target.parameter_id, parameter);
    let high = parameter
        .and_then(|p| p.high_label.clone())
        .unwrap_or_else(|| format!("high {label}"));
    let low = parameter
        .and_then(|p| p.low_label.clone())
        .unwrap_or_else(|| format!("low {label}"));

    let band = Band::for_value(target.value);
    let mut text = match band {
        Band::Strong => format!("Lean strongly toward {high}."),
        Band::Moderate => format!("Balance {high} with {low}."),
        Band::Low => format!("Lean toward {low}."),
    };
    if target.confidence < 0.5 {
        text.push_str(" Treat this as a soft preference.");
    }

    TargetInstruction {
        parameter_id: target.parameter_id.clone(),
        label,
        value: target.value,
        confidence: target.confidence,
        scope: target.scope,
        band,
        text,
    }
}

fn learner_profile(snapshot: &Snapshot) -> SectionPayload {
    let (traits, calls_used) = match &snapshot.profile {
        Some(profile) => (
            profile
                .parameter_values
                .iter()
                .map(|(id, value)| ProfileTrait {
                    parameter_id: id.clone(),
                    label: label_for(id, snapshot.parameters.get(id)),
                    value: *value,
                })
                .collect(),
            profile.calls_used,
        ),
        None => (Vec::new(), 0),
    };
    let attributes = snapshot
        .attributes
        .iter()
        .map(|a| AttributeLine {
            key: a.key.clone(),
            scope: a.scope.clone(),
            value: a.value.to_string(),
        })
        .collect();
    SectionPayload::LearnerProfile {
        traits,
        attributes,
        calls_used,
    }
}

/// Current module is the enrollment's, else the first one not completed.
fn curriculum(snapshot: &Snapshot, upcoming_modules: usize) -> SectionPayload {
    let Some(content) = &snapshot.content else {
        return SectionPayload::Curriculum {
            spec: String::new(),
            current: None,
            completed: 0,
            total: 0,
            upcoming: Vec::new(),
        };
    };
    let modules = &content.config.modules;
    let completed: BTreeSet<&str> = snapshot
        .enrollment
        .iter()
        .flat_map(|e| e.completed_module_ids.iter().map(String::as_str))
        .collect();
    let current_id = snapshot
        .enrollment
        .as_ref()
        .and_then(|e| e.current_module_id.as_deref())
        .filter(|id| modules.iter().any(|m| m.id == *id));

    let current_index = match current_id {
        Some(id) => modules.iter().position(|m| m.id == id),
        None => modules.iter().position(|m| !completed.contains(m.id.as_str())),
    };
    let upcoming = match current_index {
        Some(i) => modules[i + 1..]
            .iter()
            .filter(|m| !completed.contains(m.id.as_str()))
            .take(upcoming_modules)
            .map(ModuleSummary::from)
            .collect(),
        None => Vec::new(),
    };

    SectionPayload::Curriculum {
        spec: content.slug.clone(),
        current: current_index.map(|i| ModuleSummary::from(&modules[i])),
        completed: modules
            .iter()
            .filter(|m| completed.contains(m.id.as_str()))
            .count(),
        total: modules.len(),
        upcoming,
    }
}
