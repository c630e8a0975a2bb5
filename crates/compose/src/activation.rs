//! Section activation rules.
//!
//! Every prompt section carries one declarative [`Condition`] over counts
//! taken from the loaded snapshot. Evaluating the rules yields, per section,
//! whether it is included and a readable reason. The reasons are returned
//! to callers as composition metadata.

use crate::snapshot::{Snapshot, input};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ── Sections ──────────────────────────────────────────────────────────────

/// Prompt sections, declared in render order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionName {
    Identity,
    VoiceStyle,
    BehaviorTargets,
    LearnerProfile,
    Curriculum,
    Memories,
    SessionFlow,
    Boundaries,
}

impl SectionName {
    pub const ORDER: [SectionName; 8] = [
        Self::Identity,
        Self::VoiceStyle,
        Self::BehaviorTargets,
        Self::LearnerProfile,
        Self::Curriculum,
        Self::Memories,
        Self::SessionFlow,
        Self::Boundaries,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::VoiceStyle => "voice_style",
            Self::BehaviorTargets => "behavior_targets",
            Self::LearnerProfile => "learner_profile",
            Self::Curriculum => "curriculum",
            Self::Memories => "memories",
            Self::SessionFlow => "session_flow",
            Self::Boundaries => "boundaries",
        }
    }

    /// Header used by the summary rendering.
    pub fn heading(&self) -> &'static str {
        match self {
            Self::Identity => "Identity",
            Self::VoiceStyle => "Voice & Style",
            Self::BehaviorTargets => "Behavior Targets",
            Self::LearnerProfile => "Learner Profile",
            Self::Curriculum => "Curriculum",
            Self::Memories => "Memories",
            Self::SessionFlow => "Session Flow",
            Self::Boundaries => "Boundaries",
        }
    }
}

impl fmt::Display for SectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Signals ───────────────────────────────────────────────────────────────

/// A countable fact about the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Signal {
    VoiceFields,
    StyleGuidelines,
    ResolvedTargets,
    ProfileValues,
    Attributes,
    CurriculumModules,
    MemoryFacts,
    OrchestrationChecks,
    Boundaries,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VoiceFields => "voice_fields",
            Self::StyleGuidelines => "style_guidelines",
            Self::ResolvedTargets => "resolved_targets",
            Self::ProfileValues => "profile_values",
            Self::Attributes => "attributes",
            Self::CurriculumModules => "curriculum_modules",
            Self::MemoryFacts => "memory_facts",
            Self::OrchestrationChecks => "orchestration_checks",
            Self::Boundaries => "boundaries",
        }
    }
}

/// Signal counts for one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Facts {
    counts: BTreeMap<Signal, usize>,
}

impl Facts {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let identity = &snapshot.identity.config;
        let voice_fields = identity.voice.as_ref().map_or(0, |v| {
            usize::from(v.tone.is_some()) + usize::from(v.pace.is_some()) + v.guidance.len()
        });
        let profile_values = snapshot
            .profile
            .as_ref()
            .map_or(0, |p| p.parameter_values.len());
        let modules = snapshot
            .content
            .as_ref()
            .map_or(0, |c| c.config.modules.len());
        let checks = snapshot
            .orchestration
            .iter()
            .map(|o| o.config.checks.len())
            .sum();

        Self::default()
            .with(Signal::VoiceFields, voice_fields)
            .with(Signal::StyleGuidelines, identity.style_guidelines.len())
            .with(Signal::ResolvedTargets, snapshot.targets.len())
            .with(Signal::ProfileValues, profile_values)
            .with(Signal::Attributes, snapshot.attributes.len())
            .with(Signal::CurriculumModules, modules)
            .with(Signal::MemoryFacts, snapshot.memories.len())
            .with(Signal::OrchestrationChecks, checks)
            .with(Signal::Boundaries, identity.boundaries.len())
    }

    pub fn with(mut self, signal: Signal, count: usize) -> Self {
        self.counts.insert(signal, count);
        self
    }

    pub fn count(&self, signal: Signal) -> usize {
        self.counts.get(&signal).copied().unwrap_or(0)
    }
}

// ── Conditions ────────────────────────────────────────────────────────────

/// An activation predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Always true.
    Always,
    /// The signal's count reaches the minimum.
    AtLeast(Signal, usize),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn present(signal: Signal) -> Self {
        Self::AtLeast(signal, 1)
    }

    pub fn and(self, other: Condition) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Condition) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    pub fn evaluate(&self, facts: &Facts) -> bool {
        match self {
            Self::Always => true,
            Self::AtLeast(signal, min) => facts.count(*signal) >= *min,
            Self::And(a, b) => a.evaluate(facts) && b.evaluate(facts),
            Self::Or(a, b) => a.evaluate(facts) || b.evaluate(facts),
            Self::Not(inner) => !inner.evaluate(facts),
        }
    }

    /// The condition with the observed counts filled in.
    pub fn explain(&self, facts: &Facts) -> String {
        match self {
            Self::Always => "always included".into(),
            Self::AtLeast(signal, min) => format!(
                "{} = {} (needs >= {min})",
                signal.as_str(),
                facts.count(*signal)
            ),
            Self::And(a, b) => format!("{} and {}", a.explain(facts), b.explain(facts)),
            Self::Or(a, b) => format!("{} or {}", a.explain(facts), b.explain(facts)),
            Self::Not(inner) => format!("not ({})", inner.explain(facts)),
        }
    }
}

// ── Rules ─────────────────────────────────────────────────────────────────

/// When a section is included, and which optional inputs feed it.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionRule {
    pub section: SectionName,
    pub condition: Condition,
    pub inputs: &'static [&'static str],
}

/// The built-in rule table, in render order.
pub fn section_rules() -> Vec<SectionRule> {
    use Signal::*;

    vec![
        SectionRule {
            section: SectionName::Identity,
            condition: Condition::Always,
            inputs: &[],
        },
        SectionRule {
            section: SectionName::VoiceStyle,
            condition: Condition::present(VoiceFields).or(Condition::present(StyleGuidelines)),
            inputs: &[],
        },
        SectionRule {
            section: SectionName::BehaviorTargets,
            condition: Condition::present(ResolvedTargets),
            inputs: &[input::TARGETS],
        },
        SectionRule {
            section: SectionName::LearnerProfile,
            condition: Condition::present(ProfileValues).or(Condition::present(Attributes)),
            inputs: &[input::PROFILE, input::ATTRIBUTES],
        },
        SectionRule {
            section: SectionName::Curriculum,
            condition: Condition::present(CurriculumModules),
            inputs: &[input::CONTENT, input::ENROLLMENTS],
        },
        SectionRule {
            section: SectionName::Memories,
            condition: Condition::present(MemoryFacts),
            inputs: &[input::MEMORIES],
        },
        SectionRule {
            section: SectionName::SessionFlow,
            condition: Condition::present(OrchestrationChecks),
            inputs: &[input::ORCHESTRATION, input::ENROLLMENTS],
        },
        SectionRule {
            section: SectionName::Boundaries,
            condition: Condition::present(Boundaries),
            inputs: &[],
        },
    ]
}

/// One section's activation outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub section: SectionName,
    pub activated: bool,
    pub reason: String,
}

/// Evaluate every rule. A skipped section whose inputs failed to load says
/// so in its reason.
pub fn activate(
    rules: &[SectionRule],
    facts: &Facts,
    load_errors: &BTreeMap<String, String>,
) -> Vec<Decision> {
    rules
        .iter()
        .map(|rule| {
            let activated = rule.condition.evaluate(facts);
            let mut reason = rule.condition.explain(facts);
            if !activated {
                let failed: Vec<&str> = load_errors
                    .keys()
                    .filter(|key| rule.inputs.iter().any(|i| input::covers(i, key)))
                    .map(String::as_str)
                    .collect();
                if !failed.is_empty() {
                    reason = format!("{reason}; failed to load: {}", failed.join(", "));
                }
            }
            Decision {
                section: rule.section,
                activated,
                reason,
            }
        })
        .collect()
}
