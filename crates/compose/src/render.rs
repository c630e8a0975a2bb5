//! Render step.
//!
//! [`LlmPrompt`] is the structured result handed to the model. The summary
//! and voice renderings are pure functions of it, so they can differ in
//! phrasing and length but never in facts.

use crate::activation::SectionName;
use crate::sections::SectionPayload;
use serde::{Deserialize, Serialize};

/// Longest list the voice rendering reads out per section.
pub const VOICE_MAX_ITEMS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmPrompt {
    pub caller_id: String,
    /// Activated sections in render order.
    pub sections: Vec<SectionPayload>,
}

impl LlmPrompt {
    pub fn section(&self, name: SectionName) -> Option<&SectionPayload> {
        self.sections.iter().find(|s| s.name() == name)
    }
}

/// Operator-readable rendering: one `[Header]` block per section.
pub fn render_summary(prompt: &LlmPrompt) -> String {
    let blocks: Vec<String> = prompt
        .sections
        .iter()
        .map(|section| {
            let mut block = format!("[{}]\n", section.name().heading());
            for line in summary_lines(section) {
                block.push_str(&line);
                block.push('\n');
            }
            block
        })
        .collect();
    blocks.join("\n")
}

fn summary_lines(section: &SectionPayload) -> Vec<String> {
    let mut lines = Vec::new();
    match section {
        SectionPayload::Identity {
            role_statement,
            spec,
            archetype,
        } => {
            lines.push(role_statement.clone());
            match archetype {
                Some(base) => lines.push(format!("(spec: {spec}, layered on {base})")),
                None => lines.push(format!("(spec: {spec})")),
            }
        }
        SectionPayload::VoiceStyle {
            tone,
            pace,
            guidance,
            style_guidelines,
        } => {
            if let Some(tone) = tone {
                lines.push(format!("Tone: {tone}"));
            }
            if let Some(pace) = pace {
                lines.push(format!("Pace: {pace}"));
            }
            lines.extend(guidance.iter().chain(style_guidelines).map(|g| format!("- {g}")));
        }
        SectionPayload::BehaviorTargets { instructions } => {
            lines.extend(instructions.iter().map(|i| {
                format!(
                    "- {} ({} = {:.2}, {} scope, confidence {:.2})",
                    i.text, i.parameter_id, i.value, i.scope, i.confidence
                )
            }));
        }
        SectionPayload::LearnerProfile {
            traits,
            attributes,
            calls_used,
        } => {
            lines.extend(traits.iter().map(|t| format!("- {}: {:.2}", t.label, t.value)));
            lines.extend(
                attributes
                    .iter()
                    .map(|a| format!("- {}: {} ({})", a.key, a.value, a.scope)),
            );
            lines.push(format!("Calls so far: {calls_used}"));
        }
        SectionPayload::Curriculum {
            spec,
            current,
            completed,
            total,
            upcoming,
        } => {
            lines.push(format!("Progress: {completed} of {total} modules completed ({spec})"));
            if let Some(module) = current {
                lines.push(format!("Current module: {} ({})", module.title, module.id));
                if !module.objectives.is_empty() {
                    lines.push(format!("  Objectives: {}", module.objectives.join("; ")));
                }
            }
            if !upcoming.is_empty() {
                let titles: Vec<&str> = upcoming.iter().map(|m| m.title.as_str()).collect();
                lines.push(format!("Up next: {}", titles.join(", ")));
            }
        }
        SectionPayload::Memories { facts } => {
            lines.extend(
                facts
                    .iter()
                    .map(|f| format!("- ({}) {}: {}", f.category, f.key, f.value)),
            );
        }
        SectionPayload::SessionFlow { checks } => {
            lines.extend(
                checks
                    .iter()
                    .enumerate()
                    .map(|(i, c)| format!("{}. {}: {}", i + 1, c.name, c.instruction)),
            );
        }
        SectionPayload::Boundaries { rules } => {
            lines.extend(rules.iter().map(|r| format!("- {r}")));
        }
    }
    lines
}

/// Speech-friendly rendering: plain sentences, no headers or bullets, and
/// at most [`VOICE_MAX_ITEMS`] items per list.
pub fn render_voice(prompt: &LlmPrompt) -> String {
    prompt
        .sections
        .iter()
        .filter_map(voice_sentence)
        .collect::<Vec<_>>()
        .join("\n")
}

fn voice_sentence(section: &SectionPayload) -> Option<String> {
    let text = match section {
        SectionPayload::Identity { role_statement, .. } => role_statement.clone(),
        SectionPayload::VoiceStyle {
            tone,
            pace,
            guidance,
            style_guidelines,
        } => {
            let mut parts = Vec::new();
            match (tone, pace) {
                (Some(t), Some(p)) => parts.push(format!("Speak in a {t} tone at a {p} pace.")),
                (Some(t), None) => parts.push(format!("Speak in a {t} tone.")),
                (None, Some(p)) => parts.push(format!("Keep a {p} pace.")),
                (None, None) => {}
            }
            parts.extend(
                guidance
                    .iter()
                    .chain(style_guidelines)
                    .take(VOICE_MAX_ITEMS)
                    .map(|g| sentence(g)),
            );
            parts.join(" ")
        }
        SectionPayload::BehaviorTargets { instructions } => instructions
            .iter()
            .take(VOICE_MAX_ITEMS)
            .map(|i| i.text.clone())
            .collect::<Vec<_>>()
            .join(" "),
        SectionPayload::LearnerProfile {
            traits, attributes, ..
        } => {
            let items: Vec<String> = traits
                .iter()
                .map(|t| format!("{} {:.2}", t.label, t.value))
                .chain(attributes.iter().map(|a| format!("{} {}", a.key, a.value)))
                .take(VOICE_MAX_ITEMS)
                .collect();
            format!("Learner notes: {}.", items.join(", "))
        }
        SectionPayload::Curriculum {
            current, upcoming, ..
        } => match (current, upcoming.first()) {
            (Some(c), Some(n)) => format!("Today's topic is {}. Next up is {}.", c.title, n.title),
            (Some(c), None) => format!("Today's topic is {}.", c.title),
            (None, _) => "The curriculum is complete; review as needed.".into(),
        },
        SectionPayload::Memories { facts } => {
            let items: Vec<String> = facts
                .iter()
                .take(VOICE_MAX_ITEMS)
                .map(|f| format!("{} is {}", f.key, f.value))
                .collect();
            format!("Remember: {}.", items.join("; "))
        }
        SectionPayload::SessionFlow { checks } => {
            let names: Vec<&str> = checks
                .iter()
                .take(VOICE_MAX_ITEMS)
                .map(|c| c.name.as_str())
                .collect();
            format!("Session flow: {}.", names.join(", then "))
        }
        SectionPayload::Boundaries { rules } => rules
            .iter()
            .take(VOICE_MAX_ITEMS)
            .map(|r| sentence(r))
            .collect::<Vec<_>>()
            .join(" "),
    };
    let text = text.trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn sentence(text: &str) -> String {
    let text = text.trim();
    if text.ends_with(['.', '!', '?']) {
        text.to_string()
    } else {
        format!("{text}.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sections::{FactLine, ModuleSummary};

    fn prompt() -> LlmPrompt {
        LlmPrompt {
            caller_id: "c1".into(),
            sections: vec![
                SectionPayload::Identity {
                    role_statement: "You are a patient tutor.".into(),
                    spec: "tutor-math".into(),
                    archetype: Some("tutor-base".into()),
                },
                SectionPayload::Curriculum {
                    spec: "math".into(),
                    current: Some(ModuleSummary {
                        id: "m2".into(),
                        title: "Fractions".into(),
                        objectives: vec!["Add halves".into()],
                    }),
                    completed: 1,
                    total: 4,
                    upcoming: vec![ModuleSummary {
                        id: "m3".into(),
                        title: "Decimals".into(),
                        objectives: vec![],
                    }],
                },
                SectionPayload::Memories {
                    facts: (1..=5)
                        .map(|i| FactLine {
                            category: "fact".into(),
                            key: format!("k{i}"),
                            value: format!("v{i}"),
                        })
                        .collect(),
                },
            ],
        }
    }

    #[test]
    fn summary_has_one_header_per_section() {
        let text = render_summary(&prompt());
        assert!(text.starts_with("[Identity]\nYou are a patient tutor.\n"));
        assert!(text.contains("layered on tutor-base"));
        assert!(text.contains("[Curriculum]\nProgress: 1 of 4 modules completed (math)\n"));
        assert!(text.contains("- (fact) k5: v5"));
        assert_eq!(text.matches('[').count(), 3);
    }

    #[test]
    fn voice_is_shorter_and_capped() {
        let p = prompt();
        let voice = render_voice(&p);
        assert!(!voice.contains('['));
        assert!(voice.contains("Today's topic is Fractions. Next up is Decimals."));
        assert!(voice.contains("k3 is v3"));
        assert!(!voice.contains("k4"));
        assert!(voice.len() < render_summary(&p).len());
    }

    #[test]
    fn renderings_are_pure() {
        let p = prompt();
        assert_eq!(render_summary(&p), render_summary(&p.clone()));
        assert_eq!(render_voice(&p), render_voice(&p.clone()));
    }

    #[test]
    fn sentence_adds_terminal_punctuation_once() {
        assert_eq!(sentence("Be kind"), "Be kind.");
        assert_eq!(sentence("Be kind!"), "Be kind!");
    }
}
