//! The composition pipeline: Load → Activate → Transform → Render, then
//! persist (unless previewing).
//!
//! # Determinism
//!
//! Everything after the load step is a pure function of the [`Snapshot`].
//! No clock, randomness or store access happens in [`assemble`], so equal
//! snapshots yield byte-identical `llmPrompt` objects. Timings and ids live
//! only in the metadata and the stored record.

use crate::activation::{Decision, Facts, SectionName, activate, section_rules};
use crate::render::{LlmPrompt, render_summary, render_voice};
use crate::sections::build_section;
use crate::snapshot::{Snapshot, SnapshotLoader};
use crate::token::estimate_tokens;
use chrono::Utc;
use promptloom_config::CompositionConfig;
use promptloom_core::error::{Error, Result};
use promptloom_core::prompt::{ComposedPrompt, PromptStatus};
use promptloom_core::store::Store;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── Types ─────────────────────────────────────────────────────────────────

/// Per-call options for [`Composer::compose`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposeOptions {
    /// Write a ComposedPrompt record. `false` is preview mode.
    #[serde(default)]
    pub persist: bool,
    #[serde(default)]
    pub trigger_call_id: Option<String>,
    /// Overrides `composition.timeout_ms`.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ComposeOptions {
    pub fn preview() -> Self {
        Self::default()
    }

    pub fn persist() -> Self {
        Self {
            persist: true,
            ..Self::default()
        }
    }
}

/// Step durations in microseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timings {
    pub load_us: u64,
    pub transform_us: u64,
    pub render_us: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenEstimates {
    pub summary: usize,
    pub voice: usize,
}

/// Explainability record stored with every composition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposeMetadata {
    pub sections_activated: Vec<SectionName>,
    pub sections_skipped: Vec<SectionName>,
    pub activation_reasons: BTreeMap<SectionName, String>,
    pub timings: Timings,
    pub load_errors: BTreeMap<String, String>,
    pub inputs_hash: String,
    pub cache_hit: bool,
    pub token_estimates: TokenEstimates,
    pub identity_spec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archetype: Option<String>,
}

/// `compose` output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposeResult {
    /// Id of the stored record; `None` in preview mode.
    pub prompt_id: Option<String>,
    pub status: PromptStatus,
    pub llm_prompt: LlmPrompt,
    pub summary_text: String,
    pub voice_text: String,
    pub metadata: ComposeMetadata,
}

/// Output of the pure part of the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Assembly {
    pub llm_prompt: LlmPrompt,
    pub summary_text: String,
    pub voice_text: String,
    pub decisions: Vec<Decision>,
    pub transform_us: u64,
    pub render_us: u64,
}

// ── Pure steps ────────────────────────────────────────────────────────────

/// Activate, transform and render a snapshot.
pub fn assemble(snapshot: &Snapshot, upcoming_modules: usize) -> Assembly {
    let transform_started = Instant::now();
    let facts = Facts::from_snapshot(snapshot);
    let decisions = activate(&section_rules(), &facts, &snapshot.load_errors);
    let sections = decisions
        .iter()
        .filter(|d| d.activated)
        .map(|d| build_section(d.section, snapshot, upcoming_modules))
        .collect();
    let transform_us = micros(transform_started);

    let render_started = Instant::now();
    let llm_prompt = LlmPrompt {
        caller_id: snapshot.caller.id.clone(),
        sections,
    };
    let summary_text = render_summary(&llm_prompt);
    let voice_text = render_voice(&llm_prompt);
    let render_us = micros(render_started);

    Assembly {
        llm_prompt,
        summary_text,
        voice_text,
        decisions,
        transform_us,
        render_us,
    }
}

fn micros(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_micros()).unwrap_or(u64::MAX)
}

// ── Composer ──────────────────────────────────────────────────────────────

pub struct Composer {
    store: Arc<dyn Store>,
    loader: SnapshotLoader,
    config: CompositionConfig,
}

impl Composer {
    pub fn new(store: Arc<dyn Store>, config: CompositionConfig) -> Self {
        Self {
            loader: SnapshotLoader::new(store.clone(), config.memory_fact_limit),
            store,
            config,
        }
    }

    /// `compose(callerId, { persist })`.
    ///
    /// Load through render runs under the timeout; the write happens after
    /// it, so a timed-out composition never leaves a record behind. Every
    /// persisting call appends one record, including cache hits, which copy
    /// the cached prompt under a fresh id and this call's trigger.
    pub async fn compose(&self, caller_id: &str, options: ComposeOptions) -> Result<ComposeResult> {
        let timeout_ms = options.timeout_ms.unwrap_or(self.config.timeout_ms);
        if timeout_ms == 0 {
            return Err(Error::Validation("timeoutMs must be positive".into()));
        }

        let mut result = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.prepare(caller_id, options.persist),
        )
        .await
        .map_err(|_| {
            warn!(caller_id, timeout_ms, "Composition timed out");
            Error::Timeout {
                operation: format!("compose for caller {caller_id}"),
                timeout_ms,
            }
        })??;

        if !options.persist {
            debug!(caller_id, "Preview composition, not persisted");
            return Ok(result);
        }

        let record = ComposedPrompt {
            id: Uuid::new_v4().to_string(),
            caller_id: caller_id.to_string(),
            trigger_call_id: options.trigger_call_id,
            prompt_text: result.summary_text.clone(),
            voice_text: result.voice_text.clone(),
            llm_prompt: serde_json::to_value(&result.llm_prompt)?,
            metadata: serde_json::to_value(&result.metadata)?,
            inputs_hash: result.metadata.inputs_hash.clone(),
            status: result.status,
            composed_at: Utc::now(),
        };
        let id = record.id.clone();
        self.store.insert_prompt(record).await?;
        info!(
            caller_id,
            prompt_id = %id,
            status = result.status.as_str(),
            sections = result.metadata.sections_activated.len(),
            cache_hit = result.metadata.cache_hit,
            "Composed prompt"
        );
        result.prompt_id = Some(id);
        Ok(result)
    }

    async fn prepare(&self, caller_id: &str, persist: bool) -> Result<ComposeResult> {
        let load_started = Instant::now();
        let snapshot = self.loader.load(caller_id).await?;
        let inputs_hash = snapshot.fingerprint(self.config.upcoming_modules)?;
        let load_us = micros(load_started);

        if persist && self.config.cache_enabled {
            if let Some(cached) = self.cached(caller_id, &inputs_hash, load_us).await? {
                debug!(caller_id, "Reusing cached composition");
                return Ok(cached);
            }
        }

        let assembly = assemble(&snapshot, self.config.upcoming_modules);
        let status = if snapshot.is_degraded() {
            PromptStatus::Degraded
        } else {
            PromptStatus::Complete
        };

        let (activated, skipped): (Vec<&Decision>, Vec<&Decision>) =
            assembly.decisions.iter().partition(|d| d.activated);
        let metadata = ComposeMetadata {
            sections_activated: activated.iter().map(|d| d.section).collect(),
            sections_skipped: skipped.iter().map(|d| d.section).collect(),
            activation_reasons: assembly
                .decisions
                .iter()
                .map(|d| (d.section, d.reason.clone()))
                .collect(),
            timings: Timings {
                load_us,
                transform_us: assembly.transform_us,
                render_us: assembly.render_us,
            },
            load_errors: snapshot.load_errors.clone(),
            inputs_hash,
            cache_hit: false,
            token_estimates: TokenEstimates {
                summary: estimate_tokens(&assembly.summary_text),
                voice: estimate_tokens(&assembly.voice_text),
            },
            identity_spec: snapshot.identity.slug.clone(),
            archetype: snapshot.identity.archetype_slug().map(str::to_string),
        };

        Ok(ComposeResult {
            prompt_id: None,
            status,
            llm_prompt: assembly.llm_prompt,
            summary_text: assembly.summary_text,
            voice_text: assembly.voice_text,
            metadata,
        })
    }

    /// The caller's latest record, if its fingerprint matches, as an unsaved
    /// result. A record that no longer decodes is treated as a miss.
    async fn cached(
        &self,
        caller_id: &str,
        inputs_hash: &str,
        load_us: u64,
    ) -> Result<Option<ComposeResult>> {
        let Some(latest) = self.store.latest_prompt(caller_id).await? else {
            return Ok(None);
        };
        if latest.inputs_hash != inputs_hash {
            return Ok(None);
        }

        let decoded = serde_json::from_value::<LlmPrompt>(latest.llm_prompt)
            .and_then(|p| serde_json::from_value::<ComposeMetadata>(latest.metadata).map(|m| (p, m)));
        match decoded {
            Ok((llm_prompt, mut metadata)) => {
                metadata.cache_hit = true;
                metadata.timings = Timings {
                    load_us,
                    ..Timings::default()
                };
                debug!(caller_id, cached_from = %latest.id, "Fingerprint matches latest prompt");
                Ok(Some(ComposeResult {
                    prompt_id: None,
                    status: latest.status,
                    llm_prompt,
                    summary_text: latest.prompt_text,
                    voice_text: latest.voice_text,
                    metadata,
                }))
            }
            Err(e) => {
                warn!(caller_id, prompt_id = %latest.id, "Stored prompt does not decode, recomposing: {e}");
                Ok(None)
            }
        }
    }

    pub async fn latest_prompt(&self, caller_id: &str) -> Result<Option<ComposedPrompt>> {
        Ok(self.store.latest_prompt(caller_id).await?)
    }

    pub async fn list_prompts(&self, caller_id: &str, limit: usize) -> Result<Vec<ComposedPrompt>> {
        Ok(self.store.list_prompts(caller_id, limit).await?)
    }
}
