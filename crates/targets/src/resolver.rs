//! Target Scope Resolver.
//!
//! Reads: CALLER beats SEGMENT beats SYSTEM, first match wins, values are
//! never blended. Writes: supersede-then-insert as one store transaction,
//! retried from scratch when another writer wins the race.

use chrono::Utc;
use futures::future::join_all;
use promptloom_core::caller::Caller;
use promptloom_core::error::{Error, Result, StoreError};
use promptloom_core::store::{CallerStore, Store, TargetStore};
use promptloom_core::target::{
    BehaviorTarget, TargetKey, TargetScope, TargetSource, check_unit_interval,
};
use promptloom_core::versioned::Versioned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The effective target for one parameter and the scope it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedTarget {
    pub parameter_id: String,
    pub value: f64,
    pub confidence: f64,
    pub scope: TargetScope,
    pub source: TargetSource,
    pub target_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_target_id: Option<String>,
}

/// Per-parameter outcome of [`TargetResolver::resolve_many`].
#[derive(Debug, Default)]
pub struct TargetResolution {
    pub resolved: BTreeMap<String, ResolvedTarget>,
    pub failed: BTreeMap<String, Error>,
}

impl From<BehaviorTarget> for ResolvedTarget {
    fn from(t: BehaviorTarget) -> Self {
        Self {
            parameter_id: t.parameter_id,
            value: t.target_value,
            confidence: t.confidence,
            scope: t.scope,
            source: t.source,
            target_id: t.id,
            scope_target_id: t.scope_target_id,
        }
    }
}

/// Input to [`TargetResolver::set_target`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetTargetRequest {
    pub parameter_id: String,
    pub scope: TargetScope,
    #[serde(default)]
    pub scope_target_id: Option<String>,
    pub value: f64,
    pub confidence: f64,
    pub source: TargetSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetTargetOutcome {
    pub new_target_id: String,
    pub superseded_target_id: Option<String>,
}

/// Which segment(s) a caller's SEGMENT-scope lookup consults.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SegmentPlan {
    None,
    /// Primary first; the rest only if the primary has no target.
    Primary { primary: String, others: Vec<String> },
    /// No primary: at most one of these may carry a target.
    Unranked(Vec<String>),
}

fn plan_segments(caller: &Caller) -> Result<SegmentPlan> {
    let primaries: Vec<&str> = caller
        .segments
        .iter()
        .filter(|m| m.is_primary)
        .map(|m| m.segment_id.as_str())
        .collect();

    if primaries.len() > 1 {
        return Err(Error::Configuration(format!(
            "caller {} has {} primary segments ({})",
            caller.id,
            primaries.len(),
            primaries.join(", ")
        )));
    }

    let mut ids: Vec<String> = caller
        .segments
        .iter()
        .map(|m| m.segment_id.clone())
        .collect();
    ids.sort();
    ids.dedup();

    Ok(match primaries.first() {
        Some(primary) => SegmentPlan::Primary {
            primary: (*primary).to_string(),
            others: ids.into_iter().filter(|id| id != primary).collect(),
        },
        None if ids.is_empty() => SegmentPlan::None,
        None => SegmentPlan::Unranked(ids),
    })
}

pub struct TargetResolver {
    targets: Arc<dyn TargetStore>,
    callers: Arc<dyn CallerStore>,
    max_write_attempts: u32,
}

impl TargetResolver {
    pub fn new(targets: Arc<dyn TargetStore>, callers: Arc<dyn CallerStore>) -> Self {
        Self {
            targets,
            callers,
            max_write_attempts: 3,
        }
    }

    pub fn from_store(store: Arc<dyn Store>) -> Self {
        let targets: Arc<dyn TargetStore> = store.clone();
        let callers: Arc<dyn CallerStore> = store;
        Self::new(targets, callers)
    }

    /// How many times a conflicting supersede is attempted before giving up.
    pub fn with_max_write_attempts(mut self, attempts: u32) -> Self {
        self.max_write_attempts = attempts.max(1);
        self
    }

    async fn load_caller(&self, caller_id: &str) -> Result<Caller> {
        self.callers
            .get_caller(caller_id)
            .await?
            .ok_or_else(|| Error::not_found("caller", caller_id))
    }

    /// `resolveTarget(parameterId, callerId)`.
    pub async fn resolve_target(
        &self,
        parameter_id: &str,
        caller_id: &str,
    ) -> Result<Option<ResolvedTarget>> {
        let caller = self.load_caller(caller_id).await?;
        self.resolve_for_caller(parameter_id, &caller).await
    }

    /// Resolve one parameter for an already-loaded caller.
    pub async fn resolve_for_caller(
        &self,
        parameter_id: &str,
        caller: &Caller,
    ) -> Result<Option<ResolvedTarget>> {
        if let Some(t) = self
            .targets
            .active_target(&TargetKey::caller(parameter_id, &caller.id))
            .await?
        {
            debug!(caller_id = %caller.id, parameter_id, "Resolved at CALLER scope");
            return Ok(Some(t.into()));
        }

        if let Some(t) = self.resolve_segment(parameter_id, caller).await? {
            debug!(caller_id = %caller.id, parameter_id, segment = ?t.scope_target_id, "Resolved at SEGMENT scope");
            return Ok(Some(t.into()));
        }

        let system = self
            .targets
            .active_target(&TargetKey::system(parameter_id))
            .await?;
        if system.is_some() {
            debug!(caller_id = %caller.id, parameter_id, "Resolved at SYSTEM scope");
        }
        Ok(system.map(Into::into))
    }

    async fn resolve_segment(
        &self,
        parameter_id: &str,
        caller: &Caller,
    ) -> Result<Option<BehaviorTarget>> {
        let candidates = match plan_segments(caller)? {
            SegmentPlan::None => return Ok(None),
            SegmentPlan::Primary { primary, others } => {
                let key = TargetKey::segment(parameter_id, primary);
                if let Some(t) = self.targets.active_target(&key).await? {
                    return Ok(Some(t));
                }
                others
            }
            SegmentPlan::Unranked(ids) => ids,
        };

        let mut found = Vec::new();
        for segment_id in candidates {
            let key = TargetKey::segment(parameter_id, segment_id);
            if let Some(t) = self.targets.active_target(&key).await? {
                found.push(t);
            }
        }

        if found.len() > 1 {
            let segments: Vec<&str> = found
                .iter()
                .filter_map(|t| t.scope_target_id.as_deref())
                .collect();
            return Err(Error::Configuration(format!(
                "caller {} has conflicting SEGMENT targets for '{parameter_id}' in segments {} and no primary segment decides between them",
                caller.id,
                segments.join(", ")
            )));
        }
        Ok(found.pop())
    }

    /// Resolve every parameter concurrently. Parameters with no target at any
    /// scope are absent from both maps; a parameter that fails to resolve
    /// does not affect the others.
    pub async fn resolve_many(&self, parameter_ids: &[String], caller: &Caller) -> TargetResolution {
        let outcomes = join_all(parameter_ids.iter().map(|id| async move {
            (id, self.resolve_for_caller(id, caller).await)
        }))
        .await;

        let mut resolution = TargetResolution::default();
        for (parameter_id, outcome) in outcomes {
            match outcome {
                Ok(Some(t)) => {
                    resolution.resolved.insert(parameter_id.clone(), t);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(caller_id = %caller.id, parameter_id = %parameter_id, error = %e, "Target resolution failed");
                    resolution.failed.insert(parameter_id.clone(), e);
                }
            }
        }
        resolution
    }

    /// `setTarget(...)`: validate, then supersede-then-insert atomically.
    pub async fn set_target(&self, request: SetTargetRequest) -> Result<SetTargetOutcome> {
        check_unit_interval("value", request.value)?;
        check_unit_interval("confidence", request.confidence)?;
        let key = TargetKey::new(
            request.parameter_id.clone(),
            request.scope,
            request.scope_target_id.clone(),
        )?;

        if let (TargetScope::Caller, Some(caller_id)) = (key.scope, key.scope_target_id.as_deref()) {
            self.load_caller(caller_id).await?;
        }

        for attempt in 1..=self.max_write_attempts {
            let next = BehaviorTarget {
                id: Uuid::new_v4().to_string(),
                parameter_id: key.parameter_id.clone(),
                scope: key.scope,
                scope_target_id: key.scope_target_id.clone(),
                target_value: request.value,
                confidence: request.confidence,
                source: request.source,
                effective_from: Utc::now(),
                effective_until: None,
                superseded_by_id: None,
            };
            let new_target_id = next.id.clone();

            match self.targets.supersede_active(&key, next).await {
                Ok(superseded_target_id) => {
                    info!(
                        tuple = %key,
                        new_target_id = %new_target_id,
                        superseded = ?superseded_target_id,
                        "Target set"
                    );
                    return Ok(SetTargetOutcome {
                        new_target_id,
                        superseded_target_id,
                    });
                }
                Err(StoreError::Conflict(reason)) => {
                    warn!(tuple = %key, attempt, "Supersede conflict, retrying: {reason}");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::Conflict(format!(
            "could not set target {key} after {} attempts",
            self.max_write_attempts
        )))
    }

    /// The supersession chain for one tuple, or `None` if it has no history.
    pub async fn target_history(&self, key: &TargetKey) -> Result<Option<Versioned<BehaviorTarget>>> {
        let versions = self.targets.target_history(key).await?;
        let Some(chain) = Versioned::from_ordered(versions) else {
            return Ok(None);
        };
        chain.verify().map_err(|defect| {
            Error::Internal(format!("supersession chain for {key} is broken: {defect:?}"))
        })?;
        Ok(Some(chain))
    }
}
