//! HTTP API v1.
//!
//! Endpoints:
//!
//! - `GET  /v1/callers/{caller_id}/targets/{parameter_id}`  Resolve a target (`null` when none)
//! - `POST /v1/targets`                                     Set a target, superseding the active one
//! - `GET  /v1/targets/history`                             Supersession chain for one tuple
//! - `GET  /v1/specs/{spec_id}/layer-diff`                  Overlay vs. archetype diff
//! - `POST /v1/callers/{caller_id}/aggregate`               Run aggregation rules
//! - `POST /v1/callers/{caller_id}/compose`                 Compose (or preview) a prompt
//! - `GET  /v1/callers/{caller_id}/prompts`                 Stored prompts, newest first
//! - `GET  /v1/callers/{caller_id}/prompts/latest`          Latest stored prompt

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use promptloom_aggregation::AggregationReport;
use promptloom_compose::{ComposeOptions, ComposeResult};
use promptloom_core::error::Error;
use promptloom_core::prompt::ComposedPrompt;
use promptloom_core::target::{BehaviorTarget, TargetKey, TargetScope};
use promptloom_layering::LayerDiff;
use promptloom_targets::{ResolvedTarget, SetTargetOutcome, SetTargetRequest};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::SharedState;

/// Default page size for `GET /callers/{caller_id}/prompts`.
const DEFAULT_PROMPT_LIMIT: usize = 20;
const MAX_PROMPT_LIMIT: usize = 200;

// ── Router ────────────────────────────────────────────────────────────────

pub fn v1_router(state: SharedState) -> Router {
    Router::new()
        .route(
            "/callers/{caller_id}/targets/{parameter_id}",
            get(resolve_target_handler),
        )
        .route("/targets", post(set_target_handler))
        .route("/targets/history", get(target_history_handler))
        .route("/specs/{spec_id}/layer-diff", get(layer_diff_handler))
        .route("/callers/{caller_id}/aggregate", post(aggregate_handler))
        .route("/callers/{caller_id}/compose", post(compose_handler))
        .route("/callers/{caller_id}/prompts", get(list_prompts_handler))
        .route(
            "/callers/{caller_id}/prompts/latest",
            get(latest_prompt_handler),
        )
        .with_state(state)
}

// ── Errors ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::NotFound { .. } | Error::InvalidState { .. } => StatusCode::NOT_FOUND,
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::Configuration(_) | Error::DomainNotReady { .. } | Error::Conflict(_) => {
            StatusCode::CONFLICT
        }
        Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        Error::Store(_) | Error::Serialization(_) | Error::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn api_error(error: Error) -> ApiError {
    let status = status_for(&error);
    if status.is_server_error() {
        warn!(kind = error.kind(), "Request failed: {error}");
    }
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            kind: error.kind().to_string(),
        }),
    )
}

fn not_found(message: String) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: message,
            kind: "not_found".into(),
        }),
    )
}

// ── Targets ───────────────────────────────────────────────────────────────

async fn resolve_target_handler(
    State(state): State<SharedState>,
    Path((caller_id, parameter_id)): Path<(String, String)>,
) -> ApiResult<Option<ResolvedTarget>> {
    state
        .targets
        .resolve_target(&parameter_id, &caller_id)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn set_target_handler(
    State(state): State<SharedState>,
    Json(request): Json<SetTargetRequest>,
) -> Result<(StatusCode, Json<SetTargetOutcome>), ApiError> {
    let outcome = state.targets.set_target(request).await.map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryQuery {
    parameter_id: String,
    scope: TargetScope,
    #[serde(default)]
    scope_target_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetHistoryResponse {
    pub key: String,
    /// Oldest first; the last entry is the active target.
    pub versions: Vec<BehaviorTarget>,
}

async fn target_history_handler(
    State(state): State<SharedState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<TargetHistoryResponse> {
    let key = TargetKey::new(query.parameter_id, query.scope, query.scope_target_id)
        .map_err(api_error)?;
    let chain = state
        .targets
        .target_history(&key)
        .await
        .map_err(api_error)?
        .ok_or_else(|| not_found(format!("no targets recorded for {key}")))?;

    Ok(Json(TargetHistoryResponse {
        key: key.to_string(),
        versions: chain.iter().cloned().collect(),
    }))
}

// ── Specs ─────────────────────────────────────────────────────────────────

async fn layer_diff_handler(
    State(state): State<SharedState>,
    Path(spec_id): Path<String>,
) -> ApiResult<LayerDiff> {
    state
        .layers
        .compute_layer_diff(&spec_id)
        .await
        .map(Json)
        .map_err(api_error)
}

// ── Callers ───────────────────────────────────────────────────────────────

async fn aggregate_handler(
    State(state): State<SharedState>,
    Path(caller_id): Path<String>,
) -> ApiResult<AggregationReport> {
    state
        .aggregation
        .run_aggregation(&caller_id)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn compose_handler(
    State(state): State<SharedState>,
    Path(caller_id): Path<String>,
    Json(options): Json<ComposeOptions>,
) -> Result<(StatusCode, Json<ComposeResult>), ApiError> {
    let result = state
        .composer
        .compose(&caller_id, options)
        .await
        .map_err(api_error)?;
    let status = if result.prompt_id.is_some() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(result)))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_prompts_handler(
    State(state): State<SharedState>,
    Path(caller_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<ComposedPrompt>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PROMPT_LIMIT)
        .clamp(1, MAX_PROMPT_LIMIT);
    state
        .composer
        .list_prompts(&caller_id, limit)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn latest_prompt_handler(
    State(state): State<SharedState>,
    Path(caller_id): Path<String>,
) -> ApiResult<ComposedPrompt> {
    state
        .composer
        .latest_prompt(&caller_id)
        .await
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(|| not_found(format!("no composed prompt for caller {caller_id}")))
}
