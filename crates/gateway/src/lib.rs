//! HTTP API gateway for Promptloom.
//!
//! Exposes target resolution, layer diffs, aggregation and composition as
//! JSON endpoints under `/v1`, plus a `/health` probe.
//!
//! Built on Axum.

pub mod api_v1;

use axum::extract::DefaultBodyLimit;
use axum::{Router, response::Json, routing::get};
use promptloom_aggregation::AggregationEngine;
use promptloom_compose::Composer;
use promptloom_config::AppConfig;
use promptloom_core::store::{SpecStore, Store};
use promptloom_layering::LayerResolver;
use promptloom_targets::TargetResolver;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Shared application state: one store and the services built over it.
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn Store>,
    pub targets: TargetResolver,
    pub layers: LayerResolver,
    pub aggregation: AggregationEngine,
    pub composer: Composer,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(store: Arc<dyn Store>, config: AppConfig) -> Self {
        let specs: Arc<dyn SpecStore> = store.clone();
        Self {
            targets: TargetResolver::from_store(store.clone())
                .with_max_write_attempts(config.targets.max_write_attempts),
            layers: LayerResolver::new(specs),
            aggregation: AggregationEngine::new(store.clone(), config.aggregation.clone()),
            composer: Composer::new(store.clone(), config.composition.clone()),
            store,
            config,
        }
    }
}

/// Build the router: `/health` plus the v1 API.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .nest("/v1", api_v1::v1_router(state))
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB body limit
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Open the configured store and serve until the process is stopped.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let store = promptloom_store::open(&config.database.url, config.database.max_connections).await?;
    info!(backend = store.name(), "Store opened");

    let app = build_router(Arc::new(AppState::new(store, config)));

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use promptloom_store::InMemoryStore;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_check() {
        let state = Arc::new(AppState::new(
            Arc::new(InMemoryStore::new()),
            AppConfig::default(),
        ));
        let app = build_router(state);

        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let app = build_router(Arc::new(AppState::new(
            Arc::new(InMemoryStore::new()),
            AppConfig::default(),
        )));
        let req = Request::builder()
            .uri("/v1/nothing-here")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
