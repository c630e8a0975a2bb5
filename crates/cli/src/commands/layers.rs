//! `promptloom layer-diff`

use super::{open_store, print_json};
use promptloom_config::AppConfig;
use promptloom_core::store::SpecStore;
use promptloom_layering::LayerResolver;
use std::sync::Arc;

pub async fn diff(config: &AppConfig, spec_id: &str) -> anyhow::Result<()> {
    let specs: Arc<dyn SpecStore> = open_store(config).await?;
    let diff = LayerResolver::new(specs).compute_layer_diff(spec_id).await?;
    print_json(&diff)
}
