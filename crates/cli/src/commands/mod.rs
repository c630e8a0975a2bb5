pub mod aggregate;
pub mod compose;
pub mod config_cmd;
pub mod layers;
pub mod seed;
pub mod serve;
pub mod targets;

use anyhow::Context;
use promptloom_config::AppConfig;
use promptloom_core::store::Store;
use serde::Serialize;
use std::sync::Arc;

/// Open the store named by `database.url`.
pub async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn Store>> {
    promptloom_store::open(&config.database.url, config.database.max_connections)
        .await
        .with_context(|| format!("failed to open store at {}", config.database.url))
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
