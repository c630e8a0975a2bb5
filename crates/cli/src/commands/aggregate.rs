//! `promptloom aggregate`

use super::{open_store, print_json};
use promptloom_aggregation::AggregationEngine;
use promptloom_config::AppConfig;

pub async fn run(config: &AppConfig, caller_id: &str) -> anyhow::Result<()> {
    let engine = AggregationEngine::new(open_store(config).await?, config.aggregation.clone());
    let report = engine.run_aggregation(caller_id).await?;
    print_json(&report)
}
