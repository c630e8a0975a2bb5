//! `promptloom resolve | set-target | history`

use super::{open_store, print_json};
use anyhow::bail;
use promptloom_config::AppConfig;
use promptloom_core::target::{TargetKey, TargetScope};
use promptloom_targets::{SetTargetRequest, TargetResolver};

async fn resolver(config: &AppConfig) -> anyhow::Result<TargetResolver> {
    let store = open_store(config).await?;
    Ok(TargetResolver::from_store(store).with_max_write_attempts(config.targets.max_write_attempts))
}

pub async fn resolve(config: &AppConfig, caller_id: &str, parameter_id: &str) -> anyhow::Result<()> {
    match resolver(config).await?.resolve_target(parameter_id, caller_id).await? {
        Some(target) => print_json(&target),
        None => {
            println!("null");
            Ok(())
        }
    }
}

pub async fn set(config: &AppConfig, request: SetTargetRequest) -> anyhow::Result<()> {
    let outcome = resolver(config).await?.set_target(request).await?;
    print_json(&outcome)
}

pub async fn history(
    config: &AppConfig,
    parameter_id: String,
    scope: TargetScope,
    scope_target_id: Option<String>,
) -> anyhow::Result<()> {
    let key = TargetKey::new(parameter_id, scope, scope_target_id)?;
    let Some(chain) = resolver(config).await?.target_history(&key).await? else {
        bail!("no targets recorded for {key}");
    };

    for version in chain.iter() {
        let state = match &version.superseded_by_id {
            Some(next) => format!("superseded by {next}"),
            None => "active".to_string(),
        };
        println!(
            "{}  {:.2} (confidence {:.2}, {})  {}",
            version.effective_from.to_rfc3339(),
            version.target_value,
            version.confidence,
            version.source.as_str(),
            state
        );
    }
    Ok(())
}
