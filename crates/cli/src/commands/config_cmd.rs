//! `promptloom config`: configuration management commands.

use anyhow::Context;
use promptloom_config::AppConfig;
use std::path::{Path, PathBuf};

fn default_path() -> PathBuf {
    AppConfig::config_dir().join("config.toml")
}

pub fn validate(path: Option<&Path>) -> anyhow::Result<()> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_path);
    println!("Validating {}", path.display());

    let config = AppConfig::load_from(&path)?;
    println!("   Config parsed successfully");

    let mut warnings = Vec::new();
    if config.database.url == promptloom_store::MEMORY_URL {
        warnings.push("database.url is \"memory\": nothing outlives the process");
    }
    if config.gateway.host == "0.0.0.0" {
        warnings.push("Gateway binds every interface (0.0.0.0)");
    }
    if !config.composition.cache_enabled {
        warnings.push("Prompt cache disabled: every persisting compose recomposes from scratch");
    }
    for w in &warnings {
        println!("   warning: {w}");
    }

    println!();
    println!("   Store:     {}", config.database.url);
    println!(
        "   Gateway:   {}:{}",
        config.gateway.host, config.gateway.port
    );
    println!("   Lookback:  {} days", config.aggregation.lookback_days);
    println!("   Timeout:   {} ms", config.composition.timeout_ms);
    Ok(())
}

pub fn show(config: &AppConfig) -> anyhow::Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

pub fn path() {
    println!("{}", default_path().display());
}

pub fn init() -> anyhow::Result<()> {
    let path = default_path();
    if write_default(&path)? {
        println!("Wrote {}", path.display());
    } else {
        println!("{} already exists, leaving it alone", path.display());
    }
    Ok(())
}

/// Write the default config to `path` unless a file is already there.
/// Returns whether anything was written.
fn write_default(path: &Path) -> anyhow::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    std::fs::write(path, AppConfig::default_toml())
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}
