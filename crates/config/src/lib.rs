//! Configuration loading, validation, and management for Promptloom.
//!
//! Loads configuration from `~/.promptloom/config.toml` (or an explicit
//! path) with environment variable overrides. Validates all settings at
//! startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.promptloom/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Relational store
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Target resolver write path
    #[serde(default)]
    pub targets: TargetsConfig,

    /// Aggregation engine
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Composition pipeline and prompt cache
    #[serde(default)]
    pub composition: CompositionConfig,

    /// HTTP gateway
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL, or `"memory"` for the in-process store.
    #[serde(default = "default_database_url")]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    format!(
        "sqlite://{}",
        AppConfig::config_dir().join("promptloom.db").display()
    )
}
fn default_max_connections() -> u32 {
    4
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetsConfig {
    /// How many times a conflicting supersede transaction is attempted.
    #[serde(default = "default_max_write_attempts")]
    pub max_write_attempts: u32,
}

fn default_max_write_attempts() -> u32 {
    3
}

impl Default for TargetsConfig {
    fn default() -> Self {
        Self {
            max_write_attempts: default_max_write_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Only scores this recent are considered.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,

    /// Minimum scores per source parameter; rules may raise or lower it.
    #[serde(default = "default_min_scores")]
    pub min_scores: usize,

    /// Cap on scores read per source parameter.
    #[serde(default = "default_max_scores")]
    pub max_scores_per_parameter: usize,
}

fn default_lookback_days() -> u32 {
    30
}
fn default_min_scores() -> usize {
    1
}
fn default_max_scores() -> usize {
    50
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            min_scores: default_min_scores(),
            max_scores_per_parameter: default_max_scores(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositionConfig {
    /// Most recent memory facts loaded per composition.
    #[serde(default = "default_memory_fact_limit")]
    pub memory_fact_limit: usize,

    /// Whole-pipeline timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Reuse the latest stored prompt when the inputs fingerprint matches.
    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    /// Upcoming curriculum modules listed after the current one.
    #[serde(default = "default_upcoming_modules")]
    pub upcoming_modules: usize,
}

fn default_memory_fact_limit() -> usize {
    20
}
fn default_timeout_ms() -> u64 {
    5_000
}
fn default_upcoming_modules() -> usize {
    3
}
fn default_true() -> bool {
    true
}

impl Default for CompositionConfig {
    fn default() -> Self {
        Self {
            memory_fact_limit: default_memory_fact_limit(),
            timeout_ms: default_timeout_ms(),
            cache_enabled: true,
            upcoming_modules: default_upcoming_modules(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    42700
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.promptloom/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `PROMPTLOOM_DATABASE_URL`
    /// - `PROMPTLOOM_LOG`
    /// - `PROMPTLOOM_PORT`
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_overrides(&Self::config_dir().join("config.toml"))
    }

    /// Load from `path`, then apply environment overrides.
    pub fn load_with_overrides(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;

        if let Ok(url) = std::env::var("PROMPTLOOM_DATABASE_URL") {
            config.database.url = url;
        }

        if let Ok(level) = std::env::var("PROMPTLOOM_LOG") {
            config.logging.level = level;
        }

        if let Ok(port) = std::env::var("PROMPTLOOM_PORT") {
            config.gateway.port = port.parse().map_err(|_| {
                ConfigError::ValidationError(format!("PROMPTLOOM_PORT is not a port: {port}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".promptloom")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "database.url cannot be empty".into(),
            ));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "database.max_connections must be >= 1".into(),
            ));
        }

        if self.targets.max_write_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "targets.max_write_attempts must be >= 1".into(),
            ));
        }

        if self.aggregation.lookback_days == 0 {
            return Err(ConfigError::ValidationError(
                "aggregation.lookback_days must be > 0".into(),
            ));
        }

        if self.aggregation.max_scores_per_parameter == 0 {
            return Err(ConfigError::ValidationError(
                "aggregation.max_scores_per_parameter must be > 0".into(),
            ));
        }

        if self.composition.memory_fact_limit == 0 {
            return Err(ConfigError::ValidationError(
                "composition.memory_fact_limit must be >= 1".into(),
            ));
        }

        if self.composition.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "composition.timeout_ms must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.gateway.port, 42700);
        assert_eq!(config.targets.max_write_attempts, 3);
        assert_eq!(config.aggregation.lookback_days, 30);
        assert!(config.composition.cache_enabled);
        assert!(config.database.url.starts_with("sqlite://"));
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.gateway.port, config.gateway.port);
        assert_eq!(parsed.composition.timeout_ms, config.composition.timeout_ms);
    }

    #[test]
    fn zero_lookback_rejected() {
        let mut config = AppConfig::default();
        config.aggregation.lookback_days = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_write_attempts_rejected() {
        let mut config = AppConfig::default();
        config.targets.max_write_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.composition.memory_fact_limit, 20);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[aggregation]
lookback_days = 7
min_scores = 3

[composition]
cache_enabled = false
"#
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.aggregation.lookback_days, 7);
        assert_eq!(config.aggregation.min_scores, 3);
        assert_eq!(config.aggregation.max_scores_per_parameter, 50);
        assert!(!config.composition.cache_enabled);
        assert_eq!(config.gateway.port, 42700);
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[composition\ntimeout_ms = ").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn invalid_values_in_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[composition]\ntimeout_ms = 0\n").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("42700"));
        assert!(toml_str.contains("lookback_days"));
    }
}
