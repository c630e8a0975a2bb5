//! Promptloom CLI, the main entry point.
//!
//! Commands:
//! - `serve`       Start the HTTP gateway
//! - `resolve`     Resolve a behavior target for a caller
//! - `set-target`  Set a target, superseding the active one
//! - `history`     Show a target tuple's supersession chain
//! - `layer-diff`  Diff an overlay spec against its archetype
//! - `aggregate`   Run aggregation rules for a caller
//! - `compose`     Compose (or preview) a caller's prompt
//! - `prompts`     List a caller's stored prompts
//! - `seed`        Load a JSON fixture into the store
//! - `config`      Show, validate or initialise configuration

use clap::{Parser, Subcommand, ValueEnum};
use promptloom_config::AppConfig;
use promptloom_core::target::{TargetScope, TargetSource};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "promptloom",
    about = "Promptloom: target resolution, archetype layering and prompt composition",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ~/.promptloom/config.toml)
    #[arg(short, long, global = true, env = "PROMPTLOOM_CONFIG")]
    config: Option<PathBuf>,

    /// Override `database.url` ("memory" or a sqlite: URL)
    #[arg(long, global = true)]
    database: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Resolve the effective target for one parameter
    Resolve {
        caller_id: String,
        parameter_id: String,
    },

    /// Set a behavior target
    SetTarget {
        parameter_id: String,
        #[arg(long, value_enum)]
        scope: ScopeArg,
        /// Segment or caller id (required for SEGMENT and CALLER scope)
        #[arg(long)]
        scope_target_id: Option<String>,
        #[arg(long)]
        value: f64,
        #[arg(long, default_value_t = 1.0)]
        confidence: f64,
        #[arg(long, value_enum, default_value_t = SourceArg::Manual)]
        source: SourceArg,
    },

    /// Show the supersession chain of a target tuple
    History {
        parameter_id: String,
        #[arg(long, value_enum)]
        scope: ScopeArg,
        #[arg(long)]
        scope_target_id: Option<String>,
    },

    /// Diff an overlay specification against its archetype
    LayerDiff { spec_id: String },

    /// Run every active aggregation rule for a caller
    Aggregate { caller_id: String },

    /// Compose a caller's prompt
    Compose {
        caller_id: String,
        /// Store the result (without this flag the run is a preview)
        #[arg(long)]
        persist: bool,
        #[arg(long)]
        trigger_call_id: Option<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(long, value_enum, default_value_t = commands::compose::Output::Summary)]
        output: commands::compose::Output,
    },

    /// List a caller's stored prompts, newest first
    Prompts {
        caller_id: String,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Load a JSON fixture into the configured store
    Seed { file: PathBuf },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Validate the configuration file
    Validate,
    /// Print the default config path
    Path,
    /// Write a default config file if none exists
    Init,
}

#[derive(Clone, Copy, ValueEnum)]
enum ScopeArg {
    System,
    Segment,
    Caller,
}

impl From<ScopeArg> for TargetScope {
    fn from(arg: ScopeArg) -> Self {
        match arg {
            ScopeArg::System => Self::System,
            ScopeArg::Segment => Self::Segment,
            ScopeArg::Caller => Self::Caller,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SourceArg {
    Seed,
    Learned,
    Manual,
}

impl From<SourceArg> for TargetSource {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Seed => Self::Seed,
            SourceArg::Learned => Self::Learned,
            SourceArg::Manual => Self::Manual,
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"));
    let mut config = AppConfig::load_with_overrides(&path)?;
    if let Some(url) = &cli.database {
        config.database.url = url.clone();
    }
    Ok(config)
}

fn init_tracing(config: &AppConfig, verbose: bool) {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config, cli.verbose);

    match cli.command {
        Commands::Serve { port } => commands::serve::run(config, port).await?,
        Commands::Resolve {
            caller_id,
            parameter_id,
        } => commands::targets::resolve(&config, &caller_id, &parameter_id).await?,
        Commands::SetTarget {
            parameter_id,
            scope,
            scope_target_id,
            value,
            confidence,
            source,
        } => {
            commands::targets::set(
                &config,
                promptloom_targets::SetTargetRequest {
                    parameter_id,
                    scope: scope.into(),
                    scope_target_id,
                    value,
                    confidence,
                    source: source.into(),
                },
            )
            .await?
        }
        Commands::History {
            parameter_id,
            scope,
            scope_target_id,
        } => {
            commands::targets::history(&config, parameter_id, scope.into(), scope_target_id)
                .await?
        }
        Commands::LayerDiff { spec_id } => commands::layers::diff(&config, &spec_id).await?,
        Commands::Aggregate { caller_id } => commands::aggregate::run(&config, &caller_id).await?,
        Commands::Compose {
            caller_id,
            persist,
            trigger_call_id,
            timeout_ms,
            output,
        } => {
            let options = promptloom_compose::ComposeOptions {
                persist,
                trigger_call_id,
                timeout_ms,
            };
            commands::compose::run(&config, &caller_id, options, output).await?
        }
        Commands::Prompts { caller_id, limit } => {
            commands::compose::list(&config, &caller_id, limit).await?
        }
        Commands::Seed { file } => commands::seed::run(&config, &file).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show(&config)?,
            ConfigAction::Validate => commands::config_cmd::validate(cli.config.as_deref())?,
            ConfigAction::Path => commands::config_cmd::path(),
            ConfigAction::Init => commands::config_cmd::init()?,
        },
    }

    Ok(())
}
