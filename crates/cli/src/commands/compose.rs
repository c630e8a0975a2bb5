//! `promptloom compose | prompts`

use super::{open_store, print_json};
use clap::ValueEnum;
use promptloom_compose::{ComposeOptions, Composer};
use promptloom_config::AppConfig;

/// What `compose` prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Output {
    Summary,
    Voice,
    /// The whole result, metadata included.
    Json,
}

pub async fn run(
    config: &AppConfig,
    caller_id: &str,
    options: ComposeOptions,
    output: Output,
) -> anyhow::Result<()> {
    let composer = Composer::new(open_store(config).await?, config.composition.clone());
    let result = composer.compose(caller_id, options).await?;

    match output {
        Output::Json => return print_json(&result),
        Output::Summary => println!("{}", result.summary_text),
        Output::Voice => println!("{}", result.voice_text),
    }

    let meta = &result.metadata;
    let skipped: Vec<String> = meta
        .sections_skipped
        .iter()
        .map(|s| format!("{s} ({})", meta.activation_reasons.get(s).map_or("", String::as_str)))
        .collect();
    eprintln!();
    eprintln!("   Status:   {}", result.status.as_str());
    eprintln!(
        "   Prompt:   {}",
        result.prompt_id.as_deref().unwrap_or("(preview, not stored)")
    );
    eprintln!("   Cache:    {}", if meta.cache_hit { "hit" } else { "miss" });
    eprintln!("   Skipped:  {}", if skipped.is_empty() { "none".into() } else { skipped.join(", ") });
    for (input, error) in &meta.load_errors {
        eprintln!("   Failed:   {input}: {error}");
    }
    Ok(())
}

pub async fn list(config: &AppConfig, caller_id: &str, limit: usize) -> anyhow::Result<()> {
    let composer = Composer::new(open_store(config).await?, config.composition.clone());
    let prompts = composer.list_prompts(caller_id, limit).await?;
    if prompts.is_empty() {
        println!("No stored prompts for {caller_id}");
        return Ok(());
    }
    for prompt in prompts {
        println!(
            "{}  {}  {}  {}",
            prompt.composed_at.to_rfc3339(),
            prompt.id,
            prompt.status.as_str(),
            prompt.trigger_call_id.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
