//! Loreweave CLI
//!
//! Runs one activation turn for a scenario file and prints the assembled
//! output as JSON.

use clap::Parser;
use loreweave::{
    ActivationEngine, ActivationRequest, EstimatingTokenCounter, LorebookSettings, MacroTable,
    TimedEffects, TimedEffectsStore,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Loreweave - lorebook activation for chat prompts
#[derive(Parser, Debug)]
#[command(name = "loreweave")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Scenario JSON: lorebooks, bindings, chat and context size
    #[arg(short, long)]
    scenario: PathBuf,

    /// Settings TOML (defaults to the user config dir)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Directory for per-chat timed effects
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Seed for probability and group rolls
    #[arg(long)]
    seed: Option<u64>,

    /// Verbose output: log every scan pass
    #[arg(short, long)]
    verbose: bool,
}

/// A request plus the host-side bits the CLI fills in itself
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Scenario {
    #[serde(flatten)]
    request: ActivationRequest,
    #[serde(default)]
    macros: HashMap<String, String>,
    /// Key for timed effects persisted under `--state-dir`
    #[serde(default)]
    chat_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let settings = load_settings(cli.settings.as_deref()).await?;
    let scenario = load_scenario(&cli.scenario).await?;

    let macros: MacroTable = scenario.macros.into_iter().collect();
    let engine = ActivationEngine::new(settings, Arc::new(EstimatingTokenCounter))
        .with_macros(Arc::new(macros));

    let mut rng = match cli.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let output = match (cli.state_dir, scenario.chat_id) {
        (Some(dir), Some(chat_id)) => {
            let store = TimedEffectsStore::new(&dir).await?;
            let mut chat = store.checkout(&chat_id).await?;
            let output = engine
                .activate(&scenario.request, &mut chat.effects, &mut rng)
                .await?;
            chat.commit().await?;
            output
        }
        (Some(_), None) => {
            anyhow::bail!("--state-dir needs a chatId in the scenario");
        }
        _ => {
            let mut effects = TimedEffects::new();
            engine
                .activate(&scenario.request, &mut effects, &mut rng)
                .await?
        }
    };

    if let Some(output) = &output {
        info!(
            "{} entries activated{}",
            output.activated.len(),
            if output.token_budget_overflowed {
                " (budget overflowed)"
            } else {
                ""
            }
        );
    }
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

/// Settings from `path`, else the user config file, else defaults
async fn load_settings(path: Option<&Path>) -> anyhow::Result<LorebookSettings> {
    let path = match path {
        Some(path) => Some(path.to_path_buf()),
        None => default_settings_path().filter(|p| p.exists()),
    };

    match path {
        Some(path) => {
            debug!("Loading settings from {:?}", path);
            Ok(LorebookSettings::load(&path).await?)
        }
        None => Ok(LorebookSettings::default()),
    }
}

fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("loreweave").join("settings.toml"))
}

async fn load_scenario(path: &Path) -> anyhow::Result<Scenario> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_path() {
        if let Some(path) = default_settings_path() {
            assert!(path.ends_with("loreweave/settings.toml"));
        }
    }

    #[test]
    fn test_scenario_parses_flattened_request() {
        let json = r#"{
            "lorebooks": [{"name": "world", "entries": [{"uid": 1, "key": ["dragon"], "content": "Dragons"}]}],
            "sources": {"global": ["world"]},
            "chat": ["a dragon appears"],
            "maxContext": 4096,
            "macros": {"user": "Ash"},
            "chatId": "c1"
        }"#;
        let scenario: Scenario = serde_json::from_str(json).unwrap();
        assert_eq!(scenario.request.max_context, 4096);
        assert_eq!(scenario.request.lorebooks[0].entries[0].keys, vec!["dragon"]);
        assert_eq!(scenario.chat_id.as_deref(), Some("c1"));
        assert_eq!(scenario.macros["user"], "Ash");
    }

    #[tokio::test]
    async fn test_missing_settings_file_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = load_settings(Some(&dir.path().join("nope.toml"))).await;
        assert!(result.is_err());
    }
}
