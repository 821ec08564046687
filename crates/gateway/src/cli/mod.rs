//! Command-line surface: load config, then run one evaluation.

use std::path::PathBuf;

use clap::Parser;

use sa_domain::config::Config;

#[derive(Parser, Debug)]
#[command(name = "serialagent", version, about = "SerialAgent evaluation demonstrator")]
pub struct Cli {
    /// Prompt to send to the agent.
    pub message: String,

    /// Session id to hydrate/append to (defaults to a fresh uuid).
    #[arg(long)]
    pub session: Option<String>,

    /// Directory holding per-session JSONL files.
    #[arg(long, default_value = "./sessions")]
    pub session_dir: PathBuf,
}

/// Read config from `SA_CONFIG` (or `./config.toml`), falling back to
/// defaults if the file doesn't exist.
pub fn load_config() -> anyhow::Result<Config> {
    let path = std::env::var("SA_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    match std::fs::read_to_string(&path) {
        Ok(raw) => Ok(toml::from_str(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
        Err(e) => Err(e.into()),
    }
}
