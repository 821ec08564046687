use clap::Parser;
use tracing_subscriber::EnvFilter;

use sa_gateway::cli::{load_config, Cli};
use sa_gateway::demo::run_once;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = load_config()?;

    let session_id = cli.session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    run_once(&config, cli.session_dir, session_id, cli.message).await?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sa_gateway=debug")),
        )
        .init();
}
