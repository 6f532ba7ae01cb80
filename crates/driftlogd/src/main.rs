use clap::Parser;
use driftlogd::{Agent, Cli};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = cli.validate() {
        eprintln!("configuration error: {e}");
        std::process::exit(1);
    }

    let agent = Agent::new(cli.into_agent_config()).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    agent.shutdown().await?;

    Ok(())
}
