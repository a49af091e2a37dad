use std::sync::Arc;

use calc_orchestrator::agent::{self, HttpTaskSource};
use calc_orchestrator::config::AgentConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AgentConfig::from_env();

    eprintln!("Calc agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Orchestrator: {}", config.orchestrator_url);
    eprintln!("   Computing power: {}", config.computing_power);

    let source = Arc::new(HttpTaskSource::new(config.orchestrator_url.clone()));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let agents = agent::spawn_pool(config.computing_power, source, config.error_backoff, shutdown_rx);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested, finishing current tasks");
    let _ = shutdown_tx.send(true);

    for result in futures::future::join_all(agents).await {
        if let Err(e) = result {
            tracing::error!("Agent task panicked: {}", e);
        }
    }
    eprintln!("Goodbye.");
    Ok(())
}
