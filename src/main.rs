use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use calc_orchestrator::agent;
use calc_orchestrator::config::OrchestratorConfig;
use calc_orchestrator::gateway::routes::router;
use calc_orchestrator::gateway::{SubmissionService, WorkerGateway};
use calc_orchestrator::scheduler::{CompletionDispatcher, Scheduler};
use calc_orchestrator::store::{LibSqlBackend, TaskStore};

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

    let config = OrchestratorConfig::from_env();

    eprintln!("Calc orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Client API: http://0.0.0.0:{}/api/v1/calculate", config.http_port);
    eprintln!("   Worker RPC: http://0.0.0.0:{}/internal/task", config.http_port);
    eprintln!(
        "   Operation times (ms): + {} / - {} / * {} / / {}",
        config.operation_times.addition_ms,
        config.operation_times.subtraction_ms,
        config.operation_times.multiplication_ms,
        config.operation_times.division_ms,
    );

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn TaskStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    // ── Scheduling ───────────────────────────────────────────────────────
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&store)));
    match scheduler.recover().await {
        Ok(0) => {}
        Ok(n) => eprintln!("   Recovered {} unfinished expression(s)", n),
        Err(e) => tracing::warn!("Startup recovery failed: {}", e),
    }
    let dispatcher = Arc::new(CompletionDispatcher::spawn(
        Arc::clone(&scheduler),
        config.dispatch.clone(),
    ));

    let gateway = Arc::new(WorkerGateway::new(
        Arc::clone(&store),
        Arc::clone(&dispatcher),
        config.operation_times.clone(),
        config.retry_after_secs,
    ));
    let submissions = Arc::new(SubmissionService::new(Arc::clone(&store), Arc::clone(&scheduler)));

    // ── In-process agents ────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let agents = agent::spawn_pool(
        config.local_agents,
        gateway.clone(),
        Duration::from_secs(1),
        shutdown_rx,
    );
    if !agents.is_empty() {
        eprintln!("   Local agents: {}", agents.len());
    }

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = router(gateway, submissions);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port))
        .await
        .with_context(|| format!("failed to bind port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
            }
            tracing::info!("Shutdown requested");
        })
        .await
        .context("HTTP server failed")?;

    // ── Shutdown ─────────────────────────────────────────────────────────
    let _ = shutdown_tx.send(true);
    for result in futures::future::join_all(agents).await {
        if let Err(e) = result {
            tracing::error!("Agent task panicked: {}", e);
        }
    }
    dispatcher.shutdown().await;
    eprintln!("Goodbye.");
    Ok(())
}
