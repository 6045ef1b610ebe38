use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;

use taskgrid::config::AgentConfig;
use taskgrid::worker::{CoordinatorApi, HttpCoordinator, SimulatedExecutor, TaskExecutor, WorkerAgent};

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

    let config = AgentConfig::from_env()?;
    let label = format!("worker-{}", rand::random::<u16>());

    eprintln!("taskgrid worker v{} ({label})", env!("CARGO_PKG_VERSION"));
    eprintln!("   Coordinator: {}", config.coordinator_url);
    eprintln!(
        "   Heartbeat: {}ms, poll: {}-{}ms\n",
        config.heartbeat_interval.as_millis(),
        config.poll_min.as_millis(),
        config.poll_max.as_millis()
    );

    let api: Arc<dyn CoordinatorApi> = Arc::new(
        HttpCoordinator::new(&config.coordinator_url, config.request_timeout)
            .context("Failed to create coordinator client")?,
    );
    let executor: Arc<dyn TaskExecutor> = Arc::new(SimulatedExecutor::new(label, config.failure_rate));

    let agent = WorkerAgent::new(api, executor, config);
    let shutdown = agent.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received, finishing current task");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    let ctx = agent.run().await.context("Worker agent failed")?;
    eprintln!(
        "Processed {} tasks ({} failed, {} abandoned)",
        ctx.tasks_completed + ctx.tasks_failed,
        ctx.tasks_failed,
        ctx.tasks_abandoned
    );
    Ok(())
}
