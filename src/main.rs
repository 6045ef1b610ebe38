use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;

use taskgrid::clock::SystemClock;
use taskgrid::config::CoordinatorConfig;
use taskgrid::coordinator::{Coordinator, LivenessMonitor, coordinator_routes};
use taskgrid::store::{Database, LibSqlBackend};

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

    let config = CoordinatorConfig::from_env()?;

    eprintln!("taskgrid coordinator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   API: http://{}", config.bind_addr);
    eprintln!(
        "   Lease: {}s, worker timeout: {}s, sweep: {}s\n",
        config.lease_duration.as_secs(),
        config.worker_timeout.as_secs(),
        config.sweep_interval.as_secs()
    );

    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .context("Failed to open database")?,
    );

    let coordinator = Arc::new(Coordinator::from_config(
        db,
        Arc::new(SystemClock),
        &config,
    ));

    // Queue must reflect pending rows before the first fetch is served.
    let depth = coordinator
        .rebuild_queue()
        .await
        .context("Failed to rebuild ready queue")?;
    if depth > 0 {
        eprintln!("   Recovered {depth} pending tasks from DB");
    }

    let monitor = LivenessMonitor::new(Arc::clone(&coordinator), config.sweep_interval);
    let (monitor_handle, monitor_stop) = monitor.spawn();

    let app = coordinator_routes(coordinator);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "Coordinator listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    monitor_stop.store(true, Ordering::Relaxed);
    monitor_handle.abort();
    Ok(())
}
