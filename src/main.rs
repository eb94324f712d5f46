use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use essentials_queue::{
    api, jobs, manager::ManagerConfig, MemoryBroker, QueueManager, ServiceConfig,
};

/// Initialize tracing/logging for the process. Configurable via `RUST_LOG`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ServiceConfig::from_env();
    let broker = Arc::new(MemoryBroker::connect(&config.broker));

    let manager_config = ManagerConfig {
        shutdown_grace: config.shutdown_grace,
        default_job_options: config.default_job_options(),
        ..ManagerConfig::default()
    };
    let manager = Arc::new(
        QueueManager::connect(broker, manager_config)
            .await
            .context("queue service cannot start without a broker")?,
    );

    jobs::register_builtin(&manager, &config).context("failed to register built-in handlers")?;
    manager.start();

    let app = api::router(manager.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "queue service listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    manager.shutdown().await?;
    Ok(())
}
