use std::sync::Arc;

use anyhow::Context;

use notiq_api::app::{self, services};
use notiq_infra::QueueConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    notiq_observability::init();

    let config = QueueConfig::load().context("failed to load configuration")?;

    let (store, backend) = services::build_store(&config).await?;
    let runner = services::spawn_runner(&config, store.clone(), services::build_dispatcher());

    let app = app::build_app(Arc::new(services::AppServices::new(store, backend)));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    runner.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
