//! Service wiring: queue store selection, channel dispatch and the runner.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use notiq_core::NotificationId;
use notiq_delivery::Channel;
use notiq_infra::{
    ChannelRouter, ChannelSender, DispatchError, InMemoryQueueStore, Maintenance,
    PostgresQueueStore, QueueConfig, QueueProcessor, QueueRunner, QueueRunnerHandle, QueueStore,
};

/// Store shared by the runner and the HTTP handlers.
pub type SharedStore = Arc<dyn QueueStore>;

/// Services available to HTTP handlers.
pub struct AppServices {
    pub maintenance: Maintenance<SharedStore>,
    backend: &'static str,
}

impl AppServices {
    pub fn new(store: SharedStore, backend: &'static str) -> Self {
        Self {
            maintenance: Maintenance::new(store)
                .with_span(tracing::info_span!("queue.maintenance", source = "http")),
            backend,
        }
    }

    /// In-memory services for tests and local development.
    pub fn in_memory() -> (Self, Arc<InMemoryQueueStore>) {
        let store = Arc::new(InMemoryQueueStore::new());
        (Self::new(store.clone(), "in_memory"), store)
    }

    /// Name of the storage backend (`postgres` or `in_memory`).
    pub fn backend(&self) -> &'static str {
        self.backend
    }
}

/// Connect the configured store.
///
/// With a `database_url` the Postgres schema is applied first; without one the
/// queue lives in memory and is lost on restart.
pub async fn build_store(config: &QueueConfig) -> anyhow::Result<(SharedStore, &'static str)> {
    match config.database_url.as_deref() {
        Some(url) => {
            let store = PostgresQueueStore::connect(url)
                .await
                .context("failed to connect to Postgres")?;
            store
                .migrate()
                .await
                .context("failed to apply queue schema")?;
            tracing::info!("using Postgres queue store");
            Ok((Arc::new(store), "postgres"))
        }
        None => {
            tracing::warn!("database_url not set; using in-memory queue store (dev only)");
            Ok((Arc::new(InMemoryQueueStore::new()), "in_memory"))
        }
    }
}

/// Dev transport: logs the notification and reports it as delivered.
#[derive(Debug, Clone, Copy)]
pub struct LoggingSender {
    channel: Channel,
}

impl LoggingSender {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl ChannelSender for LoggingSender {
    async fn send(&self, notification_id: NotificationId) -> Result<bool, DispatchError> {
        tracing::info!(
            channel = %self.channel,
            notification_id = %notification_id,
            "delivery logged (no transport configured)"
        );
        Ok(true)
    }
}

/// Build the channel router.
///
/// Real transports are registered by deployments; this binary ships none and
/// falls back to [`LoggingSender`] for every channel.
pub fn build_dispatcher() -> ChannelRouter {
    tracing::warn!("no channel transports configured; deliveries are only logged");
    Channel::ALL
        .into_iter()
        .fold(ChannelRouter::new(), |router, channel| {
            router.register(channel, Arc::new(LoggingSender::new(channel)))
        })
}

/// Spawn the periodic runner that drives processing and cleanup.
pub fn spawn_runner(
    config: &QueueConfig,
    store: SharedStore,
    dispatcher: ChannelRouter,
) -> QueueRunnerHandle {
    let processor = QueueProcessor::new(store.clone(), dispatcher)
        .with_dispatch_timeout(config.dispatch_timeout());
    let maintenance = Maintenance::new(store)
        .with_span(tracing::info_span!("queue.maintenance", source = "runner"));

    QueueRunner::new(processor, maintenance).spawn(config.runner_config())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatcher_covers_every_channel() {
        let router = build_dispatcher();
        for channel in Channel::ALL {
            assert!(router.has_sender(channel));
        }
    }

    #[tokio::test]
    async fn missing_database_url_selects_memory_store() {
        let (_, backend) = build_store(&QueueConfig::default()).await.unwrap();
        assert_eq!(backend, "in_memory");
    }
}
