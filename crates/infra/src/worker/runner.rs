//! Periodic trigger for queue processing and housekeeping.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, Span, error, info};

use crate::dispatcher::ChannelDispatcher;
use crate::error::QueueError;
use crate::maintenance::Maintenance;
use crate::store::QueueStore;

use super::processor::{DEFAULT_BATCH_SIZE, ProcessReport, QueueProcessor};

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Name for logging
    pub name: String,
    /// How often to run a processing pass
    pub poll_interval: Duration,
    /// Items claimed per pass
    pub batch_size: usize,
    /// How often to delete old terminal items
    pub cleanup_interval: Duration,
    /// Age (in days) after which terminal items are deleted
    pub retention_days: u32,
    /// Claims older than this are considered abandoned
    pub stale_after: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            name: "queue-runner".to_string(),
            poll_interval: Duration::from_secs(5 * 60),
            batch_size: DEFAULT_BATCH_SIZE,
            cleanup_interval: Duration::from_secs(24 * 60 * 60),
            retention_days: 30,
            stale_after: Duration::from_secs(15 * 60),
        }
    }
}

impl RunnerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Cumulative runner statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunnerStats {
    pub passes: u64,
    pub items_processed: u64,
    pub items_succeeded: u64,
    pub items_failed: u64,
    /// Deferred items seen by the most recent pass.
    pub last_skipped: u64,
    pub stale_recovered: u64,
    pub cleaned_up: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

impl RunnerStats {
    fn record_pass(&mut self, report: &ProcessReport) {
        self.passes += 1;
        self.items_processed += report.processed;
        self.items_succeeded += report.succeeded;
        self.items_failed += report.failed;
        self.last_skipped = report.skipped;
    }
}

/// Handle to a running [`QueueRunner`].
///
/// Dropping the handle stops the runner after its current step.
#[derive(Debug)]
pub struct QueueRunnerHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<RunnerStats>>,
}

impl QueueRunnerHandle {
    /// Stop the runner and wait for the step in flight to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(err) = self.join.await {
            error!(error = %err, "queue runner task ended abnormally");
        }
    }

    /// Snapshot of the runner statistics.
    pub fn stats(&self) -> RunnerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Background trigger: runs stale-claim recovery plus a processing pass every
/// `poll_interval`, and cleanup every `cleanup_interval`.
#[derive(Debug)]
pub struct QueueRunner<S, D> {
    processor: QueueProcessor<S, D>,
    maintenance: Maintenance<S>,
    span: Span,
}

impl<S, D> QueueRunner<S, D>
where
    S: QueueStore + 'static,
    D: ChannelDispatcher + 'static,
{
    pub fn new(processor: QueueProcessor<S, D>, maintenance: Maintenance<S>) -> Self {
        Self {
            processor,
            maintenance,
            span: tracing::info_span!("queue.runner"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Spawn the runner on the current tokio runtime.
    pub fn spawn(self, config: RunnerConfig) -> QueueRunnerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let stats = Arc::new(Mutex::new(RunnerStats::default()));

        let span = self.span.clone();
        let join = tokio::spawn(self.run(config, shutdown_rx, stats.clone()).instrument(span));

        QueueRunnerHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }

    /// One scheduler tick: release abandoned claims, then process a batch.
    ///
    /// A recovery failure is logged and does not prevent the pass.
    pub async fn tick(&self, config: &RunnerConfig) -> Result<(u64, ProcessReport), QueueError> {
        let recovered = match self.maintenance.recover_stalled(config.stale_after).await {
            Ok(recovered) => recovered,
            Err(err) => {
                error!(runner = %config.name, error = %err, "stale claim recovery failed");
                0
            }
        };
        let report = self.processor.process_queue(config.batch_size).await?;
        Ok((recovered, report))
    }

    async fn run(
        self,
        config: RunnerConfig,
        mut shutdown: oneshot::Receiver<()>,
        stats: Arc<Mutex<RunnerStats>>,
    ) {
        info!(
            runner = %config.name,
            poll_interval = ?config.poll_interval,
            batch_size = config.batch_size,
            "queue runner started"
        );
        let start_time = Instant::now();

        let mut poll = tokio::time::interval(config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup = tokio::time::interval(config.cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = poll.tick() => {
                    let result = self.tick(&config).await;
                    update(&stats, |s| match &result {
                        Ok((recovered, report)) => {
                            s.stale_recovered += recovered;
                            s.record_pass(report);
                        }
                        Err(_) => s.errors += 1,
                    });
                    if let Err(err) = result {
                        error!(runner = %config.name, error = %err, "processing pass failed");
                    }
                }
                _ = cleanup.tick() => {
                    match self.maintenance.cleanup_processed(config.retention_days).await {
                        Ok(deleted) => update(&stats, |s| s.cleaned_up += deleted),
                        Err(err) => {
                            update(&stats, |s| s.errors += 1);
                            error!(runner = %config.name, error = %err, "cleanup failed");
                        }
                    }
                }
            }

            update(&stats, |s| s.uptime_secs = start_time.elapsed().as_secs());
        }

        info!(runner = %config.name, "queue runner stopped");
    }
}

fn update(stats: &Mutex<RunnerStats>, f: impl FnOnce(&mut RunnerStats)) {
    let mut guard = stats.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard);
}
