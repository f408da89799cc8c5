use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{Span, debug, info, instrument, warn};

use notiq_core::ClaimId;
use notiq_delivery::{DeliveryOutcome, QueueItem, QueueStatus, RetryPolicy};

use crate::dispatcher::{ChannelDispatcher, outcome_of};
use crate::error::QueueError;
use crate::store::QueueStore;

/// Items claimed per pass unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Upper bound on one dispatch unless configured otherwise.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Counters for one processing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    /// Attempts made: `succeeded + failed`.
    pub processed: u64,
    pub succeeded: u64,
    /// Attempts that failed, whether the item was rescheduled or is now dead.
    pub failed: u64,
    /// Not-yet-due items among the first `limit` waiting items.
    pub skipped: u64,
}

/// Claims due items and delivers them one at a time.
///
/// Each call to [`process_queue`](Self::process_queue) handles at most one
/// bounded batch and returns; something else (see
/// [`QueueRunner`](super::QueueRunner)) decides when to call it again.
#[derive(Debug)]
pub struct QueueProcessor<S, D> {
    store: S,
    dispatcher: D,
    policy: RetryPolicy,
    dispatch_timeout: Duration,
    span: Span,
}

impl<S, D> QueueProcessor<S, D>
where
    S: QueueStore,
    D: ChannelDispatcher,
{
    pub fn new(store: S, dispatcher: D) -> Self {
        Self {
            store,
            dispatcher,
            policy: RetryPolicy::default(),
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            span: tracing::info_span!("queue.worker"),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Upper bound on a single dispatch; elapsing counts as a failed attempt.
    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Process up to `limit` due items now.
    pub async fn process_queue(&self, limit: usize) -> Result<ProcessReport, QueueError> {
        self.process_due(limit, Utc::now()).await
    }

    /// Process up to `limit` items due at `now`.
    ///
    /// Items are dispatched sequentially. Before each dispatch the claim is
    /// renewed; an item whose claim was released as stale in the meantime
    /// belongs to someone else and is left alone. A failing item never aborts
    /// the pass; only failing to claim does.
    #[instrument(parent = &self.span, skip(self), err)]
    pub async fn process_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<ProcessReport, QueueError> {
        let batch = self.store.claim_due(now, limit).await?;
        let mut report = ProcessReport {
            skipped: batch.deferred,
            ..ProcessReport::default()
        };

        let claim = batch.claim;
        for item in batch.items {
            if !self.renew(&item, claim, now).await {
                continue;
            }
            let item = self.deliver(item, now).await;
            if item.status == QueueStatus::Sent {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
            self.persist(claim, &item).await;
        }

        report.processed = report.succeeded + report.failed;
        if report.processed > 0 {
            info!(
                processed = report.processed,
                succeeded = report.succeeded,
                failed = report.failed,
                skipped = report.skipped,
                "queue pass finished"
            );
        } else {
            debug!(skipped = report.skipped, "nothing due");
        }
        Ok(report)
    }

    /// Make one attempt and apply the retry policy to the claimed item.
    async fn deliver(&self, mut item: QueueItem, now: DateTime<Utc>) -> QueueItem {
        let outcome = self.attempt(&item).await;
        let finished = now.max(Utc::now());
        let decision = self
            .policy
            .decide(item.attempts, item.max_attempts, outcome, finished);
        item.apply(decision, finished);

        match item.status {
            QueueStatus::Sent => debug!(
                item_id = %item.id,
                channel = %item.channel,
                attempts = item.attempts,
                "delivered"
            ),
            QueueStatus::Retry => debug!(
                item_id = %item.id,
                channel = %item.channel,
                attempts = item.attempts,
                retry_at = %item.scheduled_for,
                error = item.error_message.as_deref().unwrap_or_default(),
                "delivery failed, retry scheduled"
            ),
            _ => warn!(
                item_id = %item.id,
                channel = %item.channel,
                attempts = item.attempts,
                error = item.error_message.as_deref().unwrap_or_default(),
                "delivery failed permanently"
            ),
        }
        item
    }

    async fn attempt(&self, item: &QueueItem) -> DeliveryOutcome {
        let send = self.dispatcher.send(item.channel, item.notification_id);
        match tokio::time::timeout(self.dispatch_timeout, send).await {
            Ok(result) => outcome_of(result),
            Err(_) => DeliveryOutcome::Failed(format!(
                "dispatch timed out after {:?}",
                self.dispatch_timeout
            )),
        }
    }

    async fn renew(&self, item: &QueueItem, claim: ClaimId, now: DateTime<Utc>) -> bool {
        match self
            .store
            .renew_claim(item.id, claim, now.max(Utc::now()))
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                warn!(item_id = %item.id, "claim released before dispatch, item skipped");
                false
            }
            Err(err) => {
                warn!(
                    item_id = %item.id,
                    error = %err,
                    "failed to renew claim, item left for stale recovery"
                );
                false
            }
        }
    }

    async fn persist(&self, claim: ClaimId, item: &QueueItem) {
        match self.store.record_outcome(claim, item).await {
            Ok(true) => {}
            Ok(false) => warn!(
                item_id = %item.id,
                status = %item.status,
                "claim lost before the outcome was recorded"
            ),
            Err(err) => warn!(
                item_id = %item.id,
                status = %item.status,
                error = %err,
                "failed to record outcome"
            ),
        }
    }
}
