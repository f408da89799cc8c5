//! Operator and housekeeping operations on the queue.

use std::time::Duration;

use chrono::Utc;
use tracing::{Span, info, instrument, warn};

use notiq_core::{NotificationId, QueueItemId};
use notiq_delivery::{QueueItem, QueueStats, QueueStatus};

use crate::error::QueueError;
use crate::store::{Pagination, QueueFilter, QueuePage, QueueStore};

/// Error message written on items cancelled through their notification.
pub const CANCELLED_MESSAGE: &str = "Cancelled";

/// Stats, listing, manual retry, cancellation, cleanup and stale-claim recovery.
#[derive(Debug)]
pub struct Maintenance<S> {
    store: S,
    span: Span,
}

impl<S: QueueStore> Maintenance<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            span: tracing::info_span!("queue.maintenance"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Count items per status. Every status is present, zero when empty.
    #[instrument(parent = &self.span, skip(self), err)]
    pub async fn get_queue_stats(&self) -> Result<QueueStats, QueueError> {
        Ok(self.store.stats().await?)
    }

    /// List items matching `filter`, newest first.
    #[instrument(parent = &self.span, skip(self), err)]
    pub async fn find_all(
        &self,
        filter: &QueueFilter,
        pagination: Pagination,
    ) -> Result<QueuePage, QueueError> {
        Ok(self.store.list(filter, pagination).await?)
    }

    /// Give a `failed` item a fresh attempt budget and make it due now.
    ///
    /// Fails with `NotFound` for unknown ids and `Validation` for items in any
    /// other status, without touching them. If the item leaves `failed` between
    /// the check and the reset, the result is `Conflict`.
    #[instrument(parent = &self.span, skip(self), fields(item_id = %id), err)]
    pub async fn retry_item(&self, id: QueueItemId) -> Result<QueueItem, QueueError> {
        let item = self
            .store
            .get(id)
            .await?
            .ok_or(QueueError::NotFound(id))?;

        if item.status != QueueStatus::Failed {
            return Err(QueueError::validation(format!(
                "item {id} is {}; only failed items can be retried",
                item.status
            )));
        }

        match self.store.reset_failed(id, Utc::now()).await? {
            Some(item) => {
                info!(notification_id = %item.notification_id, "failed item requeued");
                Ok(item)
            }
            None => Err(QueueError::Conflict(format!(
                "item {id} changed while being retried"
            ))),
        }
    }

    /// Fail every `pending`/`retry` item of a notification with
    /// [`CANCELLED_MESSAGE`]. Returns how many items were cancelled.
    #[instrument(parent = &self.span, skip(self), fields(notification_id = %notification_id), err)]
    pub async fn cancel_by_notification(
        &self,
        notification_id: NotificationId,
    ) -> Result<u64, QueueError> {
        let cancelled = self
            .store
            .cancel_by_notification(notification_id, CANCELLED_MESSAGE)
            .await?;
        if cancelled > 0 {
            info!(cancelled, "queued deliveries cancelled");
        }
        Ok(cancelled)
    }

    /// Delete `sent`/`failed` items last processed more than
    /// `older_than_days` days ago.
    ///
    /// A retention reaching before the earliest representable time is a
    /// `Validation` error.
    #[instrument(parent = &self.span, skip(self), err)]
    pub async fn cleanup_processed(&self, older_than_days: u32) -> Result<u64, QueueError> {
        let cutoff = chrono::Duration::try_days(i64::from(older_than_days))
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .ok_or_else(|| {
                QueueError::validation(format!(
                    "retention of {older_than_days} days is out of range"
                ))
            })?;
        let deleted = self.store.delete_processed_before(cutoff).await?;
        info!(deleted, %cutoff, "processed items cleaned up");
        Ok(deleted)
    }

    /// Return items stuck in `processing` for longer than `stale_after` to
    /// `retry`, due immediately. Attempts are left as they are.
    #[instrument(parent = &self.span, skip(self), err)]
    pub async fn recover_stalled(&self, stale_after: Duration) -> Result<u64, QueueError> {
        let now = Utc::now();
        let claimed_before = chrono::Duration::from_std(stale_after)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .ok_or_else(|| QueueError::validation("stale claim threshold is too large"))?;
        let recovered = self
            .store
            .release_stale_claims(claimed_before, now)
            .await?;
        if recovered > 0 {
            warn!(recovered, "stale claims released");
        }
        Ok(recovered)
    }
}
