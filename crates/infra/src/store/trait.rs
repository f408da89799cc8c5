use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use notiq_core::{ClaimId, NotificationId, QueueItemId};
use notiq_delivery::{Channel, QueueItem, QueueStats};

use super::query::{Pagination, QueueFilter, QueuePage};

/// Queue store operation error.
///
/// These are infrastructure errors (storage, row decoding). Operator-input
/// errors such as "item not failed" are decided above the store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("queue item already exists: {0}")]
    AlreadyExists(QueueItemId),

    #[error("invalid row: {0}")]
    InvalidRow(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Items claimed by one worker invocation.
#[derive(Debug, Clone, Default)]
pub struct ClaimBatch {
    /// Token every claimed item carries until its outcome is recorded.
    pub claim: ClaimId,
    /// Claimed items, now `processing`, in claim order (priority desc, FIFO).
    pub items: Vec<QueueItem>,
    /// Not-yet-due items among the first `limit` waiting items in claim order.
    pub deferred: u64,
}

/// Durable table of queue items.
///
/// ## Claim semantics
///
/// `claim_due` must be atomic: an item it returns is `processing` under a fresh
/// [`ClaimId`] and no other caller can claim it until `record_outcome` (or
/// stale-claim recovery) moves it on. `renew_claim` and `record_outcome` only
/// apply to items still `processing` under the caller's claim, so a worker
/// whose claim was released as stale can neither dispatch nor overwrite an
/// item that has since been claimed again.
///
/// ## Implementation requirements
///
/// - Never mutate terminal (`sent`/`failed`) items except through
///   `reset_failed` and `delete_processed_before`
/// - Order claims by `priority DESC, created_at ASC`
/// - Order listings by `created_at DESC`
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert one new item.
    async fn insert(&self, item: QueueItem) -> Result<QueueItem, StoreError>;

    /// Insert `pending` items for every `(notification, channel)` pair, all or
    /// nothing. Returns the number of rows inserted.
    async fn insert_batch_atomic(
        &self,
        entries: &[(NotificationId, Channel)],
    ) -> Result<u64, StoreError>;

    async fn get(&self, id: QueueItemId) -> Result<Option<QueueItem>, StoreError>;

    /// Claim up to `limit` items that are due at `now`.
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<ClaimBatch, StoreError>;

    /// Confirm `claim` still owns item `id` and restart its stale-claim clock
    /// at `now`.
    ///
    /// Returns `false` when the claim was lost; nothing is written in that case.
    async fn renew_claim(
        &self,
        id: QueueItemId,
        claim: ClaimId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Persist the outcome of an attempt made under `claim`.
    ///
    /// Returns `false` when the item is no longer `processing` under `claim`
    /// (e.g. recovered as stale and claimed again); nothing is written in that
    /// case.
    async fn record_outcome(&self, claim: ClaimId, item: &QueueItem) -> Result<bool, StoreError>;

    /// Count items per status.
    async fn stats(&self) -> Result<QueueStats, StoreError>;

    /// Filtered listing, newest first.
    async fn list(
        &self,
        filter: &QueueFilter,
        pagination: Pagination,
    ) -> Result<QueuePage, StoreError>;

    /// Move a `failed` item back to `retry` with a fresh attempt budget.
    ///
    /// Returns `None` when the item does not exist or is not `failed`.
    async fn reset_failed(
        &self,
        id: QueueItemId,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, StoreError>;

    /// Fail every `pending`/`retry` item of a notification with `reason`.
    async fn cancel_by_notification(
        &self,
        notification_id: NotificationId,
        reason: &str,
    ) -> Result<u64, StoreError>;

    /// Delete terminal items last processed before `cutoff`.
    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Return `processing` items whose claim was taken or last renewed before
    /// `claimed_before` to `retry`, due at `now`. Their claim is dropped.
    async fn release_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

#[async_trait]
impl<S> QueueStore for Arc<S>
where
    S: QueueStore + ?Sized,
{
    async fn insert(&self, item: QueueItem) -> Result<QueueItem, StoreError> {
        (**self).insert(item).await
    }

    async fn insert_batch_atomic(
        &self,
        entries: &[(NotificationId, Channel)],
    ) -> Result<u64, StoreError> {
        (**self).insert_batch_atomic(entries).await
    }

    async fn get(&self, id: QueueItemId) -> Result<Option<QueueItem>, StoreError> {
        (**self).get(id).await
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<ClaimBatch, StoreError> {
        (**self).claim_due(now, limit).await
    }

    async fn renew_claim(
        &self,
        id: QueueItemId,
        claim: ClaimId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).renew_claim(id, claim, now).await
    }

    async fn record_outcome(&self, claim: ClaimId, item: &QueueItem) -> Result<bool, StoreError> {
        (**self).record_outcome(claim, item).await
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        (**self).stats().await
    }

    async fn list(
        &self,
        filter: &QueueFilter,
        pagination: Pagination,
    ) -> Result<QueuePage, StoreError> {
        (**self).list(filter, pagination).await
    }

    async fn reset_failed(
        &self,
        id: QueueItemId,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, StoreError> {
        (**self).reset_failed(id, now).await
    }

    async fn cancel_by_notification(
        &self,
        notification_id: NotificationId,
        reason: &str,
    ) -> Result<u64, StoreError> {
        (**self).cancel_by_notification(notification_id, reason).await
    }

    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        (**self).delete_processed_before(cutoff).await
    }

    async fn release_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        (**self).release_stale_claims(claimed_before, now).await
    }
}
