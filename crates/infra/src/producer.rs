//! Admission of new queue items.
//!
//! Callers decide per notification which channels need asynchronous delivery
//! (email, push) and only enqueue those; in-app delivery never comes here.

use chrono::Utc;
use tracing::{Span, debug, error, info, instrument};

use notiq_core::NotificationId;
use notiq_delivery::{Channel, NewQueueItem, QueueItem};

use crate::error::QueueError;
use crate::store::QueueStore;

/// Admits work into the queue.
#[derive(Debug)]
pub struct Producer<S> {
    store: S,
    span: Span,
}

impl<S: QueueStore> Producer<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            span: tracing::info_span!("queue.producer"),
        }
    }

    /// Emit this producer's logs under `span` instead of the default one.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Enqueue one item as `pending` with a fresh attempt budget.
    ///
    /// Identical requests are not deduplicated; each call creates a new item.
    #[instrument(
        parent = &self.span,
        skip(self, request),
        fields(notification_id = %request.notification_id, channel = %request.channel),
        err
    )]
    pub async fn enqueue(&self, request: NewQueueItem) -> Result<QueueItem, QueueError> {
        let item = self.store.insert(QueueItem::new(request, Utc::now())).await?;
        debug!(item_id = %item.id, scheduled_for = %item.scheduled_for, "queued");
        Ok(item)
    }

    /// Enqueue several items one by one.
    ///
    /// Not atomic: if the store fails midway, the items inserted so far stay
    /// queued and the error is returned.
    #[instrument(parent = &self.span, skip(self, requests), fields(batch_size = requests.len()), err)]
    pub async fn enqueue_batch(
        &self,
        requests: Vec<NewQueueItem>,
    ) -> Result<Vec<QueueItem>, QueueError> {
        let total = requests.len();
        let mut queued = Vec::with_capacity(total);

        for request in requests {
            match self.store.insert(QueueItem::new(request, Utc::now())).await {
                Ok(item) => queued.push(item),
                Err(err) => {
                    error!(
                        inserted = queued.len(),
                        total,
                        error = %err,
                        "batch enqueue stopped partway"
                    );
                    return Err(err.into());
                }
            }
        }

        info!(count = queued.len(), "batch queued");
        Ok(queued)
    }

    /// Enqueue a batch all-or-nothing through the store's atomic batch insert.
    ///
    /// Returns the number of items queued. Failures are logged and returned.
    #[instrument(parent = &self.span, skip(self, entries), fields(batch_size = entries.len()))]
    pub async fn enqueue_batch_atomic(
        &self,
        entries: &[(NotificationId, Channel)],
    ) -> Result<u64, QueueError> {
        if entries.is_empty() {
            return Ok(0);
        }

        match self.store.insert_batch_atomic(entries).await {
            Ok(count) => {
                info!(count, "atomic batch queued");
                Ok(count)
            }
            Err(err) => {
                error!(error = %err, "atomic batch enqueue failed");
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Duration;
    use notiq_delivery::QueueStatus;

    use crate::store::{InMemoryQueueStore, StoreError};

    #[tokio::test]
    async fn enqueue_applies_defaults() {
        let store = Arc::new(InMemoryQueueStore::new());
        let producer = Producer::new(store.clone());

        let item = producer
            .enqueue(NewQueueItem::new(NotificationId::new(), Channel::Email))
            .await
            .unwrap();

        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.attempts, 0);
        assert_eq!(item.max_attempts, 3);
        assert_eq!(item.priority, 0);
        assert_eq!(item.scheduled_for, item.created_at);
        assert_eq!(store.get(item.id).await.unwrap(), Some(item));
    }

    #[tokio::test]
    async fn enqueue_keeps_schedule_and_priority() {
        let producer = Producer::new(InMemoryQueueStore::new());
        let at = Utc::now() + Duration::hours(1);

        let item = producer
            .enqueue(
                NewQueueItem::new(NotificationId::new(), Channel::Push)
                    .scheduled_for(at)
                    .priority(7),
            )
            .await
            .unwrap();

        assert_eq!(item.scheduled_for, at);
        assert_eq!(item.priority, 7);
    }

    #[tokio::test]
    async fn identical_requests_create_distinct_items() {
        let store = Arc::new(InMemoryQueueStore::new());
        let producer = Producer::new(store.clone());
        let request = NewQueueItem::new(NotificationId::new(), Channel::Email);

        let a = producer.enqueue(request.clone()).await.unwrap();
        let b = producer.enqueue(request).await.unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn batch_returns_every_item() {
        let producer = Producer::new(InMemoryQueueStore::new());
        let notification = NotificationId::new();

        let items = producer
            .enqueue_batch(vec![
                NewQueueItem::new(notification, Channel::Email),
                NewQueueItem::new(notification, Channel::Push),
            ])
            .await
            .unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].channel, Channel::Email);
        assert_eq!(items[1].channel, Channel::Push);
    }

    #[tokio::test]
    async fn empty_atomic_batch_is_a_no_op() {
        let store = Arc::new(InMemoryQueueStore::new());
        let producer = Producer::new(store.clone());

        assert_eq!(producer.enqueue_batch_atomic(&[]).await.unwrap(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn atomic_batch_failure_is_returned() {
        struct Broken;

        #[async_trait::async_trait]
        impl QueueStore for Broken {
            async fn insert(&self, _: QueueItem) -> Result<QueueItem, StoreError> {
                Err(StoreError::Storage("down".into()))
            }
            async fn insert_batch_atomic(
                &self,
                _: &[(NotificationId, Channel)],
            ) -> Result<u64, StoreError> {
                Err(StoreError::Storage("procedure failed".into()))
            }
            async fn get(
                &self,
                _: notiq_core::QueueItemId,
            ) -> Result<Option<QueueItem>, StoreError> {
                Ok(None)
            }
            async fn claim_due(
                &self,
                _: chrono::DateTime<Utc>,
                _: usize,
            ) -> Result<crate::store::ClaimBatch, StoreError> {
                Ok(Default::default())
            }
            async fn renew_claim(
                &self,
                _: notiq_core::QueueItemId,
                _: notiq_core::ClaimId,
                _: chrono::DateTime<Utc>,
            ) -> Result<bool, StoreError> {
                Ok(false)
            }
            async fn record_outcome(
                &self,
                _: notiq_core::ClaimId,
                _: &QueueItem,
            ) -> Result<bool, StoreError> {
                Ok(false)
            }
            async fn stats(&self) -> Result<notiq_delivery::QueueStats, StoreError> {
                Ok(Default::default())
            }
            async fn list(
                &self,
                _: &crate::store::QueueFilter,
                pagination: crate::store::Pagination,
            ) -> Result<crate::store::QueuePage, StoreError> {
                Ok(crate::store::QueuePage::new(vec![], 0, pagination))
            }
            async fn reset_failed(
                &self,
                _: notiq_core::QueueItemId,
                _: chrono::DateTime<Utc>,
            ) -> Result<Option<QueueItem>, StoreError> {
                Ok(None)
            }
            async fn cancel_by_notification(
                &self,
                _: NotificationId,
                _: &str,
            ) -> Result<u64, StoreError> {
                Ok(0)
            }
            async fn delete_processed_before(
                &self,
                _: chrono::DateTime<Utc>,
            ) -> Result<u64, StoreError> {
                Ok(0)
            }
            async fn release_stale_claims(
                &self,
                _: chrono::DateTime<Utc>,
                _: chrono::DateTime<Utc>,
            ) -> Result<u64, StoreError> {
                Ok(0)
            }
        }

        let producer = Producer::new(Broken);
        let result = producer
            .enqueue_batch_atomic(&[(NotificationId::new(), Channel::Email)])
            .await;
        assert!(matches!(result, Err(QueueError::Store(StoreError::Storage(_)))));

        let result = producer
            .enqueue(NewQueueItem::new(NotificationId::new(), Channel::Email))
            .await;
        assert!(matches!(result, Err(QueueError::Store(_))));
    }
}
