use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use notiq_core::{ClaimId, NotificationId, QueueItemId, UserId};
use notiq_delivery::{Channel, NewQueueItem, QueueItem, QueueStats, QueueStatus};

use super::query::{Pagination, QueueFilter, QueuePage};
use super::r#trait::{ClaimBatch, QueueStore, StoreError};

/// In-memory queue store.
///
/// Intended for tests/dev. Each operation runs under one lock, which makes
/// claims and batch inserts trivially atomic.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    items: RwLock<HashMap<QueueItemId, QueueItem>>,
    /// Stand-in for the notification table's `user_id` column.
    recipients: RwLock<HashMap<NotificationId, UserId>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record who a notification is addressed to, so listings can filter by user.
    pub fn register_recipient(
        &self,
        notification_id: NotificationId,
        user_id: UserId,
    ) -> Result<(), StoreError> {
        self.recipients
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?
            .insert(notification_id, user_id);
        Ok(())
    }

    /// Number of stored items, regardless of status.
    pub fn len(&self) -> usize {
        self.items.read().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<QueueItemId, QueueItem>>, StoreError> {
        self.items
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<QueueItemId, QueueItem>>, StoreError> {
        self.items
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }
}

/// Claim order: higher priority first, then oldest first.
fn claim_order(a: &QueueItem, b: &QueueItem) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn insert(&self, item: QueueItem) -> Result<QueueItem, StoreError> {
        let mut items = self.write()?;
        if items.contains_key(&item.id) {
            return Err(StoreError::AlreadyExists(item.id));
        }
        items.insert(item.id, item.clone());
        Ok(item)
    }

    async fn insert_batch_atomic(
        &self,
        entries: &[(NotificationId, Channel)],
    ) -> Result<u64, StoreError> {
        let now = Utc::now();
        let batch: Vec<QueueItem> = entries
            .iter()
            .map(|(notification_id, channel)| {
                QueueItem::new(NewQueueItem::new(*notification_id, *channel), now)
            })
            .collect();

        let mut items = self.write()?;
        if let Some(dup) = batch.iter().find(|i| items.contains_key(&i.id)) {
            return Err(StoreError::AlreadyExists(dup.id));
        }

        let inserted = batch.len() as u64;
        items.extend(batch.into_iter().map(|i| (i.id, i)));
        Ok(inserted)
    }

    async fn get(&self, id: QueueItemId) -> Result<Option<QueueItem>, StoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<ClaimBatch, StoreError> {
        let mut items = self.write()?;

        let mut waiting: Vec<&QueueItem> =
            items.values().filter(|i| i.status.is_awaiting()).collect();
        waiting.sort_by(|a, b| claim_order(a, b));
        let deferred = waiting
            .iter()
            .take(limit)
            .filter(|i| i.is_deferred(now))
            .count() as u64;
        let ids: Vec<QueueItemId> = waiting
            .into_iter()
            .filter(|i| i.is_due(now))
            .take(limit)
            .map(|i| i.id)
            .collect();

        let claim = ClaimId::new();
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = items.get_mut(&id) {
                item.mark_claimed(claim, now);
                claimed.push(item.clone());
            }
        }

        Ok(ClaimBatch {
            claim,
            items: claimed,
            deferred,
        })
    }

    async fn renew_claim(
        &self,
        id: QueueItemId,
        claim: ClaimId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut items = self.write()?;
        match items.get_mut(&id) {
            Some(current) if current.is_claimed_by(claim) => {
                current.last_attempt_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_outcome(&self, claim: ClaimId, item: &QueueItem) -> Result<bool, StoreError> {
        let mut items = self.write()?;
        match items.get_mut(&item.id) {
            Some(current) if current.is_claimed_by(claim) => {
                *current = QueueItem {
                    claim_id: None,
                    ..item.clone()
                };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let items = self.read()?;
        Ok(items.values().map(|i| (i.status, 1)).collect())
    }

    async fn list(
        &self,
        filter: &QueueFilter,
        pagination: Pagination,
    ) -> Result<QueuePage, StoreError> {
        let items = self.read()?;
        let recipients = self
            .recipients
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;

        let mut matching: Vec<&QueueItem> = items
            .values()
            .filter(|i| filter.status.is_none_or(|s| i.status == s))
            .filter(|i| filter.channel.is_none_or(|c| i.channel == c))
            .filter(|i| {
                filter
                    .user_id
                    .is_none_or(|u| recipients.get(&i.notification_id) == Some(&u))
            })
            .collect();

        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .cloned()
            .collect();

        Ok(QueuePage::new(page, total, pagination))
    }

    async fn reset_failed(
        &self,
        id: QueueItemId,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, StoreError> {
        let mut items = self.write()?;
        match items.get_mut(&id) {
            Some(item) if item.status == QueueStatus::Failed => {
                item.reset_for_retry(now);
                Ok(Some(item.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn cancel_by_notification(
        &self,
        notification_id: NotificationId,
        reason: &str,
    ) -> Result<u64, StoreError> {
        let mut items = self.write()?;
        let mut cancelled = 0;
        for item in items
            .values_mut()
            .filter(|i| i.notification_id == notification_id && i.status.is_awaiting())
        {
            item.cancel(reason);
            cancelled += 1;
        }
        Ok(cancelled)
    }

    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut items = self.write()?;
        let before = items.len();
        items.retain(|_, i| !(i.is_terminal() && i.processed_at() < cutoff));
        Ok((before - items.len()) as u64)
    }

    async fn release_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut items = self.write()?;
        let mut released = 0;
        for item in items.values_mut().filter(|i| {
            i.status == QueueStatus::Processing
                && i.last_attempt_at.is_some_and(|at| at < claimed_before)
        }) {
            item.release_claim(now);
            released += 1;
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn item(channel: Channel, now: DateTime<Utc>) -> QueueItem {
        QueueItem::new(NewQueueItem::new(NotificationId::new(), channel), now)
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids() {
        let store = InMemoryQueueStore::new();
        let it = item(Channel::Email, Utc::now());

        store.insert(it.clone()).await.unwrap();
        assert!(matches!(
            store.insert(it).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_fifo() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();

        let mut oldest = item(Channel::Email, now - Duration::minutes(3));
        oldest.scheduled_for = now;
        let mut newer = item(Channel::Email, now - Duration::minutes(2));
        newer.scheduled_for = now;
        let mut urgent = item(Channel::Push, now - Duration::minutes(1));
        urgent.scheduled_for = now;
        urgent.priority = 5;

        for i in [&newer, &urgent, &oldest] {
            store.insert(i.clone()).await.unwrap();
        }

        let batch = store.claim_due(now, 10).await.unwrap();
        let order: Vec<_> = batch.items.iter().map(|i| i.id).collect();
        assert_eq!(order, vec![urgent.id, oldest.id, newer.id]);
        assert!(batch.items.iter().all(|i| i.status == QueueStatus::Processing));
    }

    #[tokio::test]
    async fn claimed_items_cannot_be_claimed_again() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        store.insert(item(Channel::Email, now)).await.unwrap();

        assert_eq!(store.claim_due(now, 10).await.unwrap().items.len(), 1);
        assert!(store.claim_due(now, 10).await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn deferred_count_is_bounded_by_the_limit() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        for _ in 0..5 {
            let mut later = item(Channel::Push, now);
            later.scheduled_for = now + Duration::hours(1);
            store.insert(later).await.unwrap();
        }

        let batch = store.claim_due(now, 1).await.unwrap();
        assert!(batch.items.is_empty());
        assert_eq!(batch.deferred, 1);

        let batch = store.claim_due(now, 3).await.unwrap();
        assert_eq!(batch.deferred, 3);
    }

    #[tokio::test]
    async fn deferred_items_do_not_block_due_ones() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        let mut urgent_later = item(Channel::Email, now - Duration::minutes(2));
        urgent_later.scheduled_for = now + Duration::hours(1);
        urgent_later.priority = 9;
        let due = item(Channel::Email, now - Duration::minutes(1));
        store.insert(urgent_later).await.unwrap();
        store.insert(due.clone()).await.unwrap();

        let batch = store.claim_due(now, 1).await.unwrap();
        assert_eq!(batch.deferred, 1);
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.items[0].id, due.id);
    }

    #[tokio::test]
    async fn claim_counts_but_skips_deferred_items() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        let mut later = item(Channel::Email, now);
        later.scheduled_for = now + Duration::minutes(5);
        store.insert(later.clone()).await.unwrap();

        let batch = store.claim_due(now, 10).await.unwrap();
        assert!(batch.items.is_empty());
        assert_eq!(batch.deferred, 1);
        assert_eq!(
            store.get(later.id).await.unwrap().unwrap().status,
            QueueStatus::Pending
        );
    }

    #[tokio::test]
    async fn record_outcome_requires_processing() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        let mut it = item(Channel::Push, now);
        store.insert(it.clone()).await.unwrap();

        it.status = QueueStatus::Sent;
        assert!(!store.record_outcome(ClaimId::new(), &it).await.unwrap());
        assert_eq!(
            store.get(it.id).await.unwrap().unwrap().status,
            QueueStatus::Pending
        );
    }

    #[tokio::test]
    async fn atomic_batch_inserts_pending_items() {
        let store = InMemoryQueueStore::new();
        let entries = vec![
            (NotificationId::new(), Channel::Email),
            (NotificationId::new(), Channel::Push),
        ];

        assert_eq!(store.insert_batch_atomic(&entries).await.unwrap(), 2);
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.get(QueueStatus::Pending), 2);
    }

    #[tokio::test]
    async fn stale_claims_are_released() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        store.insert(item(Channel::Email, now)).await.unwrap();
        store.claim_due(now, 10).await.unwrap();

        let later = now + Duration::minutes(20);
        let released = store
            .release_stale_claims(later - Duration::minutes(15), later)
            .await
            .unwrap();

        assert_eq!(released, 1);
        assert_eq!(store.claim_due(later, 10).await.unwrap().items.len(), 1);
    }

    #[tokio::test]
    async fn superseded_claim_cannot_renew_or_record() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        let it = item(Channel::Email, now);
        store.insert(it.clone()).await.unwrap();

        let first = store.claim_due(now, 10).await.unwrap();
        let later = now + Duration::minutes(20);
        store
            .release_stale_claims(later - Duration::minutes(15), later)
            .await
            .unwrap();
        let second = store.claim_due(later, 10).await.unwrap();
        assert_ne!(first.claim, second.claim);

        assert!(!store.renew_claim(it.id, first.claim, later).await.unwrap());
        let mut stale_outcome = first.items[0].clone();
        stale_outcome.status = QueueStatus::Sent;
        assert!(!store.record_outcome(first.claim, &stale_outcome).await.unwrap());
        let current = store.get(it.id).await.unwrap().unwrap();
        assert!(current.is_claimed_by(second.claim));

        assert!(store.renew_claim(it.id, second.claim, later).await.unwrap());
        let mut outcome = second.items[0].clone();
        outcome.status = QueueStatus::Sent;
        assert!(store.record_outcome(second.claim, &outcome).await.unwrap());
        let stored = store.get(it.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Sent);
        assert!(stored.claim_id.is_none());
    }

    #[tokio::test]
    async fn renewal_restarts_the_stale_clock() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        let it = item(Channel::Push, now);
        store.insert(it.clone()).await.unwrap();
        let batch = store.claim_due(now, 10).await.unwrap();

        let later = now + Duration::minutes(20);
        assert!(store.renew_claim(it.id, batch.claim, later).await.unwrap());
        let released = store
            .release_stale_claims(later - Duration::minutes(15), later)
            .await
            .unwrap();
        assert_eq!(released, 0);
    }
}
