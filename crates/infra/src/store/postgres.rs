//! Postgres-backed queue store.
//!
//! ## Claiming
//!
//! `claim_due` runs in one transaction: it selects due rows with
//! `FOR UPDATE SKIP LOCKED` and flips them to `processing` under a fresh
//! `claim_id` before committing, so concurrent workers skip rows another worker
//! is claiming and never see a claimed row as eligible again. Renewals and
//! outcome writes are conditioned on that `claim_id`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (insert) / `Storage` |
//! | Database (check constraint violation) | `23514` | `InvalidRow` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use notiq_core::{ClaimId, NotificationId, QueueItemId};
use notiq_delivery::{Channel, QueueItem, QueueStats, QueueStatus};

use super::query::{Pagination, QueueFilter, QueuePage};
use super::r#trait::{ClaimBatch, QueueStore, StoreError};

/// Schema for the queue table and the batch-admission function.
const SCHEMA: &str = include_str!("../../migrations/0001_notification_queue.sql");

const COLUMNS: &str = "id, notification_id, channel, status, attempts, max_attempts, priority, \
                       scheduled_for, last_attempt_at, error_message, created_at, claim_id";

/// Postgres-backed queue store.
///
/// Uses the SQLx connection pool, which is `Send + Sync`; clones share the pool.
#[derive(Debug, Clone)]
pub struct PostgresQueueStore {
    pool: Arc<PgPool>,
}

impl PostgresQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect to `database_url` with a default pool.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the queue table, indexes and `enqueue_notification_batch`.
    ///
    /// Idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    #[instrument(skip(self, item), fields(item_id = %item.id, channel = %item.channel), err)]
    async fn insert(&self, item: QueueItem) -> Result<QueueItem, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO notification_queue ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(item.id.as_uuid())
        .bind(item.notification_id.as_uuid())
        .bind(item.channel.as_str())
        .bind(item.status.as_str())
        .bind(item.attempts as i32)
        .bind(item.max_attempts as i32)
        .bind(item.priority)
        .bind(item.scheduled_for)
        .bind(item.last_attempt_at)
        .bind(&item.error_message)
        .bind(item.created_at)
        .bind(item.claim_id.map(|c| *c.as_uuid()))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(item.id)
            } else {
                map_sqlx_error("insert", e)
            }
        })?;

        decode_row(&row)
    }

    #[instrument(skip(self, entries), fields(batch_size = entries.len()), err)]
    async fn insert_batch_atomic(
        &self,
        entries: &[(NotificationId, Channel)],
    ) -> Result<u64, StoreError> {
        let notification_ids: Vec<Uuid> = entries.iter().map(|(n, _)| *n.as_uuid()).collect();
        let channels: Vec<&str> = entries.iter().map(|(_, c)| c.as_str()).collect();

        let row = sqlx::query("SELECT enqueue_notification_batch($1, $2) AS inserted")
            .bind(&notification_ids)
            .bind(&channels)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("enqueue_notification_batch", e))?;

        let inserted: Option<i32> = row
            .try_get("inserted")
            .map_err(|e| StoreError::InvalidRow(format!("failed to read inserted count: {e}")))?;

        Ok(inserted.unwrap_or(0).max(0) as u64)
    }

    #[instrument(skip(self), fields(item_id = %id), err)]
    async fn get(&self, id: QueueItemId) -> Result<Option<QueueItem>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM notification_queue WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<ClaimBatch, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        // Counted before claiming so the window matches the claim order.
        let deferred: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM (
                SELECT scheduled_for
                FROM notification_queue
                WHERE status IN ('pending', 'retry')
                ORDER BY priority DESC, created_at ASC
                LIMIT $2
            ) head
            WHERE head.scheduled_for > $1
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("count_deferred", e))?;

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM notification_queue
            WHERE status IN ('pending', 'retry')
              AND scheduled_for <= $1
            ORDER BY priority DESC, created_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("select_due", e))?;

        let claim = ClaimId::new();
        let rows = if ids.is_empty() {
            Vec::new()
        } else {
            sqlx::query(&format!(
                r#"
                UPDATE notification_queue
                SET status = 'processing', last_attempt_at = $2, claim_id = $3
                WHERE id = ANY($1)
                RETURNING {COLUMNS}
                "#
            ))
            .bind(&ids)
            .bind(now)
            .bind(claim.as_uuid())
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("mark_processing", e))?
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        // RETURNING has no defined order.
        let mut items = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
        items.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });

        Ok(ClaimBatch {
            claim,
            items,
            deferred: deferred.max(0) as u64,
        })
    }

    #[instrument(skip(self, claim), fields(item_id = %id, claim_id = %claim), err)]
    async fn renew_claim(
        &self,
        id: QueueItemId,
        claim: ClaimId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE notification_queue
            SET last_attempt_at = $3
            WHERE id = $1 AND status = 'processing' AND claim_id = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(claim.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew_claim", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(
        skip(self, claim, item),
        fields(item_id = %item.id, claim_id = %claim, status = %item.status),
        err
    )]
    async fn record_outcome(&self, claim: ClaimId, item: &QueueItem) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE notification_queue
            SET status = $3,
                attempts = $4,
                scheduled_for = $5,
                last_attempt_at = $6,
                error_message = $7,
                claim_id = NULL
            WHERE id = $1 AND status = 'processing' AND claim_id = $2
            "#,
        )
        .bind(item.id.as_uuid())
        .bind(claim.as_uuid())
        .bind(item.status.as_str())
        .bind(item.attempts as i32)
        .bind(item.scheduled_for)
        .bind(item.last_attempt_at)
        .bind(&item.error_message)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_outcome", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM notification_queue GROUP BY status",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = QueueStats::new();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| StoreError::InvalidRow(format!("failed to read status: {e}")))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| StoreError::InvalidRow(format!("failed to read count: {e}")))?;
            let status: QueueStatus = status
                .parse()
                .map_err(|e| StoreError::InvalidRow(format!("{e}")))?;
            stats.record(status, count.max(0) as u64);
        }
        Ok(stats)
    }

    #[instrument(skip(self), err)]
    async fn list(
        &self,
        filter: &QueueFilter,
        pagination: Pagination,
    ) -> Result<QueuePage, StoreError> {
        // The notifications table belongs to the notification API; only touch
        // it when a user filter is requested.
        let user_clause = if filter.user_id.is_some() {
            "AND EXISTS (SELECT 1 FROM notifications n WHERE n.id = q.notification_id AND n.user_id = $3)"
        } else {
            "AND $3::uuid IS NULL"
        };
        let where_clause = format!(
            r#"
            WHERE ($1::text IS NULL OR q.status = $1)
              AND ($2::text IS NULL OR q.channel = $2)
              {user_clause}
            "#
        );

        let status_param = filter.status.map(|s| s.as_str());
        let channel_param = filter.channel.map(|c| c.as_str());
        let user_param = filter.user_id.map(|u| *u.as_uuid());

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM notification_queue q {where_clause}"
        ))
        .bind(status_param)
        .bind(channel_param)
        .bind(user_param)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_items", e))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM notification_queue q
            {where_clause}
            ORDER BY q.created_at DESC, q.id DESC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(status_param)
        .bind(channel_param)
        .bind(user_param)
        .bind(i64::from(pagination.limit))
        .bind(i64::from(pagination.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_items", e))?;

        let items = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
        Ok(QueuePage::new(items, total.max(0) as u64, pagination))
    }

    #[instrument(skip(self), fields(item_id = %id), err)]
    async fn reset_failed(
        &self,
        id: QueueItemId,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE notification_queue
            SET status = 'retry', attempts = 0, scheduled_for = $2, error_message = NULL
            WHERE id = $1 AND status = 'failed'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reset_failed", e))?;

        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(skip(self), fields(notification_id = %notification_id), err)]
    async fn cancel_by_notification(
        &self,
        notification_id: NotificationId,
        reason: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE notification_queue
            SET status = 'failed', error_message = $2
            WHERE notification_id = $1 AND status IN ('pending', 'retry')
            "#,
        )
        .bind(notification_id.as_uuid())
        .bind(reason)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("cancel_by_notification", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM notification_queue
            WHERE status IN ('sent', 'failed')
              AND COALESCE(last_attempt_at, created_at) < $1
            "#,
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_processed_before", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn release_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE notification_queue
            SET status = 'retry', scheduled_for = $2, claim_id = NULL
            WHERE status = 'processing' AND last_attempt_at < $1
            "#,
        )
        .bind(claimed_before)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_stale_claims", e))?;

        Ok(result.rows_affected())
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Check constraint violation
                Some("23514") => StoreError::InvalidRow(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<QueueItem, StoreError> {
    let raw = QueueItemRow::from_row(row)
        .map_err(|e| StoreError::InvalidRow(format!("failed to deserialize queue row: {e}")))?;
    raw.try_into()
}

// SQLx row types

#[derive(Debug)]
struct QueueItemRow {
    id: Uuid,
    notification_id: Uuid,
    channel: String,
    status: String,
    attempts: i32,
    max_attempts: i32,
    priority: i32,
    scheduled_for: DateTime<Utc>,
    last_attempt_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    claim_id: Option<Uuid>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for QueueItemRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(QueueItemRow {
            id: row.try_get("id")?,
            notification_id: row.try_get("notification_id")?,
            channel: row.try_get("channel")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            priority: row.try_get("priority")?,
            scheduled_for: row.try_get("scheduled_for")?,
            last_attempt_at: row.try_get("last_attempt_at")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            claim_id: row.try_get("claim_id")?,
        })
    }
}

impl TryFrom<QueueItemRow> for QueueItem {
    type Error = StoreError;

    fn try_from(row: QueueItemRow) -> Result<Self, Self::Error> {
        let channel: Channel = row
            .channel
            .parse()
            .map_err(|e| StoreError::InvalidRow(format!("item {}: {e}", row.id)))?;
        let status: QueueStatus = row
            .status
            .parse()
            .map_err(|e| StoreError::InvalidRow(format!("item {}: {e}", row.id)))?;

        Ok(QueueItem {
            id: QueueItemId::from_uuid(row.id),
            notification_id: NotificationId::from_uuid(row.notification_id),
            channel,
            status,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            priority: row.priority,
            scheduled_for: row.scheduled_for,
            last_attempt_at: row.last_attempt_at,
            error_message: row.error_message,
            created_at: row.created_at,
            claim_id: row.claim_id.map(ClaimId::from_uuid),
        })
    }
}
