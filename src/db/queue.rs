use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::types::PgInterval;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::item::{ImageQueueItem, ItemStatus};
use crate::pipeline::{QueueStore, RecoverOutcome};

/// Postgres-backed durable queue store.
///
/// Batch-pop atomicity comes from `FOR UPDATE SKIP LOCKED`: concurrent
/// pops never return overlapping rows. Popped rows move to `in_flight`
/// with a lease; rows whose lease expires are swept back to `pending`
/// so a crash between pop and completion cannot lose an item.
pub struct PgQueueStore {
    pool: PgPool,
    max_attempts: i32,
    lease_interval: PgInterval,
}

impl PgQueueStore {
    pub fn new(
        pool: PgPool,
        max_attempts: i32,
        visibility_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let lease_interval = PgInterval::try_from(visibility_timeout)
            .map_err(|e| QueueError::Config(e.to_string()))?;
        Ok(Self {
            pool,
            max_attempts,
            lease_interval,
        })
    }

    /// Insert a new pending item. The HTTP layer owns enqueueing in
    /// production; this exists for tooling and integration tests.
    pub async fn enqueue(
        &self,
        item_id: Uuid,
        user_id: Uuid,
        latitude: f64,
        longitude: f64,
        altitude: f64,
        bearing: f64,
    ) -> Result<ImageQueueItem, QueueError> {
        let row = sqlx::query(
            r#"
            INSERT INTO image_queue (item_id, user_id, latitude, longitude, altitude, bearing)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, item_id, user_id, latitude, longitude, altitude, bearing,
                      attempts, created_at
            "#,
        )
        .bind(item_id)
        .bind(user_id)
        .bind(latitude)
        .bind(longitude)
        .bind(altitude)
        .bind(bearing)
        .fetch_one(&self.pool)
        .await?;

        Ok(parse_item(&row)?)
    }

    /// Current status of a row, or `None` if it was deleted.
    pub async fn status(&self, row_id: i64) -> Result<Option<ItemStatus>, QueueError> {
        let row = sqlx::query("SELECT status FROM image_queue WHERE id = $1")
            .bind(row_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => {
                let status: String = r.try_get("status").map_err(QueueError::Database)?;
                Ok(ItemStatus::parse(&status))
            }
            None => Ok(None),
        }
    }

    pub async fn pending_count(&self) -> Result<i64, QueueError> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM image_queue WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0)
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn pop_batch(&self, limit: u32) -> Result<Vec<ImageQueueItem>, QueueError> {
        let rows = sqlx::query(
            r#"
            UPDATE image_queue
            SET status = 'in_flight', leased_until = NOW() + $2
            WHERE id IN (
                SELECT id FROM image_queue
                WHERE status = 'pending'
                ORDER BY created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, item_id, user_id, latitude, longitude, altitude, bearing,
                      attempts, created_at
            "#,
        )
        .bind(i64::from(limit))
        .bind(&self.lease_interval)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(parse_item(row)?);
        }
        // The inner select is ordered but UPDATE..RETURNING is not;
        // re-sort so the dispatcher sees oldest-first.
        items.sort_by_key(|item| item.created_at);
        Ok(items)
    }

    async fn recover(&self, row_id: i64) -> Result<RecoverOutcome, QueueError> {
        let row = sqlx::query(
            r#"
            UPDATE image_queue
            SET attempts = attempts + 1,
                status = CASE WHEN attempts + 1 >= $2 THEN 'dead' ELSE 'pending' END,
                leased_until = NULL
            WHERE id = $1 AND status = 'in_flight'
            RETURNING status
            "#,
        )
        .bind(row_id)
        .bind(self.max_attempts)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => {
                let status: String = r.try_get("status").map_err(QueueError::Database)?;
                if status == ItemStatus::Dead.as_str() {
                    Ok(RecoverOutcome::Dead)
                } else {
                    Ok(RecoverOutcome::Requeued)
                }
            }
            // Not in-flight (already recovered, deleted, or never
            // popped): nothing to do, recovery stays idempotent.
            None => Ok(RecoverOutcome::Requeued),
        }
    }

    async fn delete(&self, row_id: i64) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM image_queue WHERE id = $1")
            .bind(row_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn requeue_expired(&self) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE image_queue
            SET status = 'pending', leased_until = NULL
            WHERE status = 'in_flight' AND leased_until < NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn parse_item(row: &sqlx::postgres::PgRow) -> Result<ImageQueueItem, sqlx::Error> {
    Ok(ImageQueueItem {
        row_id: row.try_get("id")?,
        item_id: row.try_get("item_id")?,
        user_id: row.try_get("user_id")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        altitude: row.try_get("altitude")?,
        bearing: row.try_get("bearing")?,
        attempts: row.try_get("attempts")?,
        created_at: row.try_get("created_at")?,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid queue configuration: {0}")]
    Config(String),

    #[error("queue store unavailable: {0}")]
    Unavailable(String),
}
