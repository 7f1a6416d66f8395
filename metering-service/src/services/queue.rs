//! Durable queue of usage records that still have to be billed.
//!
//! The queue holds exactly one generation of outstanding records: every
//! write replaces the whole contents. Reads are keyset-paginated by the
//! monotonic row id.

use crate::models::{FailurePage, FailureRecord, UsageFailure};
use crate::services::metrics::DB_QUERY_DURATION;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::PgPool;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::{info, instrument};

#[async_trait]
pub trait FailureQueue: Send + Sync {
    /// Atomically replace the queue contents with `failures`, in order.
    async fn seed(&self, failures: &[UsageFailure]) -> Result<(), AppError>;

    /// Atomically remove every record.
    async fn clear(&self) -> Result<(), AppError>;

    /// Up to `limit` records with an id greater than `cursor`, ascending.
    async fn next_page(&self, cursor: Option<i64>, limit: usize) -> Result<FailurePage, AppError>;

    /// Every record, ascending by id.
    async fn list_all(&self) -> Result<Vec<FailureRecord>, AppError>;

    async fn count(&self) -> Result<usize, AppError>;
}

/// Ordered, finite walk over the queue in fixed-size pages.
///
/// Each `FailurePages` starts from the lowest id, so creating a new one
/// restarts the scan.
pub struct FailurePages<'a> {
    queue: &'a dyn FailureQueue,
    limit: usize,
    cursor: Option<i64>,
    done: bool,
}

impl<'a> FailurePages<'a> {
    pub fn new(queue: &'a dyn FailureQueue, limit: usize) -> Self {
        Self {
            queue,
            limit: limit.max(1),
            cursor: None,
            done: false,
        }
    }

    /// The next non-empty page, or `None` once the queue is exhausted.
    pub async fn next(&mut self) -> Result<Option<Vec<FailureRecord>>, AppError> {
        if self.done {
            return Ok(None);
        }

        let page = self.queue.next_page(self.cursor, self.limit).await?;
        match page.next_cursor {
            Some(cursor) => self.cursor = Some(cursor),
            None => self.done = true,
        }

        if page.records.is_empty() {
            self.done = true;
            return Ok(None);
        }
        Ok(Some(page.records))
    }
}

fn page_from(records: Vec<FailureRecord>, limit: usize) -> FailurePage {
    let next_cursor = if records.len() >= limit {
        records.last().map(|r| r.id)
    } else {
        None
    };
    FailurePage {
        records,
        next_cursor,
    }
}

/// PostgreSQL text columns cannot hold NUL; the in-memory queue refuses the
/// same rows.
fn check_storable(text: &str) -> Result<(), AppError> {
    if text.contains('\0') {
        return Err(AppError::DatabaseError(anyhow::anyhow!(
            "invalid byte sequence for encoding \"UTF8\": 0x00"
        )));
    }
    Ok(())
}

fn serialize_payload(failure: &UsageFailure) -> Result<String, AppError> {
    failure.payload.to_json().map_err(|e| {
        AppError::InternalError(anyhow::anyhow!("Failed to serialize usage payload: {}", e))
    })
}

// =============================================================================
// PostgreSQL
// =============================================================================

/// Failure queue stored in the broker's `billing_failure` table.
///
/// `create_date`/`update_date` are zone-less and hold UTC.
#[derive(Clone)]
pub struct PgFailureQueue {
    pool: PgPool,
}

impl PgFailureQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FailureQueue for PgFailureQueue {
    #[instrument(skip(self, failures), fields(records = failures.len()))]
    async fn seed(&self, failures: &[UsageFailure]) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["seed_failures"])
            .start_timer();

        let mut payloads = Vec::with_capacity(failures.len());
        let mut messages = Vec::with_capacity(failures.len());
        let mut created: Vec<DateTime<Utc>> = Vec::with_capacity(failures.len());
        let mut updated: Vec<DateTime<Utc>> = Vec::with_capacity(failures.len());
        for failure in failures {
            payloads.push(serialize_payload(failure)?);
            messages.push(failure.message.clone());
            created.push(failure.created_utc);
            updated.push(failure.updated_utc);
        }

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        sqlx::query("DELETE FROM billing_failure")
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to clear billing failures: {}", e))
            })?;

        if !failures.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO billing_failure (payload, message, create_date, update_date)
                SELECT payload, message, created_utc AT TIME ZONE 'UTC', updated_utc AT TIME ZONE 'UTC'
                FROM UNNEST($1::text[], $2::text[], $3::timestamptz[], $4::timestamptz[])
                    AS t(payload, message, created_utc, updated_utc)
                "#,
            )
            .bind(&payloads)
            .bind(&messages)
            .bind(&created)
            .bind(&updated)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to insert billing failures: {}", e))
            })?;
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit billing failures: {}", e))
        })?;

        timer.observe_duration();
        info!(records = failures.len(), "Billing failure queue seeded");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn clear(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["clear_failures"])
            .start_timer();

        let result = sqlx::query("DELETE FROM billing_failure")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to clear billing failures: {}", e))
            })?;

        timer.observe_duration();
        info!(removed = result.rows_affected(), "Billing failure queue cleared");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn next_page(&self, cursor: Option<i64>, limit: usize) -> Result<FailurePage, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["page_failures"])
            .start_timer();

        let limit = limit.max(1);
        let records = sqlx::query_as::<_, FailureRecord>(
            r#"
            SELECT id::BIGINT AS id,
                   payload,
                   message,
                   create_date AT TIME ZONE 'UTC' AS created_utc,
                   update_date AT TIME ZONE 'UTC' AS updated_utc
            FROM billing_failure
            WHERE id > $1
            ORDER BY id ASC
            LIMIT $2
            "#,
        )
        .bind(cursor.unwrap_or(0))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to page billing failures: {}", e))
        })?;

        timer.observe_duration();
        Ok(page_from(records, limit))
    }

    #[instrument(skip(self))]
    async fn list_all(&self) -> Result<Vec<FailureRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_failures"])
            .start_timer();

        let records = sqlx::query_as::<_, FailureRecord>(
            r#"
            SELECT id::BIGINT AS id,
                   payload,
                   message,
                   create_date AT TIME ZONE 'UTC' AS created_utc,
                   update_date AT TIME ZONE 'UTC' AS updated_utc
            FROM billing_failure
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list billing failures: {}", e))
        })?;

        timer.observe_duration();
        Ok(records)
    }

    #[instrument(skip(self))]
    async fn count(&self) -> Result<usize, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM billing_failure")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to count billing failures: {}", e))
            })?;

        Ok(usize::try_from(count).unwrap_or(0))
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Default)]
struct InMemoryState {
    last_id: i64,
    rows: BTreeMap<i64, FailureRecord>,
}

/// Process-local failure queue with the same replace/page semantics as the
/// PostgreSQL table. Ids keep increasing across seeds.
#[derive(Default)]
pub struct InMemoryFailureQueue {
    state: RwLock<InMemoryState>,
}

impl InMemoryFailureQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a row exactly as stored, without checking that the payload
    /// decodes. Returns the new row id.
    pub async fn push_record(&self, payload: impl Into<String>, message: impl Into<String>) -> i64 {
        let mut state = self.state.write().await;
        state.last_id += 1;
        let id = state.last_id;
        let now = Utc::now();
        state.rows.insert(
            id,
            FailureRecord {
                id,
                payload: payload.into(),
                message: message.into(),
                created_utc: now,
                updated_utc: now,
            },
        );
        id
    }
}

#[async_trait]
impl FailureQueue for InMemoryFailureQueue {
    async fn seed(&self, failures: &[UsageFailure]) -> Result<(), AppError> {
        let mut rows = BTreeMap::new();
        let mut state = self.state.write().await;
        let mut last_id = state.last_id;

        // Rows are staged and swapped in whole; a bad row leaves the
        // previous generation untouched.
        for failure in failures {
            let payload = serialize_payload(failure)?;
            check_storable(&payload)?;
            check_storable(&failure.message)?;

            last_id += 1;
            rows.insert(
                last_id,
                FailureRecord {
                    id: last_id,
                    payload,
                    message: failure.message.clone(),
                    created_utc: failure.created_utc,
                    updated_utc: failure.updated_utc,
                },
            );
        }

        state.last_id = last_id;
        state.rows = rows;
        Ok(())
    }

    async fn clear(&self) -> Result<(), AppError> {
        self.state.write().await.rows.clear();
        Ok(())
    }

    async fn next_page(&self, cursor: Option<i64>, limit: usize) -> Result<FailurePage, AppError> {
        let limit = limit.max(1);
        let state = self.state.read().await;
        let after = cursor.unwrap_or(0);
        let records = state
            .rows
            .range(after.saturating_add(1)..)
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect();
        Ok(page_from(records, limit))
    }

    async fn list_all(&self) -> Result<Vec<FailureRecord>, AppError> {
        Ok(self.state.read().await.rows.values().cloned().collect())
    }

    async fn count(&self) -> Result<usize, AppError> {
        Ok(self.state.read().await.rows.len())
    }
}
