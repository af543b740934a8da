//! `PostgreSQL` implementation of the `ChangeStore` trait.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use cairn_core::clock::{Clock, SystemClock};
use cairn_core::error::DomainError;
use cairn_core::serializer::{JsonSerializer, StateSerializer};
use cairn_core::store::{ChangeStore, StoredChange};

use crate::memory::DEFAULT_STREAM_TTL_SECS;
use crate::schema::CREATE_CHANGES_TABLES;

pub(crate) fn db_error(err: sqlx::Error) -> DomainError {
    DomainError::Infrastructure(format!("database error: {err}"))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn change_from_row(row: &PgRow) -> Result<StoredChange, sqlx::Error> {
    Ok(StoredChange {
        change_id: row.try_get("change_id")?,
        aggregate_id: row.try_get("aggregate_id")?,
        aggregate_type: row.try_get("aggregate_type")?,
        root_id: row.try_get("root_id")?,
        change_type: row.try_get("change_type")?,
        payload: row.try_get("payload")?,
        sequence_number: row.try_get("sequence_number")?,
        correlation_id: row.try_get("correlation_id")?,
        causation_id: row.try_get("causation_id")?,
        occurred_at: row.try_get("occurred_at")?,
    })
}

/// PostgreSQL-backed change store.
#[derive(Clone)]
pub struct PgChangeStore {
    pool: PgPool,
    serializer: Arc<dyn StateSerializer>,
    clock: Arc<dyn Clock>,
    ttl: TimeDelta,
}

impl PgChangeStore {
    /// Creates a new `PgChangeStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            serializer: Arc::new(JsonSerializer),
            clock: Arc::new(SystemClock),
            ttl: TimeDelta::seconds(DEFAULT_STREAM_TTL_SECS),
        }
    }

    /// Overrides the clock used to stamp stream activity.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Overrides the expiry window used by `get_expired`.
    #[must_use]
    pub fn with_ttl(mut self, ttl: TimeDelta) -> Self {
        self.ttl = ttl;
        self
    }

    /// Apply the change log schema (idempotent).
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the DDL fails.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), DomainError> {
        sqlx::raw_sql(CREATE_CHANGES_TABLES)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }
}

impl std::fmt::Debug for PgChangeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgChangeStore")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ChangeStore for PgChangeStore {
    fn serializer(&self) -> &dyn StateSerializer {
        self.serializer.as_ref()
    }

    #[tracing::instrument(skip(self, changes), fields(change_count = changes.len()))]
    async fn append(
        &self,
        aggregate_id: Uuid,
        changes: Vec<StoredChange>,
        expected_version: Option<i64>,
    ) -> Result<Vec<StoredChange>, DomainError> {
        let Some(first) = changes.first() else {
            return Ok(Vec::new());
        };
        let first_sequence = first.sequence_number;
        let now = self.clock.now();

        let mut tx = self.pool.begin().await.map_err(db_error)?;

        sqlx::query(
            r"
            INSERT INTO change_streams (aggregate_id, aggregate_type, last_active_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (aggregate_id) DO NOTHING
            ",
        )
        .bind(aggregate_id)
        .bind(&first.aggregate_type)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        let boxed: bool =
            sqlx::query_scalar("SELECT boxed FROM change_streams WHERE aggregate_id = $1 FOR UPDATE")
                .bind(aggregate_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_error)?;
        if boxed {
            return Err(DomainError::Validation(format!(
                "aggregate {aggregate_id} is boxed"
            )));
        }

        let last: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(sequence_number) FROM aggregate_changes WHERE aggregate_id = $1 AND NOT boxed",
        )
        .bind(aggregate_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;
        let head = last.unwrap_or(first_sequence - 1);

        if let Some(expected) = expected_version {
            if expected != head {
                return Err(DomainError::ConcurrencyConflict {
                    aggregate_id,
                    expected,
                    actual: head,
                });
            }
        }
        if first_sequence != head + 1 {
            return Err(DomainError::ConcurrencyConflict {
                aggregate_id,
                expected: first_sequence - 1,
                actual: head,
            });
        }

        for change in &changes {
            let inserted = sqlx::query(
                r"
                INSERT INTO aggregate_changes (
                    change_id, aggregate_id, aggregate_type, root_id, change_type, payload,
                    sequence_number, correlation_id, causation_id, occurred_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ",
            )
            .bind(change.change_id)
            .bind(aggregate_id)
            .bind(&change.aggregate_type)
            .bind(change.root_id)
            .bind(&change.change_type)
            .bind(&change.payload)
            .bind(change.sequence_number)
            .bind(change.correlation_id)
            .bind(change.causation_id)
            .bind(change.occurred_at)
            .execute(&mut *tx)
            .await;

            if let Err(err) = inserted {
                if is_unique_violation(&err) {
                    return Err(DomainError::ConcurrencyConflict {
                        aggregate_id,
                        expected: change.sequence_number - 1,
                        actual: head,
                    });
                }
                return Err(db_error(err));
            }
        }

        sqlx::query("UPDATE change_streams SET last_active_at = $2 WHERE aggregate_id = $1")
            .bind(aggregate_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        tracing::debug!(first_sequence, "changes appended");
        Ok(changes)
    }

    async fn get_changes(
        &self,
        aggregate_id: Uuid,
        min_version: i64,
    ) -> Result<Vec<StoredChange>, DomainError> {
        let rows = sqlx::query(
            r"
            SELECT change_id, aggregate_id, aggregate_type, root_id, change_type, payload,
                   sequence_number, correlation_id, causation_id, occurred_at
            FROM aggregate_changes
            WHERE aggregate_id = $1 AND sequence_number > $2 AND NOT boxed
            ORDER BY sequence_number ASC
            ",
        )
        .bind(aggregate_id)
        .bind(min_version)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter()
            .map(change_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error)
    }

    #[allow(clippy::cast_precision_loss)]
    async fn get_expired(
        &self,
        aggregate_type: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, DomainError> {
        sqlx::query_scalar(
            r"
            SELECT aggregate_id
            FROM change_streams
            WHERE aggregate_type = $1
              AND NOT boxed
              AND last_active_at + make_interval(secs => $2) <= $3
            ORDER BY aggregate_id
            ",
        )
        .bind(aggregate_type)
        .bind(self.ttl.num_seconds() as f64)
        .bind(as_of)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)
    }

    #[tracing::instrument(skip(self))]
    async fn box_changes(&self, aggregate_id: Uuid, boxed: bool) -> Result<(), DomainError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        sqlx::query("UPDATE change_streams SET boxed = $2, last_active_at = $3 WHERE aggregate_id = $1")
            .bind(aggregate_id)
            .bind(boxed)
            .bind(self.clock.now())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        if boxed {
            sqlx::query("UPDATE aggregate_changes SET boxed = TRUE WHERE aggregate_id = $1 AND NOT boxed")
                .bind(aggregate_id)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
        }

        tx.commit().await.map_err(db_error)
    }

    async fn exists(&self, aggregate_id: Uuid) -> Result<bool, DomainError> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM aggregate_changes WHERE aggregate_id = $1 AND NOT boxed)",
        )
        .bind(aggregate_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn is_boxed(&self, aggregate_id: Uuid) -> Result<bool, DomainError> {
        let boxed: Option<bool> =
            sqlx::query_scalar("SELECT boxed FROM change_streams WHERE aggregate_id = $1")
                .bind(aggregate_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;
        Ok(boxed.unwrap_or(false))
    }
}
