//! `PostgreSQL` implementation of the `SnapshotStore` trait.
//!
//! Every snapshot is kept as a row; the most recent live row is the current
//! snapshot and `boxed` rows form the cold store.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use cairn_core::error::DomainError;
use cairn_core::snapshot::Snapshot;
use cairn_core::store::SnapshotStore;

use crate::pg_change_store::db_error;
use crate::schema::CREATE_SNAPSHOTS_TABLE;

fn snapshot_from_row(row: &PgRow) -> Result<Snapshot, sqlx::Error> {
    Ok(Snapshot {
        aggregate_id: row.try_get("aggregate_id")?,
        aggregate_type: row.try_get("aggregate_type")?,
        root_id: row.try_get("root_id")?,
        aggregate_version: row.try_get("aggregate_version")?,
        state: row.try_get("state")?,
        taken_at: row.try_get("taken_at")?,
    })
}

/// PostgreSQL-backed snapshot store.
#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    /// Creates a new `PgSnapshotStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the snapshot schema (idempotent).
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the DDL fails.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), DomainError> {
        sqlx::raw_sql(CREATE_SNAPSHOTS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn get(&self, aggregate_id: Uuid) -> Result<Option<Snapshot>, DomainError> {
        let row = sqlx::query(
            r"
            SELECT aggregate_id, aggregate_type, root_id, aggregate_version, state, taken_at
            FROM aggregate_snapshots
            WHERE aggregate_id = $1 AND NOT boxed
            ORDER BY snapshot_id DESC
            LIMIT 1
            ",
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref()
            .map(snapshot_from_row)
            .transpose()
            .map_err(db_error)
    }

    #[tracing::instrument(skip(self, snapshot), fields(aggregate_id = %snapshot.aggregate_id, version = snapshot.aggregate_version))]
    async fn save(&self, snapshot: Snapshot) -> Result<(), DomainError> {
        sqlx::query(
            r"
            INSERT INTO aggregate_snapshots
                (aggregate_id, aggregate_type, root_id, aggregate_version, state, taken_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(snapshot.aggregate_id)
        .bind(&snapshot.aggregate_type)
        .bind(snapshot.root_id)
        .bind(snapshot.aggregate_version)
        .bind(&snapshot.state)
        .bind(snapshot.taken_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn count(&self, aggregate_id: Uuid) -> Result<i64, DomainError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM aggregate_snapshots WHERE aggregate_id = $1")
            .bind(aggregate_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)
    }

    #[tracing::instrument(skip(self))]
    async fn box_snapshot(&self, aggregate_id: Uuid) -> Result<(), DomainError> {
        sqlx::query("UPDATE aggregate_snapshots SET boxed = TRUE WHERE aggregate_id = $1 AND NOT boxed")
            .bind(aggregate_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn get_boxed(&self, aggregate_id: Uuid) -> Result<Option<Snapshot>, DomainError> {
        let row = sqlx::query(
            r"
            SELECT aggregate_id, aggregate_type, root_id, aggregate_version, state, taken_at
            FROM aggregate_snapshots
            WHERE aggregate_id = $1 AND boxed
            ORDER BY snapshot_id DESC
            LIMIT 1
            ",
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref()
            .map(snapshot_from_row)
            .transpose()
            .map_err(db_error)
    }

    #[tracing::instrument(skip(self))]
    async fn unbox_snapshot(&self, aggregate_id: Uuid) -> Result<(), DomainError> {
        sqlx::query(
            r"
            UPDATE aggregate_snapshots SET boxed = FALSE
            WHERE snapshot_id = (
                SELECT snapshot_id FROM aggregate_snapshots
                WHERE aggregate_id = $1 AND boxed
                ORDER BY snapshot_id DESC
                LIMIT 1
            )
            ",
        )
        .bind(aggregate_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }
}
