//! Change store and snapshot store abstractions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::aggregate::AggregateState;
use crate::change::{Change, ChangeKind, ChangeMetadata};
use crate::error::DomainError;
use crate::serializer::StateSerializer;
use crate::snapshot::Snapshot;

/// Stored representation of a change.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChange {
    /// Unique change identifier.
    pub change_id: Uuid,
    /// Aggregate this change belongs to.
    pub aggregate_id: Uuid,
    /// Type tag of the aggregate kind.
    pub aggregate_type: String,
    /// Owning root aggregate, if any.
    pub root_id: Option<Uuid>,
    /// Change type name for deserialization routing.
    pub change_type: String,
    /// Serialized change payload.
    pub payload: serde_json::Value,
    /// Sequence number within the aggregate stream.
    pub sequence_number: i64,
    /// Correlation ID for tracing.
    pub correlation_id: Uuid,
    /// Causation ID linking to the causing change/command.
    pub causation_id: Uuid,
    /// Timestamp of change creation.
    pub occurred_at: DateTime<Utc>,
}

impl StoredChange {
    /// Flattens a recorded change into its stored form.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the payload cannot be encoded.
    pub fn from_change<S: AggregateState>(
        change: &Change<S::Change>,
        root_id: Option<Uuid>,
    ) -> Result<Self, DomainError> {
        let meta = &change.metadata;
        let payload = change.to_payload().map_err(|e| {
            DomainError::Infrastructure(format!("change serialization failed: {e}"))
        })?;
        Ok(Self {
            change_id: meta.change_id,
            aggregate_id: meta.aggregate_id,
            aggregate_type: S::KIND.to_owned(),
            root_id,
            change_type: meta.change_type.clone(),
            payload,
            sequence_number: meta.sequence_number,
            correlation_id: meta.correlation_id,
            causation_id: meta.causation_id,
            occurred_at: meta.occurred_at,
        })
    }

    /// Decodes the payload back into a typed change.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the change belongs to another
    /// aggregate kind or the payload does not decode.
    pub fn to_change<C: ChangeKind>(&self, aggregate_type: &str) -> Result<Change<C>, DomainError> {
        if self.aggregate_type != aggregate_type {
            return Err(DomainError::Infrastructure(format!(
                "change {} belongs to kind {}, not {aggregate_type}",
                self.change_id, self.aggregate_type
            )));
        }
        let kind: C = serde_json::from_value(self.payload.clone()).map_err(|e| {
            DomainError::Infrastructure(format!("change deserialization failed: {e}"))
        })?;
        Ok(Change {
            metadata: ChangeMetadata {
                change_id: self.change_id,
                change_type: self.change_type.clone(),
                aggregate_id: self.aggregate_id,
                sequence_number: self.sequence_number,
                correlation_id: self.correlation_id,
                causation_id: self.causation_id,
                occurred_at: self.occurred_at,
            },
            kind,
        })
    }
}

/// Append-only log of changes.
#[async_trait]
pub trait ChangeStore: Send + Sync {
    /// Serializer used for aggregate state blobs.
    fn serializer(&self) -> &dyn StateSerializer;

    /// Append changes to an aggregate stream.
    ///
    /// When `expected_version` is given it must equal the head of the live
    /// stream. Returns the changes actually committed.
    async fn append(
        &self,
        aggregate_id: Uuid,
        changes: Vec<StoredChange>,
        expected_version: Option<i64>,
    ) -> Result<Vec<StoredChange>, DomainError>;

    /// Load live changes with `sequence_number > min_version`, ascending.
    async fn get_changes(
        &self,
        aggregate_id: Uuid,
        min_version: i64,
    ) -> Result<Vec<StoredChange>, DomainError>;

    /// Identities of live aggregates of `aggregate_type` whose expiry is at
    /// or before `as_of`.
    async fn get_expired(
        &self,
        aggregate_type: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, DomainError>;

    /// Move the live stream to cold storage (`boxed = true`) or reopen an
    /// empty live stream (`boxed = false`).
    async fn box_changes(&self, aggregate_id: Uuid, boxed: bool) -> Result<(), DomainError>;

    /// Whether any live change is recorded for the identity.
    async fn exists(&self, aggregate_id: Uuid) -> Result<bool, DomainError>;

    /// Whether the identity's stream is in cold storage.
    async fn is_boxed(&self, aggregate_id: Uuid) -> Result<bool, DomainError>;
}

/// Persistence for the latest snapshot per identity.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Most recent live snapshot.
    async fn get(&self, aggregate_id: Uuid) -> Result<Option<Snapshot>, DomainError>;

    /// Persist a snapshot; it supersedes any older one for the identity.
    async fn save(&self, snapshot: Snapshot) -> Result<(), DomainError>;

    /// Number of snapshots ever written for the identity.
    async fn count(&self, aggregate_id: Uuid) -> Result<i64, DomainError>;

    /// Move the latest snapshot to cold storage.
    async fn box_snapshot(&self, aggregate_id: Uuid) -> Result<(), DomainError>;

    /// Most recent boxed snapshot. It stays in cold storage until
    /// [`unbox_snapshot`](Self::unbox_snapshot) releases it.
    async fn get_boxed(&self, aggregate_id: Uuid) -> Result<Option<Snapshot>, DomainError>;

    /// Release the most recent boxed snapshot from cold storage. A no-op when
    /// nothing is boxed.
    async fn unbox_snapshot(&self, aggregate_id: Uuid) -> Result<(), DomainError>;
}
