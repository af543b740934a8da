//! Change (event) abstractions.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata attached to every recorded change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMetadata {
    /// Unique change identifier.
    pub change_id: Uuid,
    /// Type name for deserialization routing.
    pub change_type: String,
    /// Aggregate this change belongs to.
    pub aggregate_id: Uuid,
    /// Monotonically increasing version within the aggregate stream.
    pub sequence_number: i64,
    /// Correlation ID for tracing a command through its effects.
    pub correlation_id: Uuid,
    /// Causation ID linking this change to whatever caused it.
    pub causation_id: Uuid,
    /// Timestamp of change creation.
    pub occurred_at: DateTime<Utc>,
}

/// Payload sum type of one aggregate kind's changes.
///
/// Implemented by a serde-tagged enum per aggregate kind; `change_type` is the
/// routing tag written next to the payload.
pub trait ChangeKind:
    Serialize + DeserializeOwned + Clone + std::fmt::Debug + Send + Sync + 'static
{
    /// Returns the change type name.
    fn change_type(&self) -> &'static str;
}

/// A change envelope: metadata plus the kind-specific payload.
#[derive(Debug, Clone)]
pub struct Change<C> {
    /// Change metadata.
    pub metadata: ChangeMetadata,
    /// Change-specific payload.
    pub kind: C,
}

impl<C: ChangeKind> Change<C> {
    /// Serializes the payload to JSON.
    ///
    /// # Errors
    ///
    /// Returns the serde error when the payload cannot be represented as JSON.
    pub fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(&self.kind)
    }
}
