//! Domain error types.

use thiserror::Error;
use uuid::Uuid;

/// Top-level domain error type.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An aggregate was not found in the cache, the snapshot store or the log.
    #[error("aggregate not found: {0}")]
    AggregateNotFound(Uuid),

    /// A second in-memory instance claimed an identity that is already live.
    #[error(
        "aggregate {aggregate_id} is already live under a different instance \
         (cached version {cached_version:?}, rejected version {rejected_version})"
    )]
    InstanceConflict {
        /// The contested identity.
        aggregate_id: Uuid,
        /// Version of the cached instance, if it could be read without blocking.
        cached_version: Option<i64>,
        /// Version of the instance that was rejected.
        rejected_version: i64,
    },

    /// Optimistic concurrency conflict reported by the change store.
    #[error("concurrency conflict on aggregate {aggregate_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// The aggregate that had the conflict.
        aggregate_id: Uuid,
        /// The expected version.
        expected: i64,
        /// The actual version found.
        actual: i64,
    },

    /// Aggregate state could not be serialized or deserialized.
    #[error("failed to serialize state of {aggregate_type} {aggregate_id} at version {version}: {reason}")]
    SerializationFailed {
        /// Type tag of the aggregate.
        aggregate_type: &'static str,
        /// The aggregate identifier.
        aggregate_id: Uuid,
        /// Version the state was captured at.
        version: i64,
        /// Underlying serializer message.
        reason: String,
    },

    /// The requested operation is not supported.
    #[error("unimplemented: {0}")]
    Unimplemented(&'static str),

    /// A validation error in domain logic.
    #[error("validation error: {0}")]
    Validation(String),

    /// An infrastructure/persistence error.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}
