//! Aggregate entity and state contract.

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::change::{Change, ChangeKind, ChangeMetadata};
use crate::clock::Clock;
use crate::error::DomainError;

/// State payload of one aggregate kind.
///
/// The `Default` value is the zero state a freshly created aggregate starts
/// from. Replay through [`apply`](AggregateState::apply) must be
/// deterministic: the same ordered changes always yield the same state.
pub trait AggregateState:
    Serialize + DeserializeOwned + Default + Clone + std::fmt::Debug + Send + Sync + 'static
{
    /// Type tag carried by persisted changes and snapshots of this kind.
    const KIND: &'static str;

    /// The change sum type this state consumes.
    type Change: ChangeKind;

    /// Apply a change to mutate the state.
    fn apply(&mut self, change: &Self::Change);

    /// Check a change against the current state before it is recorded.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` when the change is not allowed.
    fn validate(&self, _change: &Self::Change) -> Result<(), DomainError> {
        Ok(())
    }
}

/// A reconstructable domain object.
#[derive(Debug, Clone)]
pub struct Aggregate<S: AggregateState> {
    id: Uuid,
    root_id: Option<Uuid>,
    /// Count of changes durably applied to `state`.
    version: i64,
    /// Includes the effect of uncommitted changes.
    state: S,
    uncommitted_changes: Vec<Change<S::Change>>,
    snapshot_version: Option<i64>,
    snapshot_taken_at: Option<DateTime<Utc>>,
}

impl<S: AggregateState> Aggregate<S> {
    /// Creates a new aggregate at version 0 with the zero state.
    #[must_use]
    pub fn new(id: Uuid) -> Self {
        Self::with_state(id, None, S::default())
    }

    /// Creates a new sub-entity owned by `root_id`.
    #[must_use]
    pub fn new_child(id: Uuid, root_id: Uuid) -> Self {
        Self::with_state(id, Some(root_id), S::default())
    }

    /// Creates an aggregate at version 0 holding `state`.
    #[must_use]
    pub fn with_state(id: Uuid, root_id: Option<Uuid>, state: S) -> Self {
        Self {
            id,
            root_id,
            version: 0,
            state,
            uncommitted_changes: Vec::new(),
            snapshot_version: None,
            snapshot_taken_at: None,
        }
    }

    /// Returns the aggregate identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the owning root aggregate, if this is a sub-entity.
    #[must_use]
    pub fn root_id(&self) -> Option<Uuid> {
        self.root_id
    }

    /// Returns the current committed version.
    #[must_use]
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Returns changes recorded since the last save.
    #[must_use]
    pub fn uncommitted_changes(&self) -> &[Change<S::Change>] {
        &self.uncommitted_changes
    }

    /// Number of uncommitted changes.
    #[must_use]
    pub fn pending_changes(&self) -> usize {
        self.uncommitted_changes.len()
    }

    /// The version this aggregate will have once its pending changes commit.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn projected_version(&self) -> i64 {
        self.version + self.uncommitted_changes.len() as i64
    }

    /// Version of the snapshot this instance was restored from or last wrote.
    #[must_use]
    pub fn snapshot_version(&self) -> Option<i64> {
        self.snapshot_version
    }

    /// When this instance last wrote or restored a snapshot.
    #[must_use]
    pub fn snapshot_taken_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot_taken_at
    }

    /// Records a change: validates it, applies it to the state and queues it
    /// for the next save.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the state rejects the change.
    pub fn record(
        &mut self,
        kind: S::Change,
        correlation_id: Uuid,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        self.state.validate(&kind)?;
        // TODO: change_id uses Uuid::new_v4(); thread an id generator through
        // `record` so replayed commands produce identical change ids.
        let change = Change {
            metadata: ChangeMetadata {
                change_id: Uuid::new_v4(),
                change_type: kind.change_type().to_owned(),
                aggregate_id: self.id,
                sequence_number: self.projected_version() + 1,
                correlation_id,
                causation_id: correlation_id,
                occurred_at: clock.now(),
            },
            kind,
        };
        self.state.apply(&change.kind);
        self.uncommitted_changes.push(change);
        Ok(())
    }

    /// Replays one committed change during rehydration.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if `sequence_number` does not
    /// directly follow the current version.
    pub fn replay(&mut self, sequence_number: i64, change: &S::Change) -> Result<(), DomainError> {
        if sequence_number != self.version + 1 {
            return Err(DomainError::Infrastructure(format!(
                "change log for {} is out of order: expected version {}, found {sequence_number}",
                self.id,
                self.version + 1
            )));
        }
        self.state.apply(change);
        self.version = sequence_number;
        Ok(())
    }

    /// Replaces identity, version and state wholesale from a snapshot.
    pub fn restore(&mut self, version: i64, state: S, root_id: Option<Uuid>, taken_at: DateTime<Utc>) {
        self.version = version;
        self.state = state;
        self.root_id = root_id;
        self.uncommitted_changes.clear();
        self.snapshot_version = Some(version);
        self.snapshot_taken_at = Some(taken_at);
    }

    /// Marks `committed` pending changes as durable and drops the queue.
    #[allow(clippy::cast_possible_wrap)]
    pub fn mark_committed(&mut self, committed: usize) {
        self.version += committed as i64;
        self.uncommitted_changes.clear();
    }

    /// Notes that a snapshot at `version` now exists for this instance.
    pub fn mark_snapshot(&mut self, version: i64, taken_at: DateTime<Utc>) {
        self.snapshot_version = Some(version);
        self.snapshot_taken_at = Some(taken_at);
    }

    /// Builds a detached copy with the given state and no pending changes.
    #[must_use]
    pub fn detached_with(&self, state: S) -> Self {
        Self {
            id: self.id,
            root_id: self.root_id,
            version: self.version,
            state,
            uncommitted_changes: Vec::new(),
            snapshot_version: self.snapshot_version,
            snapshot_taken_at: self.snapshot_taken_at,
        }
    }
}

/// Creates zero-value aggregates of one kind.
pub trait AggregateFactory<S: AggregateState>: Send + Sync {
    /// Create a new aggregate at version 0.
    fn create(&self, id: Uuid) -> Aggregate<S>;

    /// Create a zero-value state.
    fn create_state(&self) -> S;

    /// Create a new sub-entity of `root_id` at version 0.
    fn create_child(&self, id: Uuid, root_id: Uuid) -> Aggregate<S> {
        Aggregate::with_state(id, Some(root_id), self.create_state())
    }
}

/// Factory backed by `S::default()`.
#[derive(Debug)]
pub struct DefaultAggregateFactory<S>(PhantomData<fn() -> S>);

impl<S> DefaultAggregateFactory<S> {
    /// Creates the factory.
    #[must_use]
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<S> Default for DefaultAggregateFactory<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: AggregateState> AggregateFactory<S> for DefaultAggregateFactory<S> {
    fn create(&self, id: Uuid) -> Aggregate<S> {
        Aggregate::new(id)
    }

    fn create_state(&self) -> S {
        S::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde::Deserialize;

    #[derive(Debug)]
    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    enum TallyChange {
        Added(u32),
    }

    impl ChangeKind for TallyChange {
        fn change_type(&self) -> &'static str {
            "tally.added"
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Tally {
        total: u32,
    }

    impl AggregateState for Tally {
        const KIND: &'static str = "tally";
        type Change = TallyChange;

        fn apply(&mut self, change: &TallyChange) {
            let TallyChange::Added(n) = change;
            self.total += n;
        }

        fn validate(&self, change: &TallyChange) -> Result<(), DomainError> {
            match change {
                TallyChange::Added(0) => Err(DomainError::Validation("zero increment".into())),
                TallyChange::Added(_) => Ok(()),
            }
        }
    }

    fn clock() -> FixedClock {
        FixedClock(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap())
    }

    #[test]
    fn test_record_applies_state_and_queues_change() {
        // Arrange
        let id = Uuid::new_v4();
        let correlation_id = Uuid::new_v4();
        let mut aggregate = Aggregate::<Tally>::new(id);

        // Act
        aggregate.record(TallyChange::Added(2), correlation_id, &clock()).unwrap();
        aggregate.record(TallyChange::Added(3), correlation_id, &clock()).unwrap();

        // Assert
        assert_eq!(aggregate.state().total, 5);
        assert_eq!(aggregate.version(), 0);
        assert_eq!(aggregate.projected_version(), 2);
        let changes = aggregate.uncommitted_changes();
        assert_eq!(changes[0].metadata.sequence_number, 1);
        assert_eq!(changes[1].metadata.sequence_number, 2);
        assert_eq!(changes[1].metadata.aggregate_id, id);
        assert_eq!(changes[1].metadata.change_type, "tally.added");
        assert_eq!(changes[1].metadata.correlation_id, correlation_id);
    }

    #[test]
    fn test_record_rejected_change_leaves_aggregate_untouched() {
        let mut aggregate = Aggregate::<Tally>::new(Uuid::new_v4());

        let result = aggregate.record(TallyChange::Added(0), Uuid::new_v4(), &clock());

        assert!(matches!(result, Err(DomainError::Validation(_))));
        assert_eq!(aggregate.pending_changes(), 0);
        assert_eq!(aggregate.state().total, 0);
    }

    #[test]
    fn test_mark_committed_advances_version_and_clears_queue() {
        let mut aggregate = Aggregate::<Tally>::new(Uuid::new_v4());
        aggregate.record(TallyChange::Added(1), Uuid::new_v4(), &clock()).unwrap();
        aggregate.record(TallyChange::Added(1), Uuid::new_v4(), &clock()).unwrap();

        aggregate.mark_committed(2);

        assert_eq!(aggregate.version(), 2);
        assert!(aggregate.uncommitted_changes().is_empty());
        aggregate.record(TallyChange::Added(1), Uuid::new_v4(), &clock()).unwrap();
        assert_eq!(aggregate.uncommitted_changes()[0].metadata.sequence_number, 3);
    }

    #[test]
    fn test_replay_rejects_gap_in_sequence() {
        let mut aggregate = Aggregate::<Tally>::new(Uuid::new_v4());
        aggregate.replay(1, &TallyChange::Added(4)).unwrap();

        let result = aggregate.replay(3, &TallyChange::Added(4));

        match result {
            Err(DomainError::Infrastructure(msg)) => assert!(msg.contains("expected version 2")),
            other => panic!("expected Infrastructure, got {other:?}"),
        }
        assert_eq!(aggregate.version(), 1);
        assert_eq!(aggregate.state().total, 4);
    }

    #[test]
    fn test_restore_replaces_state_and_records_snapshot_version() {
        let root = Uuid::new_v4();
        let taken_at = clock().now();
        let mut aggregate = Aggregate::<Tally>::new(Uuid::new_v4());
        aggregate.record(TallyChange::Added(9), Uuid::new_v4(), &clock()).unwrap();

        aggregate.restore(5, Tally { total: 40 }, Some(root), taken_at);

        assert_eq!(aggregate.version(), 5);
        assert_eq!(aggregate.state().total, 40);
        assert_eq!(aggregate.root_id(), Some(root));
        assert_eq!(aggregate.snapshot_version(), Some(5));
        assert_eq!(aggregate.snapshot_taken_at(), Some(taken_at));
        assert_eq!(aggregate.pending_changes(), 0);
    }

    #[test]
    fn test_default_factory_creates_zero_value() {
        let factory = DefaultAggregateFactory::<Tally>::new();
        let id = Uuid::new_v4();

        let aggregate = factory.create(id);

        assert_eq!(aggregate.id(), id);
        assert_eq!(aggregate.version(), 0);
        assert_eq!(aggregate.state(), &Tally::default());
        assert_eq!(factory.create_state(), Tally::default());
    }

    #[test]
    fn test_factory_child_carries_root() {
        let factory = DefaultAggregateFactory::<Tally>::new();
        let root = Uuid::new_v4();

        let child = factory.create_child(Uuid::new_v4(), root);

        assert_eq!(child.root_id(), Some(root));
        assert_eq!(child.version(), 0);
    }
}
