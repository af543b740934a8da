//! Snapshot records and the policy deciding when to take them.
//!
//! A [`Snapshot`] captures the serialized state of one aggregate at a known
//! version, so rehydration only has to replay the changes recorded after it.
//! A [`SnapshotStrategy`] is consulted on every save; the repository never
//! snapshots unless the strategy says so, except when boxing.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::aggregate::{Aggregate, AggregateState};
use crate::clock::Clock;

/// Point-in-time capture of an aggregate's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Aggregate this snapshot belongs to.
    pub aggregate_id: Uuid,
    /// Type tag of the aggregate kind; selects the state decoder on restore.
    pub aggregate_type: String,
    /// Owning root aggregate, if any.
    pub root_id: Option<Uuid>,
    /// Version the captured state corresponds to, including changes committed
    /// by the save that took the snapshot.
    pub aggregate_version: i64,
    /// State blob in the serializer's format.
    pub state: Vec<u8>,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

/// Decides whether a save should also write a snapshot.
///
/// Implementations must be deterministic for the same inputs.
pub trait SnapshotStrategy<S: AggregateState>: Send + Sync {
    /// Whether to snapshot `aggregate` now, given how many snapshots already
    /// exist for its identity.
    fn should_take_snapshot(&self, aggregate: &Aggregate<S>, snapshot_count: i64) -> bool;
}

/// Never snapshot; every load replays the full log.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverSnapshot;

impl<S: AggregateState> SnapshotStrategy<S> for NeverSnapshot {
    fn should_take_snapshot(&self, _aggregate: &Aggregate<S>, _snapshot_count: i64) -> bool {
        false
    }
}

/// Snapshot on every save.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysSnapshot;

impl<S: AggregateState> SnapshotStrategy<S> for AlwaysSnapshot {
    fn should_take_snapshot(&self, _aggregate: &Aggregate<S>, _snapshot_count: i64) -> bool {
        true
    }
}

/// Snapshot once the post-save version is at least `n` past the last snapshot.
#[derive(Debug, Clone, Copy)]
pub struct EveryNChanges(pub i64);

impl<S: AggregateState> SnapshotStrategy<S> for EveryNChanges {
    fn should_take_snapshot(&self, aggregate: &Aggregate<S>, _snapshot_count: i64) -> bool {
        let since = aggregate.projected_version() - aggregate.snapshot_version().unwrap_or(0);
        since >= self.0.max(1)
    }
}

/// Snapshot when at least `interval` has passed since the last snapshot.
pub struct EveryInterval {
    interval: TimeDelta,
    clock: Arc<dyn Clock>,
}

impl EveryInterval {
    /// Creates the strategy.
    #[must_use]
    pub fn new(interval: TimeDelta, clock: Arc<dyn Clock>) -> Self {
        Self { interval, clock }
    }
}

impl std::fmt::Debug for EveryInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EveryInterval")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl<S: AggregateState> SnapshotStrategy<S> for EveryInterval {
    fn should_take_snapshot(&self, aggregate: &Aggregate<S>, _snapshot_count: i64) -> bool {
        aggregate
            .snapshot_taken_at()
            .is_none_or(|taken_at| self.clock.now() - taken_at >= self.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeKind;
    use crate::error::DomainError;
    use chrono::TimeZone;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug)]
    struct StepClock(Mutex<DateTime<Utc>>);

    impl Clock for StepClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Tick;

    impl ChangeKind for Tick {
        fn change_type(&self) -> &'static str {
            "tick"
        }
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Ticks(u32);

    impl AggregateState for Ticks {
        const KIND: &'static str = "ticks";
        type Change = Tick;

        fn apply(&mut self, _change: &Tick) {
            self.0 += 1;
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap()
    }

    fn with_pending(clock: &dyn Clock, committed: usize, pending: usize) -> Aggregate<Ticks> {
        let mut aggregate = Aggregate::new(Uuid::new_v4());
        for _ in 0..committed {
            aggregate.record(Tick, Uuid::new_v4(), clock).unwrap();
        }
        aggregate.mark_committed(committed);
        for _ in 0..pending {
            aggregate.record(Tick, Uuid::new_v4(), clock).unwrap();
        }
        aggregate
    }

    #[test]
    fn test_never_and_always() {
        let clock = StepClock(Mutex::new(start()));
        let aggregate = with_pending(&clock, 0, 1);

        assert!(!SnapshotStrategy::<Ticks>::should_take_snapshot(&NeverSnapshot, &aggregate, 0));
        assert!(SnapshotStrategy::<Ticks>::should_take_snapshot(&AlwaysSnapshot, &aggregate, 0));
    }

    #[test]
    fn test_every_n_changes_counts_pending_changes() {
        let clock = StepClock(Mutex::new(start()));
        let strategy = EveryNChanges(2);

        assert!(!strategy.should_take_snapshot(&with_pending(&clock, 0, 1), 0));
        assert!(strategy.should_take_snapshot(&with_pending(&clock, 0, 3), 0));
        assert!(strategy.should_take_snapshot(&with_pending(&clock, 1, 1), 0));
    }

    #[test]
    fn test_every_n_changes_measures_from_last_snapshot() {
        let clock = StepClock(Mutex::new(start()));
        let strategy = EveryNChanges(2);
        let mut aggregate = with_pending(&clock, 3, 0);
        aggregate.mark_snapshot(3, start());

        aggregate.record(Tick, Uuid::new_v4(), &clock).unwrap();
        assert!(!strategy.should_take_snapshot(&aggregate, 1));

        aggregate.record(Tick, Uuid::new_v4(), &clock).unwrap();
        assert!(strategy.should_take_snapshot(&aggregate, 1));
    }

    #[test]
    fn test_every_interval_waits_for_interval() {
        let clock = Arc::new(StepClock(Mutex::new(start())));
        let strategy = EveryInterval::new(TimeDelta::minutes(10), clock.clone());
        let mut aggregate = with_pending(clock.as_ref(), 0, 1);

        assert!(strategy.should_take_snapshot(&aggregate, 0));

        aggregate.mark_snapshot(1, start());
        *clock.0.lock().unwrap() = start() + TimeDelta::minutes(9);
        assert!(!strategy.should_take_snapshot(&aggregate, 1));

        *clock.0.lock().unwrap() = start() + TimeDelta::minutes(10);
        assert!(strategy.should_take_snapshot(&aggregate, 1));
    }

    #[test]
    fn test_validation_default_accepts_all_changes() {
        let state = Ticks::default();
        let result: Result<(), DomainError> = state.validate(&Tick);
        assert!(result.is_ok());
    }
}
