//! In-memory change store and snapshot store.
//!
//! Both stores are thread-safe and keep live and boxed (cold) records apart,
//! so boxing behaves the same way it does against `PostgreSQL`.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use cairn_core::clock::{Clock, SystemClock};
use cairn_core::error::DomainError;
use cairn_core::serializer::{JsonSerializer, StateSerializer};
use cairn_core::snapshot::Snapshot;
use cairn_core::store::{ChangeStore, SnapshotStore, StoredChange};

/// Default window, in seconds, after the last append before a stream counts
/// as expired.
pub const DEFAULT_STREAM_TTL_SECS: i64 = 300;

#[derive(Debug)]
struct Stream {
    aggregate_type: String,
    live: Vec<StoredChange>,
    archived: Vec<StoredChange>,
    boxed: bool,
    last_active_at: DateTime<Utc>,
}

impl Stream {
    /// Head of the live stream. An empty live stream adopts the base of the
    /// first append, so a chain restarted after unboxing can begin above 1.
    fn head(&self, first_sequence: i64) -> i64 {
        self.live
            .last()
            .map_or(first_sequence - 1, |c| c.sequence_number)
    }
}

/// In-memory append-only change log.
pub struct InMemoryChangeStore {
    streams: RwLock<HashMap<Uuid, Stream>>,
    serializer: Arc<dyn StateSerializer>,
    clock: Arc<dyn Clock>,
    ttl: TimeDelta,
}

impl InMemoryChangeStore {
    /// Creates an empty store using the system clock and the JSON serializer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store that timestamps activity with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            serializer: Arc::new(JsonSerializer),
            clock,
            ttl: TimeDelta::seconds(DEFAULT_STREAM_TTL_SECS),
        }
    }

    /// Overrides the expiry window used by `get_expired`.
    #[must_use]
    pub fn with_ttl(mut self, ttl: TimeDelta) -> Self {
        self.ttl = ttl;
        self
    }

    /// Overrides the state serializer.
    #[must_use]
    pub fn with_serializer(mut self, serializer: Arc<dyn StateSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Returns the archived changes of a boxed stream.
    pub fn boxed_changes(&self, aggregate_id: Uuid) -> Vec<StoredChange> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        streams
            .get(&aggregate_id)
            .map(|s| s.archived.clone())
            .unwrap_or_default()
    }
}

impl Default for InMemoryChangeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryChangeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryChangeStore")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ChangeStore for InMemoryChangeStore {
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

        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        let stream = streams.entry(aggregate_id).or_insert_with(|| Stream {
            aggregate_type: first.aggregate_type.clone(),
            live: Vec::new(),
            archived: Vec::new(),
            boxed: false,
            last_active_at: now,
        });
        if stream.boxed {
            return Err(DomainError::Validation(format!(
                "aggregate {aggregate_id} is boxed"
            )));
        }

        let head = stream.head(first_sequence);
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
        for (offset, change) in (0_i64..).zip(&changes) {
            if change.aggregate_id != aggregate_id || change.sequence_number != first_sequence + offset {
                return Err(DomainError::Validation(format!(
                    "change {} does not continue stream {aggregate_id}",
                    change.change_id
                )));
            }
        }

        stream.live.extend(changes.iter().cloned());
        stream.last_active_at = now;
        tracing::debug!(first_sequence, "changes appended");
        Ok(changes)
    }

    async fn get_changes(
        &self,
        aggregate_id: Uuid,
        min_version: i64,
    ) -> Result<Vec<StoredChange>, DomainError> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        Ok(streams
            .get(&aggregate_id)
            .map(|s| {
                s.live
                    .iter()
                    .filter(|c| c.sequence_number > min_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_expired(
        &self,
        aggregate_type: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, DomainError> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        let mut expired: Vec<Uuid> = streams
            .iter()
            .filter(|(_, s)| {
                s.aggregate_type == aggregate_type && !s.boxed && s.last_active_at + self.ttl <= as_of
            })
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        Ok(expired)
    }

    #[tracing::instrument(skip(self))]
    async fn box_changes(&self, aggregate_id: Uuid, boxed: bool) -> Result<(), DomainError> {
        let now = self.clock.now();
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        let Some(stream) = streams.get_mut(&aggregate_id) else {
            return Ok(());
        };
        if boxed {
            let live = std::mem::take(&mut stream.live);
            stream.archived.extend(live);
        }
        stream.boxed = boxed;
        stream.last_active_at = now;
        Ok(())
    }

    async fn exists(&self, aggregate_id: Uuid) -> Result<bool, DomainError> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        Ok(streams
            .get(&aggregate_id)
            .is_some_and(|s| !s.boxed && !s.live.is_empty()))
    }

    async fn is_boxed(&self, aggregate_id: Uuid) -> Result<bool, DomainError> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        Ok(streams.get(&aggregate_id).is_some_and(|s| s.boxed))
    }
}

#[derive(Debug, Default)]
struct SnapshotEntry {
    latest: Option<Snapshot>,
    boxed: Option<Snapshot>,
    written: i64,
}

/// In-memory store keeping the latest live and latest boxed snapshot per
/// identity.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    entries: RwLock<HashMap<Uuid, SnapshotEntry>>,
}

impl InMemorySnapshotStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn get(&self, aggregate_id: Uuid) -> Result<Option<Snapshot>, DomainError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let snapshot = entries.get(&aggregate_id).and_then(|e| e.latest.clone());
        tracing::trace!(found = snapshot.is_some(), "snapshot lookup");
        Ok(snapshot)
    }

    #[tracing::instrument(skip(self, snapshot), fields(aggregate_id = %snapshot.aggregate_id, version = snapshot.aggregate_version))]
    async fn save(&self, snapshot: Snapshot) -> Result<(), DomainError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(snapshot.aggregate_id).or_default();
        entry.latest = Some(snapshot);
        entry.written += 1;
        Ok(())
    }

    async fn count(&self, aggregate_id: Uuid) -> Result<i64, DomainError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(&aggregate_id).map_or(0, |e| e.written))
    }

    #[tracing::instrument(skip(self))]
    async fn box_snapshot(&self, aggregate_id: Uuid) -> Result<(), DomainError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(&aggregate_id) {
            if let Some(latest) = entry.latest.take() {
                entry.boxed = Some(latest);
            }
        }
        Ok(())
    }

    async fn get_boxed(&self, aggregate_id: Uuid) -> Result<Option<Snapshot>, DomainError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(&aggregate_id).and_then(|e| e.boxed.clone()))
    }

    #[tracing::instrument(skip(self))]
    async fn unbox_snapshot(&self, aggregate_id: Uuid) -> Result<(), DomainError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(&aggregate_id) {
            entry.boxed = None;
        }
        Ok(())
    }
}
