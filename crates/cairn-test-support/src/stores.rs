//! Test stores — `ChangeStore` and `SnapshotStore` doubles for tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use cairn_core::error::DomainError;
use cairn_core::serializer::{JsonSerializer, StateSerializer};
use cairn_core::snapshot::Snapshot;
use cairn_core::store::{ChangeStore, SnapshotStore, StoredChange};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A change store that forwards to `inner` and records what went through it:
/// every appended batch and how many changes each `get_changes` call replayed.
#[derive(Debug)]
pub struct RecordingChangeStore<S> {
    inner: S,
    appended: Mutex<Vec<(Uuid, Option<i64>, Vec<StoredChange>)>>,
    loaded: Mutex<Vec<(Uuid, i64, usize)>>,
}

impl<S> RecordingChangeStore<S> {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            appended: Mutex::new(Vec::new()),
            loaded: Mutex::new(Vec::new()),
        }
    }

    /// Returns a snapshot of all batches that were appended, with the
    /// expected version they were appended under.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn appended_changes(&self) -> Vec<(Uuid, Option<i64>, Vec<StoredChange>)> {
        self.appended.lock().unwrap().clone()
    }

    /// Returns `(aggregate_id, min_version, changes_returned)` for every
    /// `get_changes` call.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn loads(&self) -> Vec<(Uuid, i64, usize)> {
        self.loaded.lock().unwrap().clone()
    }

    /// Forget recorded calls.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn reset(&self) {
        self.appended.lock().unwrap().clear();
        self.loaded.lock().unwrap().clear();
    }
}

#[async_trait]
impl<S: ChangeStore> ChangeStore for RecordingChangeStore<S> {
    fn serializer(&self) -> &dyn StateSerializer {
        self.inner.serializer()
    }

    async fn append(
        &self,
        aggregate_id: Uuid,
        changes: Vec<StoredChange>,
        expected_version: Option<i64>,
    ) -> Result<Vec<StoredChange>, DomainError> {
        let committed = self
            .inner
            .append(aggregate_id, changes, expected_version)
            .await?;
        self.appended
            .lock()
            .unwrap()
            .push((aggregate_id, expected_version, committed.clone()));
        Ok(committed)
    }

    async fn get_changes(
        &self,
        aggregate_id: Uuid,
        min_version: i64,
    ) -> Result<Vec<StoredChange>, DomainError> {
        let changes = self.inner.get_changes(aggregate_id, min_version).await?;
        self.loaded
            .lock()
            .unwrap()
            .push((aggregate_id, min_version, changes.len()));
        Ok(changes)
    }

    async fn get_expired(
        &self,
        aggregate_type: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, DomainError> {
        self.inner.get_expired(aggregate_type, as_of).await
    }

    async fn box_changes(&self, aggregate_id: Uuid, boxed: bool) -> Result<(), DomainError> {
        self.inner.box_changes(aggregate_id, boxed).await
    }

    async fn exists(&self, aggregate_id: Uuid) -> Result<bool, DomainError> {
        self.inner.exists(aggregate_id).await
    }

    async fn is_boxed(&self, aggregate_id: Uuid) -> Result<bool, DomainError> {
        self.inner.is_boxed(aggregate_id).await
    }
}

fn connection_refused() -> DomainError {
    DomainError::Infrastructure("connection refused".into())
}

/// A change store that always returns an infrastructure error. Useful for
/// testing error-propagation paths.
#[derive(Debug)]
pub struct FailingChangeStore;

#[async_trait]
impl ChangeStore for FailingChangeStore {
    fn serializer(&self) -> &dyn StateSerializer {
        &JsonSerializer
    }

    async fn append(
        &self,
        _aggregate_id: Uuid,
        _changes: Vec<StoredChange>,
        _expected_version: Option<i64>,
    ) -> Result<Vec<StoredChange>, DomainError> {
        Err(connection_refused())
    }

    async fn get_changes(
        &self,
        _aggregate_id: Uuid,
        _min_version: i64,
    ) -> Result<Vec<StoredChange>, DomainError> {
        Err(connection_refused())
    }

    async fn get_expired(
        &self,
        _aggregate_type: &str,
        _as_of: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, DomainError> {
        Err(connection_refused())
    }

    async fn box_changes(&self, _aggregate_id: Uuid, _boxed: bool) -> Result<(), DomainError> {
        Err(connection_refused())
    }

    async fn exists(&self, _aggregate_id: Uuid) -> Result<bool, DomainError> {
        Err(connection_refused())
    }

    async fn is_boxed(&self, _aggregate_id: Uuid) -> Result<bool, DomainError> {
        Err(connection_refused())
    }
}

/// A snapshot store that finds nothing and fails every write.
#[derive(Debug)]
pub struct FailingSnapshotStore;

#[async_trait]
impl SnapshotStore for FailingSnapshotStore {
    async fn get(&self, _aggregate_id: Uuid) -> Result<Option<Snapshot>, DomainError> {
        Ok(None)
    }

    async fn save(&self, _snapshot: Snapshot) -> Result<(), DomainError> {
        Err(connection_refused())
    }

    async fn count(&self, _aggregate_id: Uuid) -> Result<i64, DomainError> {
        Ok(0)
    }

    async fn box_snapshot(&self, _aggregate_id: Uuid) -> Result<(), DomainError> {
        Err(connection_refused())
    }

    async fn get_boxed(&self, _aggregate_id: Uuid) -> Result<Option<Snapshot>, DomainError> {
        Ok(None)
    }

    async fn unbox_snapshot(&self, _aggregate_id: Uuid) -> Result<(), DomainError> {
        Err(connection_refused())
    }
}

/// A snapshot store that forwards to `inner` but fails a set number of the
/// next `save` calls.
#[derive(Debug)]
pub struct FlakySnapshotStore<S> {
    inner: S,
    failing_saves: AtomicUsize,
}

impl<S> FlakySnapshotStore<S> {
    /// Wrap `inner`; no save fails until [`fail_next_saves`](Self::fail_next_saves).
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            failing_saves: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` saves fail with an infrastructure error.
    pub fn fail_next_saves(&self, count: usize) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S: SnapshotStore> SnapshotStore for FlakySnapshotStore<S> {
    async fn get(&self, aggregate_id: Uuid) -> Result<Option<Snapshot>, DomainError> {
        self.inner.get(aggregate_id).await
    }

    async fn save(&self, snapshot: Snapshot) -> Result<(), DomainError> {
        let failing = self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DomainError::Infrastructure("disk full".into()));
        }
        self.inner.save(snapshot).await
    }

    async fn count(&self, aggregate_id: Uuid) -> Result<i64, DomainError> {
        self.inner.count(aggregate_id).await
    }

    async fn box_snapshot(&self, aggregate_id: Uuid) -> Result<(), DomainError> {
        self.inner.box_snapshot(aggregate_id).await
    }

    async fn get_boxed(&self, aggregate_id: Uuid) -> Result<Option<Snapshot>, DomainError> {
        self.inner.get_boxed(aggregate_id).await
    }

    async fn unbox_snapshot(&self, aggregate_id: Uuid) -> Result<(), DomainError> {
        self.inner.unbox_snapshot(aggregate_id).await
    }
}
