//! The aggregate repository.
//!
//! Lock order is always: aggregate mutation scope, then the repository load
//! lock, then the cache map. The load lock covers cache lookup plus the
//! rebuild of a missing aggregate, so two callers loading the same identity
//! never end up with two instances.

use std::sync::Arc;

use cairn_core::aggregate::{
    Aggregate, AggregateFactory, AggregateState, DefaultAggregateFactory,
};
use cairn_core::clock::Clock;
use cairn_core::error::DomainError;
use cairn_core::snapshot::{NeverSnapshot, Snapshot, SnapshotStrategy};
use cairn_core::store::{ChangeStore, SnapshotStore, StoredChange};
use uuid::Uuid;

use crate::cache::{AggregateCache, LiveAggregate};
use crate::config::RepositoryConfig;

/// Which version of an aggregate [`get`](AggregateRepository::get) returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Version {
    /// The current state.
    #[default]
    Latest,
    /// A specific historical version.
    At(i64),
}

/// Outcome of one [`ping`](AggregateRepository::ping).
#[derive(Debug, Default)]
pub struct PingReport {
    /// Identities moved to cold storage.
    pub boxed: Vec<Uuid>,
    /// Identities whose box failed. They keep their expiry, so the next
    /// sweep picks them up again.
    pub failed: Vec<(Uuid, DomainError)>,
}

fn instance_conflict<S: AggregateState>(
    aggregate_id: Uuid,
    cached: &Arc<LiveAggregate<S>>,
    rejected_version: i64,
) -> DomainError {
    tracing::warn!(%aggregate_id, rejected_version, "second live instance for identity");
    DomainError::InstanceConflict {
        aggregate_id,
        cached_version: cached.try_version(),
        rejected_version,
    }
}

/// Loads, caches, snapshots and archives aggregates of one kind.
pub struct AggregateRepository<S: AggregateState> {
    changes: Arc<dyn ChangeStore>,
    snapshots: Arc<dyn SnapshotStore>,
    strategy: Box<dyn SnapshotStrategy<S>>,
    factory: Box<dyn AggregateFactory<S>>,
    clock: Arc<dyn Clock>,
    cache: AggregateCache<S>,
    load_lock: tokio::sync::Mutex<()>,
}

impl<S: AggregateState> AggregateRepository<S> {
    /// Creates a repository that never snapshots on save and builds zero
    /// values with `S::default()`.
    #[must_use]
    pub fn new(
        changes: Arc<dyn ChangeStore>,
        snapshots: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = RepositoryConfig::default();
        Self {
            changes,
            snapshots,
            strategy: Box::new(NeverSnapshot),
            factory: Box::new(DefaultAggregateFactory::new()),
            cache: AggregateCache::new(config.cache_ttl, Arc::clone(&clock)),
            clock,
            load_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Sets the policy consulted on every save.
    #[must_use]
    pub fn with_strategy(mut self, strategy: impl SnapshotStrategy<S> + 'static) -> Self {
        self.strategy = Box::new(strategy);
        self
    }

    /// Sets the factory used for new and rebuilt aggregates.
    #[must_use]
    pub fn with_factory(mut self, factory: impl AggregateFactory<S> + 'static) -> Self {
        self.factory = Box::new(factory);
        self
    }

    /// Applies `config`. Replaces the cache, so call it before first use.
    #[must_use]
    pub fn with_config(mut self, config: RepositoryConfig) -> Self {
        self.cache = AggregateCache::new(config.cache_ttl, Arc::clone(&self.clock));
        self
    }

    /// The live-instance cache.
    #[must_use]
    pub fn cache(&self) -> &AggregateCache<S> {
        &self.cache
    }

    /// Number of cached aggregates.
    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    /// New, uncached aggregate at version 0. It joins the cache on its first
    /// save.
    #[must_use]
    pub fn create(&self, id: Uuid) -> Arc<LiveAggregate<S>> {
        Arc::new(LiveAggregate::new(self.factory.create(id)))
    }

    /// New, uncached sub-entity of `root_id`.
    #[must_use]
    pub fn create_child(&self, id: Uuid, root_id: Uuid) -> Arc<LiveAggregate<S>> {
        Arc::new(LiveAggregate::new(self.factory.create_child(id, root_id)))
    }

    /// Persists the pending changes of `aggregate`.
    ///
    /// Registers the instance in the cache (or refreshes its expiry), appends
    /// the pending changes with the optional optimistic `expected_version`,
    /// and writes a snapshot at the post-save version when the strategy asks
    /// for one. The strategy is consulted before the append; the snapshot is
    /// written only once the append has succeeded. On error the instance
    /// keeps its pending changes, and if this call is what put it in the
    /// cache and nothing was appended, it leaves the cache again.
    ///
    /// Returns the committed changes.
    ///
    /// # Errors
    ///
    /// - `DomainError::InstanceConflict` if a different instance is cached
    ///   under the same identity.
    /// - `DomainError::ConcurrencyConflict` if the change store rejects the
    ///   expected version.
    /// - `DomainError::SerializationFailed` if the snapshot state cannot be
    ///   encoded.
    /// - Any store error, unchanged.
    #[tracing::instrument(skip(self, aggregate), fields(aggregate_id = %aggregate.id(), kind = S::KIND))]
    pub async fn save(
        &self,
        aggregate: &Arc<LiveAggregate<S>>,
        expected_version: Option<i64>,
    ) -> Result<Vec<StoredChange>, DomainError> {
        let mut guard = aggregate.lock().await;
        let inserted = {
            let _load = self.load_lock.lock().await;
            self.cache
                .put(aggregate, true)
                .map_err(|cached| instance_conflict(aggregate.id(), &cached, guard.version()))?
        };
        let result = self.commit(&mut guard, expected_version, false).await;
        if result.is_err() && inserted && guard.pending_changes() > 0 {
            self.cache.remove_instance(aggregate);
            tracing::debug!("rejected instance removed from cache");
        }
        result
    }

    async fn commit(
        &self,
        aggregate: &mut Aggregate<S>,
        expected_version: Option<i64>,
        force_snapshot: bool,
    ) -> Result<Vec<StoredChange>, DomainError> {
        let id = aggregate.id();
        let take_snapshot = if force_snapshot {
            true
        } else if aggregate.pending_changes() == 0 {
            return Ok(Vec::new());
        } else {
            let snapshot_count = self.snapshots.count(id).await?;
            self.strategy.should_take_snapshot(aggregate, snapshot_count)
        };

        let committed = if aggregate.pending_changes() == 0 {
            Vec::new()
        } else {
            let root_id = aggregate.root_id();
            let pending = aggregate
                .uncommitted_changes()
                .iter()
                .map(|c| StoredChange::from_change::<S>(c, root_id))
                .collect::<Result<Vec<_>, _>>()?;
            let committed = self.changes.append(id, pending, expected_version).await?;
            aggregate.mark_committed(committed.len());
            committed
        };

        tracing::debug!(
            committed = committed.len(),
            version = aggregate.version(),
            take_snapshot,
            "changes committed"
        );
        if take_snapshot {
            self.write_snapshot(aggregate).await?;
        }
        Ok(committed)
    }

    async fn write_snapshot(&self, aggregate: &mut Aggregate<S>) -> Result<(), DomainError> {
        let version = aggregate.projected_version();
        let state = self.encode_state(aggregate, version)?;
        let taken_at = self.clock.now();
        self.snapshots
            .save(Snapshot {
                aggregate_id: aggregate.id(),
                aggregate_type: S::KIND.to_owned(),
                root_id: aggregate.root_id(),
                aggregate_version: version,
                state,
                taken_at,
            })
            .await?;
        aggregate.mark_snapshot(version, taken_at);
        tracing::debug!(version, "snapshot written");
        Ok(())
    }

    fn encode_state(&self, aggregate: &Aggregate<S>, version: i64) -> Result<Vec<u8>, DomainError> {
        let failed = |reason: String| DomainError::SerializationFailed {
            aggregate_type: S::KIND,
            aggregate_id: aggregate.id(),
            version,
            reason,
        };
        let value = serde_json::to_value(aggregate.state()).map_err(|e| failed(e.to_string()))?;
        self.changes
            .serializer()
            .encode(&value)
            .map_err(|e| failed(e.to_string()))
    }

    fn decode_state(&self, aggregate_id: Uuid, version: i64, bytes: &[u8]) -> Result<S, DomainError> {
        let failed = |reason: String| DomainError::SerializationFailed {
            aggregate_type: S::KIND,
            aggregate_id,
            version,
            reason,
        };
        let value = self
            .changes
            .serializer()
            .decode(bytes)
            .map_err(|e| failed(e.to_string()))?;
        serde_json::from_value(value).map_err(|e| failed(e.to_string()))
    }

    fn decode_snapshot(&self, snapshot: &Snapshot) -> Result<S, DomainError> {
        if snapshot.aggregate_type != S::KIND {
            return Err(DomainError::Infrastructure(format!(
                "snapshot of {} is a {}, not a {}",
                snapshot.aggregate_id,
                snapshot.aggregate_type,
                S::KIND
            )));
        }
        self.decode_state(snapshot.aggregate_id, snapshot.aggregate_version, &snapshot.state)
    }

    /// Returns the live instance for `id`, rebuilding it on a cache miss.
    ///
    /// # Errors
    ///
    /// - `DomainError::Unimplemented` for `Version::At`; use
    ///   [`peek`](Self::peek) for point-in-time reads.
    /// - `DomainError::AggregateNotFound` if neither a snapshot nor any change
    ///   exists for `id`.
    /// - Any store or decoding error, unchanged.
    #[tracing::instrument(skip(self), fields(kind = S::KIND))]
    pub async fn get(&self, id: Uuid, version: Version) -> Result<Arc<LiveAggregate<S>>, DomainError> {
        if let Version::At(_) = version {
            return Err(DomainError::Unimplemented(
                "versioned get; use peek for point-in-time reads",
            ));
        }
        self.load(id, false).await
    }

    async fn load(&self, id: Uuid, create_if_missing: bool) -> Result<Arc<LiveAggregate<S>>, DomainError> {
        let _load = self.load_lock.lock().await;
        if let Some(live) = self.cache.touch(id) {
            tracing::debug!(%id, "cache hit");
            return Ok(live);
        }

        let aggregate = match self.rehydrate(id).await? {
            Some(aggregate) => aggregate,
            None if create_if_missing => self.factory.create(id),
            None => return Err(DomainError::AggregateNotFound(id)),
        };
        let version = aggregate.version();
        let live = Arc::new(LiveAggregate::new(aggregate));
        self.cache
            .put(&live, true)
            .map_err(|cached| instance_conflict(id, &cached, version))?;
        Ok(live)
    }

    /// Rebuilds `id` from its latest snapshot plus the changes after it, or
    /// from the full log when there is no snapshot.
    async fn rehydrate(&self, id: Uuid) -> Result<Option<Aggregate<S>>, DomainError> {
        let mut aggregate = match self.snapshots.get(id).await? {
            Some(snapshot) => {
                let state = self.decode_snapshot(&snapshot)?;
                let mut aggregate = self.factory.create(id);
                aggregate.restore(snapshot.aggregate_version, state, snapshot.root_id, snapshot.taken_at);
                aggregate
            }
            None => self.factory.create(id),
        };
        let restored = aggregate.snapshot_version().is_some();

        let changes = self.changes.get_changes(id, aggregate.version()).await?;
        if !restored {
            match changes.first() {
                None => return Ok(None),
                Some(first) => {
                    if let Some(root_id) = first.root_id {
                        aggregate = self.factory.create_child(id, root_id);
                    }
                }
            }
        }
        let replayed = replay(&mut aggregate, &changes, None)?;
        tracing::debug!(%id, replayed, version = aggregate.version(), restored, "aggregate rehydrated");
        Ok(Some(aggregate))
    }

    /// Returns a detached deep copy of the current aggregate.
    ///
    /// The state goes through the serializer while the source instance is
    /// locked, so the copy shares nothing with the live instance.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get), plus `DomainError::SerializationFailed` if
    /// the state does not survive the round trip.
    #[tracing::instrument(skip(self), fields(kind = S::KIND))]
    pub async fn get_clone(&self, id: Uuid) -> Result<Aggregate<S>, DomainError> {
        let live = self.load(id, false).await?;
        let guard = live.lock().await;
        let version = guard.version();
        let bytes = self.encode_state(&guard, version)?;
        let state = self.decode_state(id, version, &bytes)?;
        Ok(guard.detached_with(state))
    }

    /// Runs `action` with exclusive access to the live aggregate, creating a
    /// zero-value aggregate if `id` is unknown.
    ///
    /// The mutation scope is released when the call returns, including when
    /// `action` panics.
    ///
    /// # Errors
    ///
    /// Any store or decoding error raised while loading.
    #[tracing::instrument(skip(self, action), fields(kind = S::KIND))]
    pub async fn lock_and_run<F, R>(&self, id: Uuid, action: F) -> Result<R, DomainError>
    where
        F: FnOnce(&mut Aggregate<S>) -> R + Send,
    {
        let live = self.load(id, true).await?;
        let mut guard = live.lock().await;
        Ok(action(&mut *guard))
    }

    /// Rebuilds `id` as it was at `version`, without touching the cache.
    ///
    /// Uses the latest snapshot when it is not newer than `version`,
    /// otherwise replays the log from the start.
    ///
    /// # Errors
    ///
    /// - `DomainError::AggregateNotFound` if nothing is stored for `id`.
    /// - `DomainError::Validation` if `version` is below 1 or the retained
    ///   history does not reach it.
    #[tracing::instrument(skip(self), fields(kind = S::KIND))]
    pub async fn peek(&self, id: Uuid, version: i64) -> Result<Aggregate<S>, DomainError> {
        if version < 1 {
            return Err(DomainError::Validation(format!(
                "version must be at least 1, got {version}"
            )));
        }

        let mut aggregate = self.factory.create(id);
        let mut found = false;
        if let Some(snapshot) = self.snapshots.get(id).await? {
            found = true;
            if snapshot.aggregate_version <= version {
                let state = self.decode_snapshot(&snapshot)?;
                aggregate.restore(snapshot.aggregate_version, state, snapshot.root_id, snapshot.taken_at);
            }
        }

        let changes = self.changes.get_changes(id, aggregate.version()).await?;
        if !found && changes.is_empty() {
            return Err(DomainError::AggregateNotFound(id));
        }
        if let Some(first) = changes.first() {
            if first.sequence_number != aggregate.version() + 1 {
                return Err(DomainError::Validation(format!(
                    "history of {id} before version {} is boxed",
                    first.sequence_number
                )));
            }
            if aggregate.snapshot_version().is_none() {
                if let Some(root_id) = first.root_id {
                    aggregate = self.factory.create_child(id, root_id);
                }
            }
        }

        replay(&mut aggregate, &changes, Some(version))?;
        if aggregate.version() != version {
            return Err(DomainError::Validation(format!(
                "aggregate {id} has no version {version}; latest is {}",
                aggregate.version()
            )));
        }
        Ok(aggregate)
    }

    /// Moves `id` to cold storage.
    ///
    /// Under the aggregate's mutation scope: commits any pending changes,
    /// forces a snapshot at the resulting version, boxes the snapshot and the
    /// change stream, and evicts the instance. The cache entry's expiry is
    /// left alone, so a failed box stays due for the next sweep.
    ///
    /// An instance that was never persisted, or whose stream is already
    /// boxed, is evicted without writing anything and reported as not found.
    ///
    /// # Errors
    ///
    /// - `DomainError::AggregateNotFound` if nothing live is stored for `id`.
    /// - `DomainError::SerializationFailed` if the state cannot be encoded.
    /// - Any store error, unchanged.
    #[tracing::instrument(skip(self), fields(kind = S::KIND))]
    pub async fn box_aggregate(&self, id: Uuid) -> Result<(), DomainError> {
        let live = {
            let _load = self.load_lock.lock().await;
            match self.cache.get(id) {
                Some(live) => live,
                None => {
                    let mut aggregate = self
                        .rehydrate(id)
                        .await?
                        .ok_or(DomainError::AggregateNotFound(id))?;
                    return self.archive(&mut aggregate).await;
                }
            }
        };
        let mut guard = live.lock().await;
        let result = self.archive(&mut guard).await;
        if matches!(result, Ok(()) | Err(DomainError::AggregateNotFound(_))) {
            self.cache.remove_instance(&live);
        }
        result
    }

    async fn archive(&self, aggregate: &mut Aggregate<S>) -> Result<(), DomainError> {
        let id = aggregate.id();
        if aggregate.version() == 0 && aggregate.pending_changes() == 0 {
            tracing::debug!(%id, "never persisted, nothing to box");
            return Err(DomainError::AggregateNotFound(id));
        }
        if self.changes.is_boxed(id).await? {
            tracing::warn!(
                %id,
                dropped = aggregate.pending_changes(),
                "stream already boxed, dropping stale instance"
            );
            return Err(DomainError::AggregateNotFound(id));
        }
        self.commit(aggregate, None, true).await?;
        self.snapshots.box_snapshot(id).await?;
        self.changes.box_changes(id, true).await?;
        tracing::info!(%id, version = aggregate.version(), "aggregate boxed");
        Ok(())
    }

    /// Brings `id` back from cold storage as a fresh chain at version 1.
    ///
    /// The state is taken from the most recent boxed snapshot alone; no
    /// change is replayed. The change stream is reopened and a version-1
    /// snapshot written, so the next save records version 2. The boxed
    /// snapshot is released only after both succeeded; a failed unbox can be
    /// retried.
    ///
    /// # Errors
    ///
    /// - `DomainError::InstanceConflict` if `id` is live in the cache.
    /// - `DomainError::AggregateNotFound` if no boxed snapshot exists.
    /// - Any store or decoding error, unchanged.
    #[tracing::instrument(skip(self), fields(kind = S::KIND))]
    pub async fn unbox(&self, id: Uuid) -> Result<Arc<LiveAggregate<S>>, DomainError> {
        let _load = self.load_lock.lock().await;
        if let Some(cached) = self.cache.get(id) {
            return Err(instance_conflict(id, &cached, 1));
        }
        let Some(snapshot) = self.snapshots.get_boxed(id).await? else {
            return Err(DomainError::AggregateNotFound(id));
        };

        let state = self.decode_snapshot(&snapshot)?;
        let mut aggregate = self.factory.create(id);
        aggregate.restore(1, state, snapshot.root_id, self.clock.now());
        self.changes.box_changes(id, false).await?;
        self.write_snapshot(&mut aggregate).await?;
        self.snapshots.unbox_snapshot(id).await?;

        let live = Arc::new(LiveAggregate::new(aggregate));
        self.cache
            .put(&live, true)
            .map_err(|cached| instance_conflict(id, &cached, 1))?;
        tracing::info!(%id, boxed_version = snapshot.aggregate_version, "aggregate unboxed");
        Ok(live)
    }

    /// Boxes every aggregate of this kind that has been idle past its TTL.
    ///
    /// Candidates are cache entries whose expiry has passed plus identities
    /// the change store reports expired that are not cached. An aggregate
    /// touched again before its turn is skipped, as is one with nothing left
    /// to box. A failed box is recorded in the report and the sweep moves on.
    ///
    /// # Errors
    ///
    /// Any change store error raised while listing expired identities.
    #[tracing::instrument(skip(self), fields(kind = S::KIND))]
    pub async fn ping(&self) -> Result<PingReport, DomainError> {
        let now = self.clock.now();
        let mut candidates = self.cache.expired(now);
        for id in self.changes.get_expired(S::KIND, now).await? {
            if !self.cache.contains(id) && !candidates.contains(&id) {
                candidates.push(id);
            }
        }

        let mut report = PingReport::default();
        for id in candidates {
            if self.cache.is_live(id, now) {
                tracing::debug!(%id, "refreshed since sweep began");
                continue;
            }
            match self.box_aggregate(id).await {
                Ok(()) => report.boxed.push(id),
                Err(DomainError::AggregateNotFound(_)) => {
                    tracing::debug!(%id, "expired entry has nothing to box");
                }
                Err(err) => {
                    tracing::warn!(%id, error = %err, "box failed");
                    report.failed.push((id, err));
                }
            }
        }
        if !report.boxed.is_empty() || !report.failed.is_empty() {
            tracing::info!(
                boxed = report.boxed.len(),
                failed = report.failed.len(),
                "idle aggregates swept"
            );
        }
        Ok(report)
    }

    /// Whether the change store holds any live change for `id`.
    ///
    /// # Errors
    ///
    /// Any change store error, unchanged.
    pub async fn exists(&self, id: Uuid) -> Result<bool, DomainError> {
        self.changes.exists(id).await
    }

    /// Drops `id` from the cache without boxing it. Returns whether it was
    /// cached.
    pub fn evict(&self, id: Uuid) -> bool {
        self.cache.remove(id).is_some()
    }
}

impl<S: AggregateState> std::fmt::Debug for AggregateRepository<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateRepository")
            .field("kind", &S::KIND)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// Applies `changes` in order, stopping after `up_to` when given. Returns how
/// many were applied.
fn replay<S: AggregateState>(
    aggregate: &mut Aggregate<S>,
    changes: &[StoredChange],
    up_to: Option<i64>,
) -> Result<usize, DomainError> {
    let mut applied = 0;
    for stored in changes {
        if up_to.is_some_and(|limit| stored.sequence_number > limit) {
            break;
        }
        let change = stored.to_change::<S::Change>(S::KIND)?;
        aggregate.replay(stored.sequence_number, &change.kind)?;
        applied += 1;
    }
    Ok(applied)
}
