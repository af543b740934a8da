//! Sliding-TTL cache of live aggregate instances.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use cairn_core::aggregate::{Aggregate, AggregateState};
use cairn_core::clock::Clock;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::MutexGuard;
use uuid::Uuid;

/// The single shared in-process instance of one aggregate.
///
/// Mutation happens only through the guard returned by
/// [`lock`](LiveAggregate::lock); the identity is readable without it.
#[derive(Debug)]
pub struct LiveAggregate<S: AggregateState> {
    id: Uuid,
    inner: tokio::sync::Mutex<Aggregate<S>>,
}

impl<S: AggregateState> LiveAggregate<S> {
    /// Takes ownership of `aggregate`.
    #[must_use]
    pub fn new(aggregate: Aggregate<S>) -> Self {
        Self {
            id: aggregate.id(),
            inner: tokio::sync::Mutex::new(aggregate),
        }
    }

    /// Returns the aggregate identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Acquires the exclusive mutation scope of this instance.
    pub async fn lock(&self) -> MutexGuard<'_, Aggregate<S>> {
        self.inner.lock().await
    }

    /// Committed version, if the instance is not currently locked.
    #[must_use]
    pub fn try_version(&self) -> Option<i64> {
        self.inner.try_lock().ok().map(|a| a.version())
    }
}

#[derive(Debug)]
struct Entry<S: AggregateState> {
    aggregate: Arc<LiveAggregate<S>>,
    expires_at: DateTime<Utc>,
}

/// Identity-keyed cache of live aggregates.
///
/// Every write with `reset_ttl` and every [`touch`](AggregateCache::touch)
/// pushes the expiry to now + ttl. Nothing is evicted on its own: expired
/// entries stay until [`remove`](AggregateCache::remove) is called, normally
/// by a sweep.
pub struct AggregateCache<S: AggregateState> {
    entries: Mutex<HashMap<Uuid, Entry<S>>>,
    ttl: TimeDelta,
    clock: Arc<dyn Clock>,
}

impl<S: AggregateState> AggregateCache<S> {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(ttl: TimeDelta, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    /// Sliding expiry applied on access.
    #[must_use]
    pub fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Entry<S>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cached instance without refreshing its expiry.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<Arc<LiveAggregate<S>>> {
        self.entries().get(&id).map(|e| Arc::clone(&e.aggregate))
    }

    /// Returns the cached instance and refreshes its expiry.
    pub fn touch(&self, id: Uuid) -> Option<Arc<LiveAggregate<S>>> {
        let expires_at = self.clock.now() + self.ttl;
        let mut entries = self.entries();
        let entry = entries.get_mut(&id)?;
        entry.expires_at = expires_at;
        Some(Arc::clone(&entry.aggregate))
    }

    /// Registers `aggregate` under its identity. Returns `true` when this
    /// call inserted the entry.
    ///
    /// Putting the instance that is already cached is a no-op apart from the
    /// expiry refresh requested by `reset_ttl`.
    ///
    /// # Errors
    ///
    /// Returns the cached instance, untouched, if a different instance holds
    /// the identity.
    pub fn put(
        &self,
        aggregate: &Arc<LiveAggregate<S>>,
        reset_ttl: bool,
    ) -> Result<bool, Arc<LiveAggregate<S>>> {
        let expires_at = self.clock.now() + self.ttl;
        let mut entries = self.entries();
        match entries.get_mut(&aggregate.id()) {
            Some(entry) if !Arc::ptr_eq(&entry.aggregate, aggregate) => {
                Err(Arc::clone(&entry.aggregate))
            }
            Some(entry) => {
                if reset_ttl {
                    entry.expires_at = expires_at;
                }
                Ok(false)
            }
            None => {
                entries.insert(
                    aggregate.id(),
                    Entry {
                        aggregate: Arc::clone(aggregate),
                        expires_at,
                    },
                );
                Ok(true)
            }
        }
    }

    /// Drops the entry for `id`.
    pub fn remove(&self, id: Uuid) -> Option<Arc<LiveAggregate<S>>> {
        self.entries().remove(&id).map(|e| e.aggregate)
    }

    /// Drops the entry for the identity of `aggregate` only if it still holds
    /// that exact instance.
    pub fn remove_instance(&self, aggregate: &Arc<LiveAggregate<S>>) -> bool {
        let mut entries = self.entries();
        let same = entries
            .get(&aggregate.id())
            .is_some_and(|e| Arc::ptr_eq(&e.aggregate, aggregate));
        if same {
            entries.remove(&aggregate.id());
        }
        same
    }

    /// When the entry for `id` expires.
    #[must_use]
    pub fn expires_at(&self, id: Uuid) -> Option<DateTime<Utc>> {
        self.entries().get(&id).map(|e| e.expires_at)
    }

    /// Whether `id` is cached with an expiry after `as_of`.
    #[must_use]
    pub fn is_live(&self, id: Uuid, as_of: DateTime<Utc>) -> bool {
        self.entries().get(&id).is_some_and(|e| e.expires_at > as_of)
    }

    /// Whether `id` is cached at all, expired or not.
    #[must_use]
    pub fn contains(&self, id: Uuid) -> bool {
        self.entries().contains_key(&id)
    }

    /// Identities whose expiry is at or before `as_of`, in ascending order.
    #[must_use]
    pub fn expired(&self, as_of: DateTime<Utc>) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .entries()
            .iter()
            .filter(|(_, e)| e.expires_at <= as_of)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl<S: AggregateState> std::fmt::Debug for AggregateCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateCache")
            .field("ttl", &self.ttl)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_test_support::ledger::LedgerState;
    use cairn_test_support::{ManualClock, fixed_time};

    fn cache(clock: &Arc<ManualClock>) -> AggregateCache<LedgerState> {
        AggregateCache::new(TimeDelta::seconds(300), clock.clone())
    }

    fn live(id: Uuid) -> Arc<LiveAggregate<LedgerState>> {
        Arc::new(LiveAggregate::new(Aggregate::new(id)))
    }

    #[test]
    fn test_put_registers_with_sliding_expiry() {
        // Arrange
        let clock = Arc::new(ManualClock::new(fixed_time()));
        let cache = cache(&clock);
        let id = Uuid::new_v4();
        let aggregate = live(id);

        // Act
        cache.put(&aggregate, true).unwrap();

        // Assert
        assert!(Arc::ptr_eq(&cache.get(id).unwrap(), &aggregate));
        assert_eq!(cache.expires_at(id), Some(fixed_time() + TimeDelta::seconds(300)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_put_same_instance_refreshes_only_when_asked() {
        let clock = Arc::new(ManualClock::new(fixed_time()));
        let cache = cache(&clock);
        let id = Uuid::new_v4();
        let aggregate = live(id);
        assert!(cache.put(&aggregate, true).unwrap());

        clock.advance(TimeDelta::seconds(100));
        assert!(!cache.put(&aggregate, false).unwrap());
        assert_eq!(cache.expires_at(id), Some(fixed_time() + TimeDelta::seconds(300)));

        assert!(!cache.put(&aggregate, true).unwrap());
        assert_eq!(cache.expires_at(id), Some(fixed_time() + TimeDelta::seconds(400)));
    }

    #[test]
    fn test_put_rejects_second_instance_for_identity() {
        let clock = Arc::new(ManualClock::new(fixed_time()));
        let cache = cache(&clock);
        let id = Uuid::new_v4();
        let first = live(id);
        cache.put(&first, true).unwrap();

        let rejected = cache.put(&live(id), true).unwrap_err();

        assert!(Arc::ptr_eq(&rejected, &first));
        assert!(Arc::ptr_eq(&cache.get(id).unwrap(), &first));
    }

    #[test]
    fn test_touch_refreshes_and_get_does_not() {
        let clock = Arc::new(ManualClock::new(fixed_time()));
        let cache = cache(&clock);
        let id = Uuid::new_v4();
        cache.put(&live(id), true).unwrap();
        clock.advance(TimeDelta::seconds(200));

        let _ = cache.get(id);
        assert_eq!(cache.expires_at(id), Some(fixed_time() + TimeDelta::seconds(300)));

        assert!(cache.touch(id).is_some());
        assert_eq!(cache.expires_at(id), Some(fixed_time() + TimeDelta::seconds(500)));
        assert!(cache.touch(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_expired_is_inclusive_and_entries_stay_until_removed() {
        let clock = Arc::new(ManualClock::new(fixed_time()));
        let cache = cache(&clock);
        let id = Uuid::new_v4();
        cache.put(&live(id), true).unwrap();

        assert!(cache.expired(fixed_time() + TimeDelta::seconds(299)).is_empty());
        assert!(cache.is_live(id, fixed_time() + TimeDelta::seconds(299)));
        assert_eq!(cache.expired(fixed_time() + TimeDelta::seconds(300)), vec![id]);
        assert!(!cache.is_live(id, fixed_time() + TimeDelta::seconds(300)));
        assert!(cache.contains(id));

        assert!(cache.remove(id).is_some());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove_instance_ignores_other_instances() {
        let clock = Arc::new(ManualClock::new(fixed_time()));
        let cache = cache(&clock);
        let id = Uuid::new_v4();
        let cached = live(id);
        cache.put(&cached, true).unwrap();

        assert!(!cache.remove_instance(&live(id)));
        assert!(cache.contains(id));
        assert!(cache.remove_instance(&cached));
        assert!(!cache.contains(id));
    }

    #[tokio::test]
    async fn test_try_version_is_none_while_locked() {
        let aggregate = live(Uuid::new_v4());

        assert_eq!(aggregate.try_version(), Some(0));
        let guard = aggregate.lock().await;
        assert_eq!(aggregate.try_version(), None);
        drop(guard);
        assert_eq!(aggregate.try_version(), Some(0));
    }
}
