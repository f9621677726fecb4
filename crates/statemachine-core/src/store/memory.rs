// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store.
//!
//! All handles created through [`InMemoryEntityStore::with_owner`] share one
//! map, so several owners contending for the same entities can be simulated
//! inside a single process. Every operation takes the map lock once, which
//! makes select-and-lease atomic.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{DEFAULT_LEASE_DURATION, StateFilter, StatefulEntityStore, StoreResult};
use crate::entity::StatefulEntity;
use crate::error::{EngineError, Result};
use crate::lease::{Clock, Lease, SystemClock};

struct Inner<T> {
    entities: HashMap<String, T>,
    leases: HashMap<String, Lease>,
}

/// Process-local store backed by a `HashMap`.
pub struct InMemoryEntityStore<T: StatefulEntity> {
    inner: Arc<Mutex<Inner<T>>>,
    lease_holder: String,
    lease_duration: Duration,
    clock: Arc<dyn Clock>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: StatefulEntity> Clone for InMemoryEntityStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            lease_holder: self.lease_holder.clone(),
            lease_duration: self.lease_duration,
            clock: self.clock.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T: StatefulEntity> fmt::Debug for InMemoryEntityStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryEntityStore")
            .field("entity_type", &T::ENTITY_TYPE)
            .field("lease_holder", &self.lease_holder)
            .field("lease_duration", &self.lease_duration)
            .finish()
    }
}

impl<T: StatefulEntity> InMemoryEntityStore<T> {
    /// Create an empty store leasing on behalf of `lease_holder`.
    pub fn new(lease_holder: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entities: HashMap::new(),
                leases: HashMap::new(),
            })),
            lease_holder: lease_holder.into(),
            lease_duration: DEFAULT_LEASE_DURATION,
            clock: Arc::new(SystemClock),
            _entity: PhantomData,
        }
    }

    /// Set the lease validity window.
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Use a different clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Another handle on the same data, leasing for `lease_holder`.
    pub fn with_owner(&self, lease_holder: impl Into<String>) -> Self {
        Self {
            lease_holder: lease_holder.into(),
            ..self.clone()
        }
    }

    /// Number of stored entities.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entities.len()
    }

    /// Whether the store holds no entities.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entities.is_empty()
    }

    fn foreign_lease<'a>(&self, inner: &'a Inner<T>, id: &str) -> Option<&'a Lease> {
        let now = self.clock.now();
        inner
            .leases
            .get(id)
            .filter(|lease| !lease.can_be_acquired_by(&self.lease_holder, now))
    }

    fn new_lease(&self, id: &str) -> Lease {
        Lease::new(
            id,
            self.lease_holder.clone(),
            self.clock.now(),
            self.lease_duration,
        )
    }
}

#[async_trait]
impl<T: StatefulEntity> StatefulEntityStore<T> for InMemoryEntityStore<T> {
    fn lease_holder(&self) -> &str {
        &self.lease_holder
    }

    async fn next_not_leased(&self, max: usize, filter: &StateFilter) -> Result<Vec<T>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let mut inner = self.inner.lock().await;
        let mut candidates: Vec<&T> = inner
            .entities
            .values()
            .filter(|e| filter.matches(e.meta()))
            .filter(|e| self.foreign_lease(&inner, e.id()).is_none())
            .collect();
        candidates.sort_by(|a, b| {
            a.meta()
                .state_timestamp
                .cmp(&b.meta().state_timestamp)
                .then_with(|| a.id().cmp(b.id()))
        });
        let batch: Vec<T> = candidates.into_iter().take(max).cloned().collect();

        for entity in &batch {
            let lease = self.new_lease(entity.id());
            inner.leases.insert(entity.id().to_string(), lease);
        }

        debug!(
            entity_type = T::ENTITY_TYPE,
            lease_holder = %self.lease_holder,
            leased = batch.len(),
            "Leased entities"
        );
        Ok(batch)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<T>> {
        Ok(self.inner.lock().await.entities.get(id).cloned())
    }

    async fn find_by_id_and_lease(&self, id: &str) -> Result<StoreResult<T>> {
        let mut inner = self.inner.lock().await;
        let Some(entity) = inner.entities.get(id).cloned() else {
            return Ok(StoreResult::NotFound);
        };
        if let Some(lease) = self.foreign_lease(&inner, id) {
            return Ok(StoreResult::AlreadyLeased {
                leased_by: lease.leased_by.clone(),
            });
        }
        inner.leases.insert(id.to_string(), self.new_lease(id));
        Ok(StoreResult::Success(entity))
    }

    async fn save(&self, entity: &T) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(lease) = self.foreign_lease(&inner, entity.id()) {
            return Err(EngineError::AlreadyLeased {
                entity_id: entity.id().to_string(),
                leased_by: lease.leased_by.clone(),
            });
        }
        inner
            .entities
            .insert(entity.id().to_string(), entity.clone());
        inner.leases.remove(entity.id());
        Ok(())
    }

    async fn delete_by_id(&self, id: &str) -> Result<StoreResult<()>> {
        let mut inner = self.inner.lock().await;
        if !inner.entities.contains_key(id) {
            return Ok(StoreResult::NotFound);
        }
        if let Some(lease) = self.foreign_lease(&inner, id) {
            return Ok(StoreResult::AlreadyLeased {
                leased_by: lease.leased_by.clone(),
            });
        }
        inner.entities.remove(id);
        inner.leases.remove(id);
        Ok(StoreResult::Success(()))
    }

    async fn break_lease(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner
            .leases
            .get(id)
            .is_some_and(|lease| lease.is_held_by(&self.lease_holder))
        {
            inner.leases.remove(id);
        }
        Ok(())
    }

    async fn lease_of(&self, id: &str) -> Result<Option<Lease>> {
        Ok(self.inner.lock().await.leases.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::tests::TestEntity;
    use crate::lease::ManualClock;

    fn store(clock: &ManualClock, owner: &str) -> InMemoryEntityStore<TestEntity> {
        InMemoryEntityStore::new(owner)
            .with_lease_duration(Duration::from_secs(60))
            .with_clock(Arc::new(clock.clone()))
    }

    async fn seed(store: &InMemoryEntityStore<TestEntity>, ids: &[&str], state: i32) {
        for id in ids {
            store.save(&TestEntity::new(id, state)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_next_not_leased_leases_selected_entities() {
        let clock = ManualClock::default();
        let a = store(&clock, "a");
        let b = a.with_owner("b");
        seed(&a, &["e-1", "e-2", "e-3"], 100).await;

        let first = a.next_not_leased(2, &StateFilter::state(100)).await.unwrap();
        assert_eq!(first.len(), 2);

        let second = b.next_not_leased(10, &StateFilter::state(100)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert!(first.iter().all(|e| e.id() != second[0].id()));

        let lease = a.lease_of(first[0].id()).await.unwrap().unwrap();
        assert_eq!(lease.leased_by, "a");
    }

    #[tokio::test]
    async fn test_next_not_leased_max_zero_is_empty() {
        let clock = ManualClock::default();
        let a = store(&clock, "a");
        seed(&a, &["e-1"], 100).await;

        assert!(a.next_not_leased(0, &StateFilter::any()).await.unwrap().is_empty());
        assert!(a.lease_of("e-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_next_not_leased_orders_by_state_timestamp() {
        let clock = ManualClock::default();
        let a = store(&clock, "a");
        let now = clock.now();

        let mut newer = TestEntity::new("aaa", 100);
        newer.meta.state_timestamp = now;
        let mut older = TestEntity::new("zzz", 100);
        older.meta.state_timestamp = now - chrono::Duration::seconds(10);
        a.save(&newer).await.unwrap();
        a.save(&older).await.unwrap();

        let batch = a.next_not_leased(1, &StateFilter::any()).await.unwrap();
        assert_eq!(batch[0].id(), "zzz");
    }

    #[tokio::test]
    async fn test_filter_excludes_pending_and_other_states() {
        let clock = ManualClock::default();
        let a = store(&clock, "a");
        seed(&a, &["e-1"], 100).await;
        seed(&a, &["e-2"], 200).await;
        let mut pending = TestEntity::new("e-3", 100);
        pending.set_pending(true);
        a.save(&pending).await.unwrap();

        let batch = a
            .next_not_leased(10, &StateFilter::state(100).not_pending())
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id(), "e-1");
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let clock = ManualClock::default();
        let a = store(&clock, "a");
        let b = a.with_owner("b");
        seed(&a, &["e-1"], 100).await;

        assert_eq!(a.next_not_leased(1, &StateFilter::any()).await.unwrap().len(), 1);
        assert!(b.next_not_leased(1, &StateFilter::any()).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(60));

        let taken = b.next_not_leased(1, &StateFilter::any()).await.unwrap();
        assert_eq!(taken.len(), 1);
        assert_eq!(a.lease_of("e-1").await.unwrap().unwrap().leased_by, "b");
    }

    #[tokio::test]
    async fn test_save_releases_own_lease() {
        let clock = ManualClock::default();
        let a = store(&clock, "a");
        let b = a.with_owner("b");
        seed(&a, &["e-1"], 100).await;

        let mut leased = a.next_not_leased(1, &StateFilter::any()).await.unwrap();
        let mut entity = leased.remove(0);
        entity.transition_to(200);
        a.save(&entity).await.unwrap();

        assert!(a.lease_of("e-1").await.unwrap().is_none());
        let visible = b.next_not_leased(1, &StateFilter::state(200)).await.unwrap();
        assert_eq!(visible.len(), 1);
    }

    #[tokio::test]
    async fn test_save_rejected_while_leased_by_other() {
        let clock = ManualClock::default();
        let a = store(&clock, "a");
        let b = a.with_owner("b");
        seed(&a, &["e-1"], 100).await;
        a.next_not_leased(1, &StateFilter::any()).await.unwrap();

        let err = b.save(&TestEntity::new("e-1", 300)).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::AlreadyLeased { ref leased_by, .. } if leased_by == "a"
        ));
        assert_eq!(b.find_by_id("e-1").await.unwrap().unwrap().state(), 100);
    }

    #[tokio::test]
    async fn test_find_by_id_and_lease_outcomes() {
        let clock = ManualClock::default();
        let a = store(&clock, "a");
        let b = a.with_owner("b");
        seed(&a, &["e-1"], 100).await;

        assert_eq!(a.find_by_id_and_lease("missing").await.unwrap(), StoreResult::NotFound);

        let leased = a.find_by_id_and_lease("e-1").await.unwrap();
        assert!(leased.is_success());
        // renewing one's own lease is allowed
        assert!(a.find_by_id_and_lease("e-1").await.unwrap().is_success());

        assert_eq!(
            b.find_by_id_and_lease("e-1").await.unwrap(),
            StoreResult::AlreadyLeased {
                leased_by: "a".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_delete_respects_foreign_lease() {
        let clock = ManualClock::default();
        let a = store(&clock, "a");
        let b = a.with_owner("b");
        seed(&a, &["e-1"], 100).await;
        a.find_by_id_and_lease("e-1").await.unwrap();

        assert!(matches!(
            b.delete_by_id("e-1").await.unwrap(),
            StoreResult::AlreadyLeased { .. }
        ));
        assert_eq!(a.delete_by_id("e-1").await.unwrap(), StoreResult::Success(()));
        assert_eq!(a.delete_by_id("e-1").await.unwrap(), StoreResult::NotFound);
        assert!(a.is_empty().await);
        assert!(a.lease_of("e-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_break_lease_only_removes_own_lease() {
        let clock = ManualClock::default();
        let a = store(&clock, "a");
        let b = a.with_owner("b");
        seed(&a, &["e-1"], 100).await;
        a.next_not_leased(1, &StateFilter::any()).await.unwrap();

        b.break_lease("e-1").await.unwrap();
        assert!(a.lease_of("e-1").await.unwrap().is_some());

        a.break_lease("e-1").await.unwrap();
        assert!(a.lease_of("e-1").await.unwrap().is_none());
        assert_eq!(b.next_not_leased(1, &StateFilter::any()).await.unwrap().len(), 1);
    }
}
