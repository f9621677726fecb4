// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batch processors.
//!
//! A processor is one unit of work inside a process loop cycle. The common
//! case is [`EntitiesProcessor`]: fetch a batch, apply a transition function
//! to each element, count the elements whose function reported success.

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::warn;

use crate::entity::StatefulEntity;
use crate::error::Result;
use crate::store::{StateFilter, StatefulEntityStore};

/// One unit of work run by a process loop on every cycle.
#[async_trait]
pub trait EntityProcessor: Send + Sync {
    /// Process one batch and return how many elements made progress.
    ///
    /// An `Err` aborts the rest of the cycle; the loop then consults the
    /// error's severity.
    async fn process(&self) -> Result<usize>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "processor"
    }
}

type Supplier<E> = Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<E>>> + Send + Sync>;
type Function<E> = Arc<dyn Fn(E) -> BoxFuture<'static, Result<bool>> + Send + Sync>;
type Release<E> = Arc<dyn Fn(Vec<E>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Fetch-then-apply processor.
///
/// Elements are handled sequentially in supplier order. The first element
/// whose function returns `Err` stops the batch and the error is returned.
/// The elements not yet handled are passed to the release hook, if any.
pub struct EntitiesProcessor<E> {
    name: String,
    supplier: Supplier<E>,
    function: Function<E>,
    release: Option<Release<E>>,
}

impl<E> Clone for EntitiesProcessor<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            supplier: self.supplier.clone(),
            function: self.function.clone(),
            release: self.release.clone(),
        }
    }
}

impl<E: Send + 'static> EntitiesProcessor<E> {
    /// Build a processor from a batch supplier and a per-element function.
    ///
    /// ```ignore
    /// let processor = EntitiesProcessor::new(
    ///     || async { Ok(vec!["x".to_string()]) },
    ///     |_element| async { Ok(true) },
    /// );
    /// ```
    pub fn new<S, SF, F, FF>(supplier: S, function: F) -> Self
    where
        S: Fn() -> SF + Send + Sync + 'static,
        SF: Future<Output = Result<Vec<E>>> + Send + 'static,
        F: Fn(E) -> FF + Send + Sync + 'static,
        FF: Future<Output = Result<bool>> + Send + 'static,
    {
        Self {
            name: "entities".to_string(),
            supplier: Arc::new(move || supplier().boxed()),
            function: Arc::new(move |element| function(element).boxed()),
            release: None,
        }
    }

    /// Set the name used in logs.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Hook receiving the unhandled rest of a batch aborted by an error.
    pub fn release_with<R, RF>(mut self, release: R) -> Self
    where
        R: Fn(Vec<E>) -> RF + Send + Sync + 'static,
        RF: Future<Output = ()> + Send + 'static,
    {
        self.release = Some(Arc::new(move |rest| release(rest).boxed()));
        self
    }
}

impl<E: StatefulEntity> EntitiesProcessor<E> {
    /// Processor whose batch comes from `store.next_not_leased(batch_size, filter)`.
    ///
    /// When the function fails, leases on the rest of the batch are broken
    /// so other owners can pick those entities up right away.
    pub fn leased<St, F, FF>(store: Arc<St>, filter: StateFilter, batch_size: usize, function: F) -> Self
    where
        St: StatefulEntityStore<E> + ?Sized + 'static,
        F: Fn(E) -> FF + Send + Sync + 'static,
        FF: Future<Output = Result<bool>> + Send + 'static,
    {
        let filter = Arc::new(filter);
        let releaser = store.clone();
        Self::new(
            move || {
                let store = store.clone();
                let filter = filter.clone();
                async move { store.next_not_leased(batch_size, &filter).await }
            },
            function,
        )
        .release_with(move |rest: Vec<E>| {
            let store = releaser.clone();
            async move {
                for entity in rest {
                    if let Err(e) = store.break_lease(entity.id()).await {
                        warn!(entity_id = %entity.id(), error = %e, "Failed to release lease");
                    }
                }
            }
        })
    }
}

#[async_trait]
impl<E: Send + 'static> EntityProcessor for EntitiesProcessor<E> {
    async fn process(&self) -> Result<usize> {
        let mut batch = (self.supplier)().await?.into_iter();
        let mut processed = 0;
        while let Some(element) = batch.next() {
            match (self.function)(element).await {
                Ok(true) => processed += 1,
                Ok(false) => {}
                Err(e) => {
                    if let Some(release) = &self.release {
                        release(batch.collect()).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(processed)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::tests::TestEntity;
    use crate::error::EngineError;
    use crate::store::InMemoryEntityStore;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_counts_only_true_results() {
        let processor = EntitiesProcessor::new(
            || async { Ok(vec![1, 2, 3, 4]) },
            |n: i32| async move { Ok(n % 2 == 0) },
        );
        assert_eq!(processor.process().await.unwrap(), 2);
        assert_eq!(processor.name(), "entities");
    }

    #[tokio::test]
    async fn test_empty_batch_processes_nothing() {
        let processor = EntitiesProcessor::new(
            || async { Ok(Vec::<String>::new()) },
            |_e: String| async { Ok(true) },
        )
        .named("empty");
        assert_eq!(processor.process().await.unwrap(), 0);
        assert_eq!(processor.name(), "empty");
    }

    #[tokio::test]
    async fn test_function_error_stops_batch() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_fn = seen.clone();
        let processor = EntitiesProcessor::new(
            || async { Ok(vec![1, 2, 3]) },
            move |n: i32| {
                seen_in_fn.lock().unwrap().push(n);
                async move {
                    if n == 2 {
                        Err(EngineError::store("send", "unreachable"))
                    } else {
                        Ok(true)
                    }
                }
            },
        );

        assert!(processor.process().await.is_err());
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_supplier_error_propagates() {
        let processor = EntitiesProcessor::new(
            || async { Err::<Vec<i32>, _>(EngineError::fatal("store gone")) },
            |_n: i32| async { Ok(true) },
        );
        let err = processor.process().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_leased_processor_pulls_from_store() {
        let store = Arc::new(InMemoryEntityStore::<TestEntity>::new("a"));
        for id in ["e-1", "e-2", "e-3"] {
            store.save(&TestEntity::new(id, 100)).await.unwrap();
        }
        store.save(&TestEntity::new("e-4", 200)).await.unwrap();

        let saver = store.clone();
        let processor = EntitiesProcessor::leased(
            store.clone(),
            StateFilter::state(100),
            2,
            move |mut entity: TestEntity| {
                let store = saver.clone();
                async move {
                    entity.transition_to(200);
                    store.save(&entity).await?;
                    Ok(true)
                }
            },
        );

        assert_eq!(processor.process().await.unwrap(), 2);
        assert_eq!(processor.process().await.unwrap(), 1);
        assert_eq!(processor.process().await.unwrap(), 0);

        let remaining = store
            .next_not_leased(10, &StateFilter::state(100))
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn test_leased_processor_releases_rest_of_failed_batch() {
        let store = Arc::new(InMemoryEntityStore::<TestEntity>::new("a"));
        for id in ["e-1", "e-2", "e-3"] {
            store.save(&TestEntity::new(id, 100)).await.unwrap();
        }

        let processor = EntitiesProcessor::leased(
            store.clone(),
            StateFilter::state(100),
            10,
            |entity: TestEntity| async move {
                if entity.id() == "e-1" {
                    Err(EngineError::store("save", "connection reset"))
                } else {
                    Ok(true)
                }
            },
        );
        assert!(processor.process().await.is_err());

        // e-1 keeps its lease until expiry; the untouched rest is free again.
        assert!(store.lease_of("e-1").await.unwrap().is_some());
        assert!(store.lease_of("e-2").await.unwrap().is_none());
        assert!(store.lease_of("e-3").await.unwrap().is_none());

        let other = store.with_owner("b");
        let batch = other
            .next_not_leased(10, &StateFilter::state(100))
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
    }
}
