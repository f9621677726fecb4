// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed store.
//!
//! Same schema and lease protocol as the SQLite store. Row-level operations
//! are plain functions over any executor, a pool or an open transaction;
//! [`PostgresEntityStore`] binds them to an entity type and a lease owner.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgExecutor, PgPool};
use sqlx::postgres::PgPoolOptions;
use tracing::{debug, warn};

use super::{DEFAULT_LEASE_DURATION, StateFilter, StatefulEntityStore, StoreResult};
use crate::entity::StatefulEntity;
use crate::error::{EngineError, Result};
use crate::lease::{Clock, Lease, SystemClock, duration_millis};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgres");

// ============================================================================
// Row Operations
// ============================================================================

/// Lease row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LeaseRecord {
    /// Owner of the lease.
    pub leased_by: String,
    /// Acquisition time, epoch milliseconds.
    pub leased_at: i64,
    /// Validity window in milliseconds.
    pub lease_duration_ms: i64,
}

/// Take or renew a lease. Returns whether `leased_by` now owns it.
pub async fn acquire_lease<'e>(
    executor: impl PgExecutor<'e>,
    entity_type: &str,
    entity_id: &str,
    leased_by: &str,
    now_ms: i64,
    lease_duration_ms: i64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO entity_leases (entity_type, entity_id, leased_by, leased_at, lease_duration_ms)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (entity_type, entity_id) DO UPDATE SET
            leased_by = EXCLUDED.leased_by,
            leased_at = EXCLUDED.leased_at,
            lease_duration_ms = EXCLUDED.lease_duration_ms
        WHERE entity_leases.leased_by = EXCLUDED.leased_by
           OR entity_leases.leased_at + entity_leases.lease_duration_ms <= EXCLUDED.leased_at
        "#,
    )
    .bind(entity_type)
    .bind(entity_id)
    .bind(leased_by)
    .bind(now_ms)
    .bind(lease_duration_ms)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Delete a lease if it is held by `leased_by`.
pub async fn release_lease<'e>(
    executor: impl PgExecutor<'e>,
    entity_type: &str,
    entity_id: &str,
    leased_by: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        DELETE FROM entity_leases
        WHERE entity_type = $1 AND entity_id = $2 AND leased_by = $3
        "#,
    )
    .bind(entity_type)
    .bind(entity_id)
    .bind(leased_by)
    .execute(executor)
    .await?;
    Ok(())
}

/// Fetch the lease row for an entity.
pub async fn get_lease<'e>(
    executor: impl PgExecutor<'e>,
    entity_type: &str,
    entity_id: &str,
) -> Result<Option<LeaseRecord>> {
    let record = sqlx::query_as::<_, LeaseRecord>(
        r#"
        SELECT leased_by, leased_at, lease_duration_ms
        FROM entity_leases
        WHERE entity_type = $1 AND entity_id = $2
        "#,
    )
    .bind(entity_type)
    .bind(entity_id)
    .fetch_optional(executor)
    .await?;

    Ok(record)
}

/// Fetch an entity's JSON payload.
pub async fn get_payload<'e>(
    executor: impl PgExecutor<'e>,
    entity_type: &str,
    id: &str,
) -> Result<Option<String>> {
    let payload = sqlx::query_scalar(
        r#"
        SELECT payload FROM state_entities
        WHERE entity_type = $1 AND id = $2
        "#,
    )
    .bind(entity_type)
    .bind(id)
    .fetch_optional(executor)
    .await?;

    Ok(payload)
}

/// Ids of entities matching `filter` that `leased_by` may lease at `now_ms`.
pub async fn select_candidates<'e>(
    executor: impl PgExecutor<'e>,
    entity_type: &str,
    leased_by: &str,
    now_ms: i64,
    filter: &StateFilter,
    limit: i64,
) -> Result<Vec<String>> {
    let sql = format!(
        r#"
        SELECT e.id FROM state_entities e
        LEFT JOIN entity_leases l
            ON l.entity_type = e.entity_type AND l.entity_id = e.id
        WHERE e.entity_type = $1
          AND (l.entity_id IS NULL
               OR l.leased_by = $2
               OR l.leased_at + l.lease_duration_ms <= $3)
          AND {}
          AND ($4::BOOLEAN IS NULL OR e.pending = $4)
        ORDER BY e.state_timestamp ASC, e.id ASC
        LIMIT $5
        "#,
        filter.states.sql_condition("e.state")
    );

    let ids = sqlx::query_scalar(&sql)
        .bind(entity_type)
        .bind(leased_by)
        .bind(now_ms)
        .bind(filter.pending)
        .bind(limit)
        .fetch_all(executor)
        .await?;

    Ok(ids)
}

// ============================================================================
// Store
// ============================================================================

/// PostgreSQL-backed store for one entity type.
pub struct PostgresEntityStore<T: StatefulEntity> {
    pool: PgPool,
    lease_holder: String,
    lease_duration: Duration,
    clock: Arc<dyn Clock>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: StatefulEntity> Clone for PostgresEntityStore<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            lease_holder: self.lease_holder.clone(),
            lease_duration: self.lease_duration,
            clock: self.clock.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T: StatefulEntity> fmt::Debug for PostgresEntityStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresEntityStore")
            .field("entity_type", &T::ENTITY_TYPE)
            .field("lease_holder", &self.lease_holder)
            .field("lease_duration", &self.lease_duration)
            .finish()
    }
}

impl<T: StatefulEntity> PostgresEntityStore<T> {
    /// Create a store on an existing, already migrated pool.
    pub fn new(pool: PgPool, lease_holder: impl Into<String>) -> Self {
        Self {
            pool,
            lease_holder: lease_holder.into(),
            lease_duration: DEFAULT_LEASE_DURATION,
            clock: Arc::new(SystemClock),
            _entity: PhantomData,
        }
    }

    /// Connect to `url` and run migrations.
    pub async fn connect(url: &str, lease_holder: impl Into<String>) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| EngineError::store("connect", format!("Failed to connect to PostgreSQL: {}", e)))?;

        Self::migrate(&pool).await?;
        Ok(Self::new(pool, lease_holder))
    }

    /// Run the store's migrations on `pool`.
    pub async fn migrate(pool: &PgPool) -> Result<()> {
        MIGRATOR.run(pool).await?;
        Ok(())
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

    /// Another handle on the same database, leasing for `lease_holder`.
    pub fn with_owner(&self, lease_holder: impl Into<String>) -> Self {
        Self {
            lease_holder: lease_holder.into(),
            ..self.clone()
        }
    }

    /// A handle for a different entity type sharing pool, owner and clock.
    pub fn for_entity<U: StatefulEntity>(&self) -> PostgresEntityStore<U> {
        PostgresEntityStore {
            pool: self.pool.clone(),
            lease_holder: self.lease_holder.clone(),
            lease_duration: self.lease_duration,
            clock: self.clock.clone(),
            _entity: PhantomData,
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    async fn acquire<'e>(&self, executor: impl PgExecutor<'e>, id: &str, now_ms: i64) -> Result<bool> {
        acquire_lease(
            executor,
            T::ENTITY_TYPE,
            id,
            &self.lease_holder,
            now_ms,
            duration_millis(self.lease_duration),
        )
        .await
    }

    async fn load(&self, id: &str) -> Result<Option<T>> {
        get_payload(&self.pool, T::ENTITY_TYPE, id)
            .await?
            .map(|p| serde_json::from_str(&p).map_err(EngineError::from))
            .transpose()
    }

    async fn current_owner(&self, id: &str) -> Result<String> {
        Ok(get_lease(&self.pool, T::ENTITY_TYPE, id)
            .await?
            .map(|r| r.leased_by)
            .unwrap_or_default())
    }
}

#[async_trait]
impl<T: StatefulEntity> StatefulEntityStore<T> for PostgresEntityStore<T> {
    fn lease_holder(&self) -> &str {
        &self.lease_holder
    }

    async fn next_not_leased(&self, max: usize, filter: &StateFilter) -> Result<Vec<T>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let now_ms = self.now_ms();
        let mut tx = self.pool.begin().await?;
        let candidates = select_candidates(
            &mut *tx,
            T::ENTITY_TYPE,
            &self.lease_holder,
            now_ms,
            filter,
            i64::try_from(max).unwrap_or(i64::MAX),
        )
        .await?;

        let mut leased = Vec::with_capacity(candidates.len());
        for id in candidates {
            if !self.acquire(&mut *tx, &id, now_ms).await? {
                debug!(entity_id = %id, "Lost lease race");
                continue;
            }
            let Some(payload) = get_payload(&mut *tx, T::ENTITY_TYPE, &id).await? else {
                release_lease(&mut *tx, T::ENTITY_TYPE, &id, &self.lease_holder).await?;
                continue;
            };
            match serde_json::from_str::<T>(&payload) {
                Ok(entity) if filter.matches(entity.meta()) => leased.push(entity),
                Ok(_) => {
                    debug!(entity_id = %id, "Entity changed before lease, releasing");
                    release_lease(&mut *tx, T::ENTITY_TYPE, &id, &self.lease_holder).await?;
                }
                Err(e) => {
                    warn!(
                        entity_type = T::ENTITY_TYPE,
                        entity_id = %id,
                        error = %e,
                        "Skipping entity with unreadable payload"
                    );
                    release_lease(&mut *tx, T::ENTITY_TYPE, &id, &self.lease_holder).await?;
                }
            }
        }
        tx.commit().await?;

        debug!(
            entity_type = T::ENTITY_TYPE,
            lease_holder = %self.lease_holder,
            leased = leased.len(),
            "Leased entities"
        );
        Ok(leased)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<T>> {
        self.load(id).await
    }

    async fn find_by_id_and_lease(&self, id: &str) -> Result<StoreResult<T>> {
        if get_payload(&self.pool, T::ENTITY_TYPE, id).await?.is_none() {
            return Ok(StoreResult::NotFound);
        }

        if !self.acquire(&self.pool, id, self.now_ms()).await? {
            return Ok(StoreResult::AlreadyLeased {
                leased_by: self.current_owner(id).await?,
            });
        }

        match self.load(id).await? {
            Some(entity) => Ok(StoreResult::Success(entity)),
            None => {
                release_lease(&self.pool, T::ENTITY_TYPE, id, &self.lease_holder).await?;
                Ok(StoreResult::NotFound)
            }
        }
    }

    async fn save(&self, entity: &T) -> Result<()> {
        let meta = entity.meta();
        let payload = serde_json::to_string(entity)?;
        let now_ms = self.now_ms();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO state_entities
                (entity_type, id, state, state_count, state_timestamp, pending,
                 error_detail, payload, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (entity_type, id) DO UPDATE SET
                state = EXCLUDED.state,
                state_count = EXCLUDED.state_count,
                state_timestamp = EXCLUDED.state_timestamp,
                pending = EXCLUDED.pending,
                error_detail = EXCLUDED.error_detail,
                payload = EXCLUDED.payload,
                updated_at = EXCLUDED.updated_at
            WHERE NOT EXISTS (
                SELECT 1 FROM entity_leases l
                WHERE l.entity_type = EXCLUDED.entity_type
                  AND l.entity_id = EXCLUDED.id
                  AND l.leased_by <> $11
                  AND l.leased_at + l.lease_duration_ms > $12
            )
            "#,
        )
        .bind(T::ENTITY_TYPE)
        .bind(&meta.id)
        .bind(meta.state)
        .bind(i32::try_from(meta.state_count).unwrap_or(i32::MAX))
        .bind(meta.state_timestamp.timestamp_millis())
        .bind(meta.pending)
        .bind(meta.error_detail.as_deref())
        .bind(&payload)
        .bind(meta.created_at.timestamp_millis())
        .bind(meta.updated_at.timestamp_millis())
        .bind(&self.lease_holder)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            let leased_by = self.current_owner(&meta.id).await?;
            warn!(
                entity_id = %meta.id,
                leased_by = %leased_by,
                "Save rejected, entity leased by another owner"
            );
            return Err(EngineError::AlreadyLeased {
                entity_id: meta.id.clone(),
                leased_by,
            });
        }

        sqlx::query(
            r#"
            DELETE FROM entity_leases
            WHERE entity_type = $1 AND entity_id = $2
              AND (leased_by = $3 OR leased_at + lease_duration_ms <= $4)
            "#,
        )
        .bind(T::ENTITY_TYPE)
        .bind(&meta.id)
        .bind(&self.lease_holder)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_by_id(&self, id: &str) -> Result<StoreResult<()>> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            DELETE FROM state_entities
            WHERE entity_type = $1 AND id = $2
              AND NOT EXISTS (
                  SELECT 1 FROM entity_leases l
                  WHERE l.entity_type = $1
                    AND l.entity_id = $2
                    AND l.leased_by <> $3
                    AND l.leased_at + l.lease_duration_ms > $4
              )
            "#,
        )
        .bind(T::ENTITY_TYPE)
        .bind(id)
        .bind(&self.lease_holder)
        .bind(self.now_ms())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            if get_payload(&self.pool, T::ENTITY_TYPE, id).await?.is_none() {
                return Ok(StoreResult::NotFound);
            }
            return Ok(StoreResult::AlreadyLeased {
                leased_by: self.current_owner(id).await?,
            });
        }

        sqlx::query("DELETE FROM entity_leases WHERE entity_type = $1 AND entity_id = $2")
            .bind(T::ENTITY_TYPE)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(StoreResult::Success(()))
    }

    async fn break_lease(&self, id: &str) -> Result<()> {
        release_lease(&self.pool, T::ENTITY_TYPE, id, &self.lease_holder).await
    }

    async fn lease_of(&self, id: &str) -> Result<Option<Lease>> {
        Ok(get_lease(&self.pool, T::ENTITY_TYPE, id)
            .await?
            .map(|r| Lease::from_millis(id, r.leased_by, r.leased_at, r.lease_duration_ms)))
    }
}
