// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed store.
//!
//! Leases live in their own table and are taken with a conditional upsert:
//! the row is inserted, or updated only when the current owner is the caller
//! or the current lease has expired. One affected row means the lease was
//! won. Saves and deletes are guarded by the same condition, so a valid
//! foreign lease is never overwritten.
//!
//! Batch leasing, saves and deletes each run in one transaction: the lease
//! rows change together with the entity rows or not at all.

use std::fmt;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{SqliteExecutor, SqlitePool};
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{debug, warn};

use super::{DEFAULT_LEASE_DURATION, StateFilter, StatefulEntityStore, StoreResult};
use crate::entity::StatefulEntity;
use crate::error::{EngineError, Result};
use crate::lease::{Clock, Lease, SystemClock, duration_millis};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

#[derive(Debug, sqlx::FromRow)]
struct LeaseRow {
    leased_by: String,
    leased_at: i64,
    lease_duration_ms: i64,
}

/// SQLite-backed store for one entity type.
pub struct SqliteEntityStore<T: StatefulEntity> {
    pool: SqlitePool,
    lease_holder: String,
    lease_duration: Duration,
    clock: Arc<dyn Clock>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: StatefulEntity> Clone for SqliteEntityStore<T> {
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

impl<T: StatefulEntity> fmt::Debug for SqliteEntityStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteEntityStore")
            .field("entity_type", &T::ENTITY_TYPE)
            .field("lease_holder", &self.lease_holder)
            .field("lease_duration", &self.lease_duration)
            .finish()
    }
}

impl<T: StatefulEntity> SqliteEntityStore<T> {
    /// Create a store on an existing, already migrated pool.
    pub fn new(pool: SqlitePool, lease_holder: impl Into<String>) -> Self {
        Self {
            pool,
            lease_holder: lease_holder.into(),
            lease_duration: DEFAULT_LEASE_DURATION,
            clock: Arc::new(SystemClock),
            _entity: PhantomData,
        }
    }

    /// Open (creating if needed) a database file and run migrations.
    ///
    /// ```ignore
    /// let store = SqliteEntityStore::<TransferProcess>::from_path(".data/connector.db", "connector-1").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>, lease_holder: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::store(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = connect_pool(&url).await?;
        Ok(Self::new(pool, lease_holder))
    }

    /// Connect using a `sqlite:` URL and run migrations.
    pub async fn connect(url: &str, lease_holder: impl Into<String>) -> Result<Self> {
        let pool = connect_pool(url).await?;
        Ok(Self::new(pool, lease_holder))
    }

    /// Run the store's migrations on `pool`.
    pub async fn migrate(pool: &SqlitePool) -> Result<()> {
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
    pub fn for_entity<U: StatefulEntity>(&self) -> SqliteEntityStore<U> {
        SqliteEntityStore {
            pool: self.pool.clone(),
            lease_holder: self.lease_holder.clone(),
            lease_duration: self.lease_duration,
            clock: self.clock.clone(),
            _entity: PhantomData,
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    /// Take or renew the lease on `id`. Returns whether the caller now owns it.
    async fn try_acquire<'e>(
        &self,
        executor: impl SqliteExecutor<'e>,
        id: &str,
        now_ms: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO entity_leases (entity_type, entity_id, leased_by, leased_at, lease_duration_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (entity_type, entity_id) DO UPDATE SET
                leased_by = excluded.leased_by,
                leased_at = excluded.leased_at,
                lease_duration_ms = excluded.lease_duration_ms
            WHERE entity_leases.leased_by = excluded.leased_by
               OR entity_leases.leased_at + entity_leases.lease_duration_ms <= excluded.leased_at
            "#,
        )
        .bind(T::ENTITY_TYPE)
        .bind(id)
        .bind(&self.lease_holder)
        .bind(now_ms)
        .bind(duration_millis(self.lease_duration))
        .execute(executor)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release<'e>(&self, executor: impl SqliteExecutor<'e>, id: &str) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM entity_leases
            WHERE entity_type = ?1 AND entity_id = ?2 AND leased_by = ?3
            "#,
        )
        .bind(T::ENTITY_TYPE)
        .bind(id)
        .bind(&self.lease_holder)
        .execute(executor)
        .await?;
        Ok(())
    }

    async fn payload<'e>(&self, executor: impl SqliteExecutor<'e>, id: &str) -> Result<Option<String>> {
        let payload = sqlx::query_scalar(
            r#"
            SELECT payload FROM state_entities
            WHERE entity_type = ?1 AND id = ?2
            "#,
        )
        .bind(T::ENTITY_TYPE)
        .bind(id)
        .fetch_optional(executor)
        .await?;
        Ok(payload)
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM state_entities WHERE entity_type = ?1 AND id = ?2",
        )
        .bind(T::ENTITY_TYPE)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(exists.is_some())
    }

    async fn load(&self, id: &str) -> Result<Option<T>> {
        self.payload(&self.pool, id)
            .await?
            .map(|p| serde_json::from_str(&p).map_err(EngineError::from))
            .transpose()
    }

    async fn current_owner(&self, id: &str) -> Result<String> {
        Ok(StatefulEntityStore::<T>::lease_of(self, id)
            .await?
            .map(|lease| lease.leased_by)
            .unwrap_or_default())
    }
}

async fn connect_pool(url: &str) -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(url)
        .await
        .map_err(|e| EngineError::store("connect", format!("Failed to connect to {}: {}", url, e)))?;

    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

#[async_trait]
impl<T: StatefulEntity> StatefulEntityStore<T> for SqliteEntityStore<T> {
    fn lease_holder(&self) -> &str {
        &self.lease_holder
    }

    async fn next_not_leased(&self, max: usize, filter: &StateFilter) -> Result<Vec<T>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let now_ms = self.now_ms();
        let mut tx = self.pool.begin().await?;

        // Writing first takes the database write lock for the whole batch.
        sqlx::query(
            r#"
            DELETE FROM entity_leases
            WHERE entity_type = ?1 AND leased_at + lease_duration_ms <= ?2
            "#,
        )
        .bind(T::ENTITY_TYPE)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;

        let sql = format!(
            r#"
            SELECT e.id FROM state_entities e
            LEFT JOIN entity_leases l
                ON l.entity_type = e.entity_type AND l.entity_id = e.id
            WHERE e.entity_type = ?1
              AND (l.entity_id IS NULL
                   OR l.leased_by = ?2
                   OR l.leased_at + l.lease_duration_ms <= ?3)
              AND {}
              AND (?4 IS NULL OR e.pending = ?4)
            ORDER BY e.state_timestamp ASC, e.id ASC
            LIMIT ?5
            "#,
            filter.states.sql_condition("e.state")
        );
        let candidates: Vec<String> = sqlx::query_scalar(&sql)
            .bind(T::ENTITY_TYPE)
            .bind(&self.lease_holder)
            .bind(now_ms)
            .bind(filter.pending)
            .bind(i64::try_from(max).unwrap_or(i64::MAX))
            .fetch_all(&mut *tx)
            .await?;

        let mut leased = Vec::with_capacity(candidates.len());
        for id in candidates {
            if !self.try_acquire(&mut *tx, &id, now_ms).await? {
                debug!(entity_id = %id, "Lost lease race");
                continue;
            }
            let Some(payload) = self.payload(&mut *tx, &id).await? else {
                self.release(&mut *tx, &id).await?;
                continue;
            };
            match serde_json::from_str::<T>(&payload) {
                Ok(entity) if filter.matches(entity.meta()) => leased.push(entity),
                Ok(_) => {
                    debug!(entity_id = %id, "Entity changed before lease, releasing");
                    self.release(&mut *tx, &id).await?;
                }
                Err(e) => {
                    warn!(
                        entity_type = T::ENTITY_TYPE,
                        entity_id = %id,
                        error = %e,
                        "Skipping entity with unreadable payload"
                    );
                    self.release(&mut *tx, &id).await?;
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
        if !self.exists(id).await? {
            return Ok(StoreResult::NotFound);
        }

        if !self.try_acquire(&self.pool, id, self.now_ms()).await? {
            return Ok(StoreResult::AlreadyLeased {
                leased_by: self.current_owner(id).await?,
            });
        }

        match self.load(id).await? {
            Some(entity) => Ok(StoreResult::Success(entity)),
            None => {
                self.release(&self.pool, id).await?;
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
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT (entity_type, id) DO UPDATE SET
                state = excluded.state,
                state_count = excluded.state_count,
                state_timestamp = excluded.state_timestamp,
                pending = excluded.pending,
                error_detail = excluded.error_detail,
                payload = excluded.payload,
                updated_at = excluded.updated_at
            WHERE NOT EXISTS (
                SELECT 1 FROM entity_leases l
                WHERE l.entity_type = excluded.entity_type
                  AND l.entity_id = excluded.id
                  AND l.leased_by <> ?11
                  AND l.leased_at + l.lease_duration_ms > ?12
            )
            "#,
        )
        .bind(T::ENTITY_TYPE)
        .bind(&meta.id)
        .bind(meta.state)
        .bind(i64::from(meta.state_count))
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
            WHERE entity_type = ?1 AND entity_id = ?2
              AND (leased_by = ?3 OR leased_at + lease_duration_ms <= ?4)
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
        let now_ms = self.now_ms();
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            DELETE FROM state_entities
            WHERE entity_type = ?1 AND id = ?2
              AND NOT EXISTS (
                  SELECT 1 FROM entity_leases l
                  WHERE l.entity_type = ?1
                    AND l.entity_id = ?2
                    AND l.leased_by <> ?3
                    AND l.leased_at + l.lease_duration_ms > ?4
              )
            "#,
        )
        .bind(T::ENTITY_TYPE)
        .bind(id)
        .bind(&self.lease_holder)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            if !self.exists(id).await? {
                return Ok(StoreResult::NotFound);
            }
            return Ok(StoreResult::AlreadyLeased {
                leased_by: self.current_owner(id).await?,
            });
        }

        sqlx::query("DELETE FROM entity_leases WHERE entity_type = ?1 AND entity_id = ?2")
            .bind(T::ENTITY_TYPE)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(StoreResult::Success(()))
    }

    async fn break_lease(&self, id: &str) -> Result<()> {
        self.release(&self.pool, id).await
    }

    async fn lease_of(&self, id: &str) -> Result<Option<Lease>> {
        let row = sqlx::query_as::<_, LeaseRow>(
            r#"
            SELECT leased_by, leased_at, lease_duration_ms
            FROM entity_leases
            WHERE entity_type = ?1 AND entity_id = ?2
            "#,
        )
        .bind(T::ENTITY_TYPE)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Lease::from_millis(id, r.leased_by, r.leased_at, r.lease_duration_ms)))
    }
}
