// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stateful entity stores.
//!
//! This module defines the lease-aware store contract the engine relies on
//! and three backends implementing it.
//!
//! # Contract
//!
//! | Operation | Semantics |
//! |-----------|-----------|
//! | `next_not_leased` | Select up to `max` entities matching the filter that are not validly leased by someone else, and lease them to the caller in the same step |
//! | `save` | Persist the entity and release the caller's lease; fails with `AlreadyLeased` if another owner holds a valid lease |
//! | `find_by_id` | Plain read, ignores leases |
//! | `find_by_id_and_lease` | Lease a single entity for a direct access path; reports contention as `StoreResult::AlreadyLeased` |
//! | `delete_by_id` | Delete entity and lease unless another owner holds a valid lease |
//!
//! Whatever the backend, at most one owner holds a valid lease on an entity
//! at any time.

pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use self::memory::InMemoryEntityStore;
pub use self::postgres::PostgresEntityStore;
pub use self::sqlite::SqliteEntityStore;

use async_trait::async_trait;

use crate::entity::{EntityMeta, StatefulEntity};
use crate::error::Result;
use crate::lease::Lease;

/// Default lease validity window.
pub const DEFAULT_LEASE_DURATION: std::time::Duration = std::time::Duration::from_secs(60);

/// Predicate over the state code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatePredicate {
    /// Every state.
    Any,
    /// Exactly this state.
    Equals(i32),
    /// Any of these states.
    In(Vec<i32>),
}

impl StatePredicate {
    /// Evaluate against a state code.
    pub fn matches(&self, state: i32) -> bool {
        match self {
            Self::Any => true,
            Self::Equals(expected) => *expected == state,
            Self::In(states) => states.contains(&state),
        }
    }

    /// Render as a SQL condition on `column`.
    ///
    /// Only integers from the predicate itself are interpolated.
    pub(crate) fn sql_condition(&self, column: &str) -> String {
        match self {
            Self::Any => "1 = 1".to_string(),
            Self::Equals(state) => format!("{} = {}", column, state),
            Self::In(states) if states.is_empty() => "1 = 0".to_string(),
            Self::In(states) => {
                let list: Vec<String> = states.iter().map(|s| s.to_string()).collect();
                format!("{} IN ({})", column, list.join(", "))
            }
        }
    }
}

/// Filter passed to [`StatefulEntityStore::next_not_leased`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateFilter {
    /// Which states qualify.
    pub states: StatePredicate,
    /// Required value of the pending flag, if any.
    pub pending: Option<bool>,
}

impl StateFilter {
    /// Match every entity.
    pub fn any() -> Self {
        Self {
            states: StatePredicate::Any,
            pending: None,
        }
    }

    /// Match entities in `state`.
    pub fn state(state: i32) -> Self {
        Self {
            states: StatePredicate::Equals(state),
            pending: None,
        }
    }

    /// Match entities in any of `states`.
    pub fn states(states: impl IntoIterator<Item = i32>) -> Self {
        Self {
            states: StatePredicate::In(states.into_iter().collect()),
            pending: None,
        }
    }

    /// Only entities that are not pending.
    pub fn not_pending(mut self) -> Self {
        self.pending = Some(false);
        self
    }

    /// Only entities whose pending flag equals `pending`.
    pub fn pending(mut self, pending: bool) -> Self {
        self.pending = Some(pending);
        self
    }

    /// Evaluate against entity bookkeeping.
    pub fn matches(&self, meta: &EntityMeta) -> bool {
        self.states.matches(meta.state) && self.pending.is_none_or(|p| p == meta.pending)
    }
}

/// Outcome of store operations where contention is an expected result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreResult<T> {
    /// The operation went through.
    Success(T),
    /// No entity with that id.
    NotFound,
    /// Another owner holds a valid lease.
    AlreadyLeased {
        /// Current lease owner.
        leased_by: String,
    },
}

impl<T> StoreResult<T> {
    /// Whether the operation went through.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// The value, if the operation went through.
    pub fn success(self) -> Option<T> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }

    /// Map the success value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StoreResult<U> {
        match self {
            Self::Success(value) => StoreResult::Success(f(value)),
            Self::NotFound => StoreResult::NotFound,
            Self::AlreadyLeased { leased_by } => StoreResult::AlreadyLeased { leased_by },
        }
    }
}

/// Lease-aware persistence for one entity type.
///
/// Each store handle acts on behalf of one lease owner (`lease_holder`).
#[async_trait]
pub trait StatefulEntityStore<T: StatefulEntity>: Send + Sync {
    /// The owner this handle leases entities for.
    fn lease_holder(&self) -> &str;

    /// Select and lease up to `max` entities matching `filter`.
    ///
    /// Entities are returned oldest `state_timestamp` first. On error no
    /// lease taken by the call survives.
    async fn next_not_leased(&self, max: usize, filter: &StateFilter) -> Result<Vec<T>>;

    /// Read an entity without touching its lease.
    async fn find_by_id(&self, id: &str) -> Result<Option<T>>;

    /// Lease a single entity for direct access.
    async fn find_by_id_and_lease(&self, id: &str) -> Result<StoreResult<T>>;

    /// Persist the entity and release this owner's lease on it.
    async fn save(&self, entity: &T) -> Result<()>;

    /// Delete the entity unless another owner holds a valid lease.
    async fn delete_by_id(&self, id: &str) -> Result<StoreResult<()>>;

    /// Release this owner's lease without saving.
    async fn break_lease(&self, id: &str) -> Result<()>;

    /// Current lease row, if any. Expired rows may already be purged.
    async fn lease_of(&self, id: &str) -> Result<Option<Lease>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicate_matches() {
        assert!(StatePredicate::Any.matches(42));
        assert!(StatePredicate::Equals(100).matches(100));
        assert!(!StatePredicate::Equals(100).matches(200));
        assert!(StatePredicate::In(vec![100, 200]).matches(200));
        assert!(!StatePredicate::In(vec![]).matches(200));
    }

    #[test]
    fn test_state_predicate_sql() {
        assert_eq!(StatePredicate::Any.sql_condition("e.state"), "1 = 1");
        assert_eq!(
            StatePredicate::Equals(-5).sql_condition("e.state"),
            "e.state = -5"
        );
        assert_eq!(
            StatePredicate::In(vec![100, 200]).sql_condition("e.state"),
            "e.state IN (100, 200)"
        );
        assert_eq!(StatePredicate::In(vec![]).sql_condition("state"), "1 = 0");
    }

    #[test]
    fn test_state_filter_pending() {
        let mut meta = EntityMeta::new("e-1", 100);
        let filter = StateFilter::state(100).not_pending();
        assert!(filter.matches(&meta));

        meta.pending = true;
        assert!(!filter.matches(&meta));
        assert!(StateFilter::state(100).matches(&meta));
        assert!(StateFilter::any().pending(true).matches(&meta));
    }

    #[test]
    fn test_store_result_helpers() {
        let ok: StoreResult<u32> = StoreResult::Success(2);
        assert!(ok.is_success());
        assert_eq!(ok.clone().map(|v| v * 2), StoreResult::Success(4));
        assert_eq!(ok.success(), Some(2));

        let leased: StoreResult<u32> = StoreResult::AlreadyLeased {
            leased_by: "b".to_string(),
        };
        assert!(!leased.is_success());
        assert_eq!(
            leased.map(|v| v.to_string()),
            StoreResult::AlreadyLeased {
                leased_by: "b".to_string()
            }
        );
        assert_eq!(StoreResult::<u32>::NotFound.success(), None);
    }
}
