// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Types shared by the transfer and negotiation state machines.

use serde::{Deserialize, Serialize};
use statemachine_core::{EngineError, Result, StatefulEntity, StatefulEntityStore, StoreResult};
use tracing::debug;

/// Which side of the exchange this connector plays for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Requests data or contracts.
    Consumer,
    /// Offers data or contracts.
    Provider,
}

/// Outcome of an inbound service call.
///
/// Lease contention is reported as [`ServiceResult::Conflict`] so protocol
/// handlers can reject the inbound message and let the counter-party retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceResult<T> {
    /// The call went through.
    Success(T),
    /// No such entity.
    NotFound,
    /// Another connector instance holds the entity, or a guard refused the call.
    Conflict(String),
    /// The entity is in a state that does not accept the call.
    BadRequest(String),
}

impl<T> ServiceResult<T> {
    /// Whether the call went through.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// The value, if the call went through.
    pub fn success(self) -> Option<T> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }
}

/// Lease `id`, apply `update`, save.
///
/// An `Err` from `update` releases the lease untouched and becomes
/// [`ServiceResult::BadRequest`].
pub(crate) async fn lease_and_update<E, F>(
    store: &dyn StatefulEntityStore<E>,
    id: &str,
    update: F,
) -> Result<ServiceResult<E>>
where
    E: StatefulEntity,
    F: FnOnce(&mut E) -> Result<()> + Send,
{
    match store.find_by_id_and_lease(id).await? {
        StoreResult::NotFound => Ok(ServiceResult::NotFound),
        StoreResult::AlreadyLeased { leased_by } => {
            debug!(entity_id = %id, leased_by = %leased_by, "Inbound call hit a leased entity");
            Ok(ServiceResult::Conflict(
                EngineError::AlreadyLeased {
                    entity_id: id.to_string(),
                    leased_by,
                }
                .to_string(),
            ))
        }
        StoreResult::Success(mut entity) => match update(&mut entity) {
            Ok(()) => {
                store.save(&entity).await?;
                Ok(ServiceResult::Success(entity))
            }
            Err(err) => {
                store.break_lease(id).await?;
                Ok(ServiceResult::BadRequest(err.to_string()))
            }
        },
    }
}

/// Error for a call that is not allowed in the entity's current state.
pub(crate) fn invalid_state<E: StatefulEntity>(entity: &E, message: &str) -> EngineError {
    EngineError::InvalidState {
        entity_id: entity.id().to_string(),
        state: entity.state(),
        message: message.to_string(),
    }
}
