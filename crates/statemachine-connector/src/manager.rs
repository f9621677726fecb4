// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drives leased entities through a transition table.
//!
//! A [`TransitionTable`] says what each state does: move on locally, or send
//! a protocol message and move on once it was delivered. The
//! [`StateMachineManager`] applies that to one leased entity at a time and
//! turns the table into a [`ProcessLoop`](statemachine_core::ProcessLoop)
//! with one processor per state.

use std::sync::Arc;
use std::time::Duration;

use statemachine_core::{
    Clock, EngineError, EntitiesProcessor, EntityRetryPolicy, FixedWaitStrategy, ProcessLoopBuilder,
    Result, StateFilter, StatefulEntity, StatefulEntityStore,
};
use tracing::{debug, warn};

use crate::config::ProcessLoopConfig;
use crate::dispatcher::{DispatchError, ProtocolMessage, RemoteMessageDispatcher};

/// What a state does with an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Move to the given state without talking to anyone.
    Advance(i32),
    /// Deliver `message`, then move to `next`.
    Send {
        /// Message for the counter-party.
        message: ProtocolMessage,
        /// State once delivered.
        next: i32,
    },
}

/// Business transition rules for one entity kind.
pub trait TransitionTable<E: StatefulEntity>: Send + Sync + 'static {
    /// Name of the process loop running this table.
    fn name(&self) -> &'static str;

    /// States with outbound work. One processor is created per state.
    fn processable_states(&self) -> &'static [i32];

    /// What to do with `entity`. `None` means it waits for an inbound message.
    fn action(&self, entity: &E) -> Option<Action>;

    /// Where `entity` goes once its retries in the current state are used up.
    fn failure_state(&self, entity: &E) -> i32;
}

/// Applies a [`TransitionTable`] to leased entities.
pub struct StateMachineManager<E: StatefulEntity> {
    table: Arc<dyn TransitionTable<E>>,
    store: Arc<dyn StatefulEntityStore<E>>,
    dispatcher: Arc<dyn RemoteMessageDispatcher>,
    retry: EntityRetryPolicy,
}

impl<E: StatefulEntity> StateMachineManager<E> {
    /// Create a manager.
    pub fn new(
        table: Arc<dyn TransitionTable<E>>,
        store: Arc<dyn StatefulEntityStore<E>>,
        dispatcher: Arc<dyn RemoteMessageDispatcher>,
        retry: EntityRetryPolicy,
    ) -> Self {
        Self {
            table,
            store,
            dispatcher,
            retry,
        }
    }

    /// The store entities are leased from.
    pub fn store(&self) -> &Arc<dyn StatefulEntityStore<E>> {
        &self.store
    }

    /// Run one transition attempt on a leased entity.
    ///
    /// Returns `true` when the entity moved to another state. The lease is
    /// released on every path; a lease lost to another instance is not an
    /// error.
    pub async fn advance(&self, mut entity: E) -> Result<bool> {
        let action = match self.table.action(&entity) {
            Some(action) if self.retry.is_due(&entity) => action,
            _ => {
                self.store.break_lease(entity.id()).await?;
                return Ok(false);
            }
        };

        match action {
            Action::Advance(next) => {
                entity.transition_to_at(next, self.retry.clock().now());
                self.persist(&entity).await
            }
            Action::Send { message, next } => match self.dispatcher.dispatch(message).await {
                Ok(()) => {
                    entity.transition_to_at(next, self.retry.clock().now());
                    entity.clear_error_detail();
                    self.persist(&entity).await
                }
                Err(err) => self.record_failure(entity, err).await,
            },
        }
    }

    async fn record_failure(&self, mut entity: E, err: DispatchError) -> Result<bool> {
        let now = self.retry.clock().now();
        let state = entity.state();
        entity.transition_to_at(state, now);

        if self.retry.retries_exhausted(&entity) {
            let failure = self.table.failure_state(&entity);
            warn!(
                machine = self.table.name(),
                entity_id = %entity.id(),
                state,
                failure_state = failure,
                attempts = entity.state_count(),
                error = %err,
                "Retries exhausted"
            );
            entity.transition_to_at(failure, now);
            entity.set_error_detail(format!("retries exhausted in state {state}: {err}"));
            return self.persist(&entity).await;
        }

        debug!(
            machine = self.table.name(),
            entity_id = %entity.id(),
            state,
            attempts = entity.state_count(),
            error = %err,
            "Dispatch failed, will retry"
        );
        entity.set_error_detail(err.to_string());
        self.persist(&entity).await?;
        Ok(false)
    }

    async fn persist(&self, entity: &E) -> Result<bool> {
        match self.store.save(entity).await {
            Ok(()) => Ok(true),
            Err(EngineError::AlreadyLeased {
                entity_id,
                leased_by,
            }) => {
                warn!(
                    machine = self.table.name(),
                    entity_id = %entity_id,
                    leased_by = %leased_by,
                    "Lease lost before save, dropping transition"
                );
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

impl<E: StatefulEntity> StateMachineManager<E> {
    /// Builder for a loop with one processor per processable state.
    ///
    /// Pending entities are skipped. The manager never sets the flag itself;
    /// a delivery happens while the entity is leased. Callers that start
    /// work outside the lease mark the entity pending and clear it once the
    /// outcome is known, and the loop leaves it alone until then.
    pub fn process_loop(
        self: &Arc<Self>,
        config: &ProcessLoopConfig,
        shutdown_timeout: Duration,
    ) -> ProcessLoopBuilder {
        let name = self.table.name();
        let mut builder = ProcessLoopBuilder::new()
            .name(name)
            .wait_strategy(FixedWaitStrategy::new(duration_ms(config.iteration_wait)))
            .shutdown_timeout(shutdown_timeout);

        for &state in self.table.processable_states() {
            let manager = Arc::clone(self);
            let processor = EntitiesProcessor::leased(
                self.store.clone(),
                StateFilter::state(state).not_pending(),
                config.batch_size,
                move |entity: E| {
                    let manager = manager.clone();
                    async move { manager.advance(entity).await }
                },
            )
            .named(format!("{name}-{state}"));
            builder = builder.processor(processor);
        }
        builder
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
