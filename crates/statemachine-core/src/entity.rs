// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entity bookkeeping shared by every state machine.
//!
//! The engine never interprets `state`; business collaborators own the
//! transition tables and the meaning of each code.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Opaque propagation metadata threaded through for observability.
pub type TraceContext = HashMap<String, String>;

/// Fields every stateful entity carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMeta {
    /// Unique identifier, immutable after creation.
    pub id: String,
    /// Current state code.
    pub state: i32,
    /// Consecutive attempts in the current state.
    pub state_count: u32,
    /// When `state` last changed.
    pub state_timestamp: DateTime<Utc>,
    /// Mid-transition with an externally observable, unconfirmed effect.
    pub pending: bool,
    /// Last failure message.
    pub error_detail: Option<String>,
    /// Propagation metadata.
    #[serde(default)]
    pub trace_context: TraceContext,
    /// When the entity was created.
    pub created_at: DateTime<Utc>,
    /// When the entity was last touched by a transition attempt.
    pub updated_at: DateTime<Utc>,
}

impl EntityMeta {
    /// Create bookkeeping for a new entity in `state`.
    pub fn new(id: impl Into<String>, state: i32) -> Self {
        Self::new_at(id, state, Utc::now())
    }

    /// Create bookkeeping with an explicit creation time.
    pub fn new_at(id: impl Into<String>, state: i32, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            state,
            state_count: 0,
            state_timestamp: now,
            pending: false,
            error_detail: None,
            trace_context: TraceContext::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// An entity a process loop can drive.
///
/// Implementors only expose their [`EntityMeta`]; the provided methods keep
/// `state_count`, `state_timestamp` and `error_detail` consistent.
pub trait StatefulEntity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Discriminator for stores that keep several entity kinds in one table.
    const ENTITY_TYPE: &'static str;

    /// Shared bookkeeping.
    fn meta(&self) -> &EntityMeta;

    /// Shared bookkeeping, mutable.
    fn meta_mut(&mut self) -> &mut EntityMeta;

    /// Entity id.
    fn id(&self) -> &str {
        &self.meta().id
    }

    /// Current state code.
    fn state(&self) -> i32 {
        self.meta().state
    }

    /// Attempts in the current state.
    fn state_count(&self) -> u32 {
        self.meta().state_count
    }

    /// Whether an externally visible effect is awaiting confirmation.
    fn is_pending(&self) -> bool {
        self.meta().pending
    }

    /// Record a transition attempt towards `state`.
    fn transition_to(&mut self, state: i32) {
        self.transition_to_at(state, Utc::now());
    }

    /// Record a transition attempt towards `state` at `now`.
    ///
    /// Staying in the same state counts as another attempt; moving to a new
    /// state resets the counter, stamps `state_timestamp` and clears the last
    /// error.
    fn transition_to_at(&mut self, state: i32, now: DateTime<Utc>) {
        let meta = self.meta_mut();
        if meta.state == state {
            meta.state_count = meta.state_count.saturating_add(1);
        } else {
            meta.state = state;
            meta.state_count = 0;
            meta.state_timestamp = now;
            meta.error_detail = None;
        }
        meta.updated_at = now;
    }

    /// Mark or clear the pending flag.
    fn set_pending(&mut self, pending: bool) {
        self.meta_mut().pending = pending;
    }

    /// Record the last failure.
    fn set_error_detail(&mut self, detail: impl Into<String>) {
        self.meta_mut().error_detail = Some(detail.into());
    }

    /// Forget the last failure.
    fn clear_error_detail(&mut self) {
        self.meta_mut().error_detail = None;
    }
}
