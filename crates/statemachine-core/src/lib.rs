// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Statemachine Core - Leased Entity Execution Engine
//!
//! This crate drives long-lived stateful entities (transfer processes,
//! contract negotiations, ...) through their states without blocking request
//! threads, and without two connector instances working on the same entity at
//! the same time.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Supervisor (statemachine-connector)                  │
//! │            builds one ProcessLoop per entity type, owns lifecycle        │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                │ start / stop / is_active
//!                ▼
//! ┌───────────────────────────┐   per cycle   ┌───────────────────────────┐
//! │        ProcessLoop        │──────────────▶│     EntityProcessor(s)    │
//! │  one worker task, cycles  │◀──────────────│  batch -> transition fn   │
//! │  WaitStrategy between     │  processed n  └─────────────┬─────────────┘
//! └───────────────────────────┘                             │ next_not_leased
//!                                                           ▼ save / lease
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    StatefulEntityStore (memory / SQLite / PostgreSQL)    │
//! │           entity rows + lease rows (owner, leased_at, duration)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Process Loop State Machine
//!
//! ```text
//!   ┌─────────┐ start  ┌──────────┐ worker up ┌─────────┐ stop  ┌──────────┐
//!   │ STOPPED │───────▶│ STARTING │──────────▶│ RUNNING │──────▶│ STOPPING │
//!   └─────────┘        └──────────┘           └────┬────┘       └────┬─────┘
//!        ▲                                         │ fatal error     │ worker exits
//!        └─────────────────────────────────────────┴─────────────────┘
//! ```
//!
//! # Cycle Outcomes
//!
//! | Outcome | Wait strategy call | Sleep before next cycle |
//! |---------|--------------------|-------------------------|
//! | processed > 0 | `success()` | none |
//! | processed == 0 | `wait_for_millis()` | returned delay |
//! | recoverable error | `retry_in_millis()` | returned delay |
//! | fatal error / panic | - | worker exits, loop becomes inactive |
//!
//! # Modules
//!
//! - [`entity`]: Entity bookkeeping shared by all state machines
//! - [`lease`]: Time-bounded ownership records and clocks
//! - [`error`]: Engine errors and the recoverable / fatal split
//! - [`store`]: Store contract and the in-memory, SQLite and PostgreSQL stores
//! - [`wait`]: Inter-cycle wait strategies
//! - [`retry`]: Per-entity retry policy driven by `state_count`
//! - [`processor`]: Batch processors applying transition functions
//! - [`process_loop`]: The single-worker control loop
//! - [`instrumentation`]: Cycle observers and counters

#![deny(missing_docs)]

/// Entity bookkeeping shared by all state machines.
pub mod entity;

/// Error types and severity classification.
pub mod error;

/// Cycle observers and loop statistics.
pub mod instrumentation;

/// Time-bounded leases and clocks.
pub mod lease;

/// The single-worker process loop.
pub mod process_loop;

/// Batch processors.
pub mod processor;

/// Per-entity retry policy.
pub mod retry;

/// Stateful entity stores.
pub mod store;

/// Wait strategies applied between cycles.
pub mod wait;

pub use entity::{EntityMeta, StatefulEntity, TraceContext};
pub use error::{EngineError, ErrorSeverity, Result};
pub use instrumentation::{LoopInstrumentation, LoopStatsSnapshot, NoopInstrumentation};
pub use lease::{Clock, Lease, ManualClock, SystemClock};
pub use process_loop::{LoopState, ProcessLoop, ProcessLoopBuilder};
pub use processor::{EntitiesProcessor, EntityProcessor};
pub use retry::{EntityRetryConfig, EntityRetryPolicy};
pub use store::{
    InMemoryEntityStore, PostgresEntityStore, SqliteEntityStore, StateFilter, StatePredicate,
    StatefulEntityStore, StoreResult,
};
pub use wait::{ExponentialWaitStrategy, FixedWaitStrategy, WaitStrategy};
