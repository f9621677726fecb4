// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Statemachine Connector - Dataspace Connector Supervisor
//!
//! This crate wires the `statemachine-core` engine into a connector:
//! transfer processes and contract negotiations, each driven by its own
//! process loop over a shared lease-coordinated store.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ConnectorRuntime                               │
//! │   start in order ─▶  negotiation loop, transfer loop, extra loops        │
//! │   shutdown in reverse order, health() per loop                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//!          │ one processor per state                 ▲ inbound messages
//!          ▼                                         │
//! ┌───────────────────────────┐          ┌───────────────────────────┐
//! │    StateMachineManager    │          │  TransferProcessService   │
//! │  TransitionTable + retry  │          │ ContractNegotiationService│
//! └─────────────┬─────────────┘          └─────────────┬─────────────┘
//!               │ Send                                  │ find_by_id_and_lease
//!               ▼                                       ▼
//! ┌───────────────────────────┐          ┌───────────────────────────┐
//! │  RemoteMessageDispatcher  │          │    StatefulEntityStore    │
//! └───────────────────────────┘          │ memory / SQLite / Postgres│
//!                                        └───────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`]: Environment configuration
//! - [`dispatcher`]: Outbound protocol messages
//! - [`manager`]: Transition tables applied to leased entities
//! - [`transfer`]: Transfer process states, table and service
//! - [`negotiation`]: Contract negotiation states, table and service
//! - [`runtime`]: Supervisor and composition root

#![deny(missing_docs)]

/// Configuration loading from environment variables.
pub mod config;

/// Outbound protocol messages and the dispatcher seam.
pub mod dispatcher;

/// Error types.
pub mod error;

/// Transition tables and the manager applying them.
pub mod manager;

/// Contract negotiations.
pub mod negotiation;

/// Connector runtime.
pub mod runtime;

/// Transfer processes.
pub mod transfer;

/// Types shared by the state machines.
pub mod types;

pub use config::{Config, ConfigError, ProcessLoopConfig, StoreBackend};
pub use dispatcher::{
    DispatchError, LoggingDispatcher, MessageType, ProtocolMessage, RemoteMessageDispatcher,
};
pub use error::{Error, Result};
pub use manager::{Action, StateMachineManager, TransitionTable};
pub use negotiation::{
    ContractNegotiation, ContractNegotiationService, ContractNegotiationState,
    ContractNegotiationTable,
};
pub use runtime::{ConnectorRuntime, ConnectorRuntimeBuilder, HealthReport, LoopHealth};
pub use transfer::{
    TransferProcess, TransferProcessService, TransferProcessState, TransferProcessTable,
};
pub use types::{Role, ServiceResult};
