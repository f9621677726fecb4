// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable connector runtime.
//!
//! [`ConnectorRuntime`] builds one process loop per entity type, starts them
//! in registration order and stops them in reverse order.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use statemachine_connector::{Config, ConnectorRuntime, LoggingDispatcher};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let runtime = ConnectorRuntime::from_config(&config, Arc::new(LoggingDispatcher))
//!         .await?
//!         .build()?
//!         .start()
//!         .await;
//!
//!     let negotiation = runtime
//!         .negotiation_service()
//!         .initiate("https://provider.example", "offer-1")
//!         .await?;
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use statemachine_core::process_loop::DEFAULT_SHUTDOWN_TIMEOUT;
use statemachine_core::{
    Clock, EntityRetryConfig, EntityRetryPolicy, InMemoryEntityStore, LoopInstrumentation,
    LoopState, LoopStatsSnapshot, PostgresEntityStore, ProcessLoop, SqliteEntityStore,
    StatefulEntityStore,
};
use tracing::{info, warn};

use crate::config::{Config, ProcessLoopConfig, StoreBackend};
use crate::dispatcher::RemoteMessageDispatcher;
use crate::error::{Error, Result};
use crate::manager::StateMachineManager;
use crate::negotiation::{ContractNegotiation, ContractNegotiationService, ContractNegotiationTable};
use crate::transfer::{TransferProcess, TransferProcessService, TransferProcessTable};

/// Builder for a [`ConnectorRuntime`].
pub struct ConnectorRuntimeBuilder {
    connector_id: String,
    transfer_store: Option<Arc<dyn StatefulEntityStore<TransferProcess>>>,
    negotiation_store: Option<Arc<dyn StatefulEntityStore<ContractNegotiation>>>,
    dispatcher: Option<Arc<dyn RemoteMessageDispatcher>>,
    transfer: ProcessLoopConfig,
    negotiation: ProcessLoopConfig,
    send_retry: EntityRetryConfig,
    clock: Option<Arc<dyn Clock>>,
    shutdown_timeout: Duration,
    instrumentation: Option<Arc<dyn LoopInstrumentation>>,
    extra_loops: Vec<ProcessLoop>,
}

impl Default for ConnectorRuntimeBuilder {
    fn default() -> Self {
        Self {
            connector_id: uuid::Uuid::new_v4().to_string(),
            transfer_store: None,
            negotiation_store: None,
            dispatcher: None,
            transfer: ProcessLoopConfig::default(),
            negotiation: ProcessLoopConfig::default(),
            send_retry: EntityRetryConfig::default(),
            clock: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            instrumentation: None,
            extra_loops: Vec::new(),
        }
    }
}

impl ConnectorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity reported in health output. Should match the stores' lease owner.
    pub fn connector_id(mut self, id: impl Into<String>) -> Self {
        self.connector_id = id.into();
        self
    }

    /// Store for transfer processes (required).
    pub fn transfer_store(mut self, store: Arc<dyn StatefulEntityStore<TransferProcess>>) -> Self {
        self.transfer_store = Some(store);
        self
    }

    /// Store for contract negotiations (required).
    pub fn negotiation_store(
        mut self,
        store: Arc<dyn StatefulEntityStore<ContractNegotiation>>,
    ) -> Self {
        self.negotiation_store = Some(store);
        self
    }

    /// Outbound message dispatcher (required).
    pub fn dispatcher(mut self, dispatcher: Arc<dyn RemoteMessageDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Transfer loop settings.
    pub fn transfer_loop(mut self, config: ProcessLoopConfig) -> Self {
        self.transfer = config;
        self
    }

    /// Negotiation loop settings.
    pub fn negotiation_loop(mut self, config: ProcessLoopConfig) -> Self {
        self.negotiation = config;
        self
    }

    /// Retry policy for outbound messages.
    pub fn send_retry(mut self, config: EntityRetryConfig) -> Self {
        self.send_retry = config;
        self
    }

    /// Clock for retry back-off. Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Bound on each loop's `stop()`.
    ///
    /// Default: 10 seconds
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Observer attached to every loop the runtime builds.
    pub fn instrumentation(mut self, instrumentation: Arc<dyn LoopInstrumentation>) -> Self {
        self.instrumentation = Some(instrumentation);
        self
    }

    /// Register an additional loop. It starts after the built-in ones.
    pub fn process_loop(mut self, process_loop: ProcessLoop) -> Self {
        self.extra_loops.push(process_loop);
        self
    }

    /// Wire managers and loops.
    pub fn build(self) -> Result<ConnectorRuntimeConfig> {
        let transfer_store = self
            .transfer_store
            .ok_or(Error::MissingComponent("transfer_store"))?;
        let negotiation_store = self
            .negotiation_store
            .ok_or(Error::MissingComponent("negotiation_store"))?;
        let dispatcher = self
            .dispatcher
            .ok_or(Error::MissingComponent("dispatcher"))?;

        let mut retry = EntityRetryPolicy::new(self.send_retry);
        if let Some(clock) = self.clock {
            retry = retry.with_clock(clock);
        }

        let transfer_manager = Arc::new(StateMachineManager::new(
            Arc::new(TransferProcessTable),
            transfer_store.clone(),
            dispatcher.clone(),
            retry.clone(),
        ));
        let negotiation_manager = Arc::new(StateMachineManager::new(
            Arc::new(ContractNegotiationTable),
            negotiation_store.clone(),
            dispatcher,
            retry,
        ));

        let mut loops = Vec::with_capacity(2 + self.extra_loops.len());
        for builder in [
            negotiation_manager.process_loop(&self.negotiation, self.shutdown_timeout),
            transfer_manager.process_loop(&self.transfer, self.shutdown_timeout),
        ] {
            let builder = match &self.instrumentation {
                Some(instrumentation) => builder.instrumentation(instrumentation.clone()),
                None => builder,
            };
            loops.push(builder.build());
        }
        loops.extend(self.extra_loops);

        Ok(ConnectorRuntimeConfig {
            connector_id: self.connector_id,
            loops,
            transfer_service: TransferProcessService::new(transfer_store),
            negotiation_service: ContractNegotiationService::new(negotiation_store),
        })
    }
}

/// A wired runtime that has not been started.
pub struct ConnectorRuntimeConfig {
    connector_id: String,
    loops: Vec<ProcessLoop>,
    transfer_service: TransferProcessService,
    negotiation_service: ContractNegotiationService,
}

impl ConnectorRuntimeConfig {
    /// Start every loop in registration order.
    pub async fn start(self) -> ConnectorRuntime {
        for process_loop in &self.loops {
            process_loop.start().await;
        }

        info!(
            connector_id = %self.connector_id,
            loops = self.loops.len(),
            "ConnectorRuntime started"
        );

        ConnectorRuntime {
            connector_id: self.connector_id,
            loops: self.loops,
            transfer_service: self.transfer_service,
            negotiation_service: self.negotiation_service,
        }
    }
}

/// Health of one loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopHealth {
    /// Loop name.
    pub name: String,
    /// Lifecycle state.
    pub state: LoopState,
    /// Whether the worker is alive.
    pub active: bool,
    /// Counters since the loop was built.
    pub stats: LoopStatsSnapshot,
}

/// Health of the whole runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    /// Lease owner identity of this instance.
    pub connector_id: String,
    /// One entry per loop, in start order.
    pub loops: Vec<LoopHealth>,
}

impl HealthReport {
    /// Whether every loop is active.
    pub fn is_healthy(&self) -> bool {
        self.loops.iter().all(|l| l.active)
    }

    /// Names of loops that are not active.
    pub fn inactive_loops(&self) -> Vec<&str> {
        self.loops
            .iter()
            .filter(|l| !l.active)
            .map(|l| l.name.as_str())
            .collect()
    }
}

/// A running connector.
pub struct ConnectorRuntime {
    connector_id: String,
    loops: Vec<ProcessLoop>,
    transfer_service: TransferProcessService,
    negotiation_service: ContractNegotiationService,
}

impl ConnectorRuntime {
    /// Create a new runtime builder.
    pub fn builder() -> ConnectorRuntimeBuilder {
        ConnectorRuntimeBuilder::new()
    }

    /// Open the stores `config` names and return a builder wired with them.
    pub async fn from_config(
        config: &Config,
        dispatcher: Arc<dyn RemoteMessageDispatcher>,
    ) -> Result<ConnectorRuntimeBuilder> {
        let (transfer_store, negotiation_store) = open_stores(config).await?;
        info!(
            connector_id = %config.connector_id,
            backend = config.store.kind(),
            "Entity stores opened"
        );

        Ok(Self::builder()
            .connector_id(config.connector_id.clone())
            .transfer_store(transfer_store)
            .negotiation_store(negotiation_store)
            .dispatcher(dispatcher)
            .transfer_loop(config.transfer.clone())
            .negotiation_loop(config.negotiation.clone())
            .send_retry(config.send_retry.clone())
            .shutdown_timeout(config.shutdown_timeout))
    }

    /// Lease owner identity of this instance.
    pub fn connector_id(&self) -> &str {
        &self.connector_id
    }

    /// Inbound operations on transfer processes.
    pub fn transfer_service(&self) -> &TransferProcessService {
        &self.transfer_service
    }

    /// Inbound operations on contract negotiations.
    pub fn negotiation_service(&self) -> &ContractNegotiationService {
        &self.negotiation_service
    }

    /// Whether every loop is active.
    pub fn is_running(&self) -> bool {
        self.loops.iter().all(ProcessLoop::is_active)
    }

    /// Per-loop health.
    pub fn health(&self) -> HealthReport {
        HealthReport {
            connector_id: self.connector_id.clone(),
            loops: self
                .loops
                .iter()
                .map(|l| LoopHealth {
                    name: l.name().to_string(),
                    state: l.state(),
                    active: l.is_active(),
                    stats: l.stats(),
                })
                .collect(),
        }
    }

    /// Stop every loop in reverse start order.
    ///
    /// Never fails; a loop that does not stop in time is logged and left
    /// behind. Calling it again is a no-op for loops already stopped.
    pub async fn shutdown(&self) {
        info!(connector_id = %self.connector_id, "Shutting down ConnectorRuntime");

        for process_loop in self.loops.iter().rev() {
            process_loop.stop().await;
            if process_loop.state() != LoopState::Stopped {
                warn!(
                    loop_name = %process_loop.name(),
                    state = %process_loop.state(),
                    "Loop did not stop within its shutdown timeout"
                );
            }
        }

        info!(connector_id = %self.connector_id, "ConnectorRuntime shutdown complete");
    }
}

type Stores = (
    Arc<dyn StatefulEntityStore<TransferProcess>>,
    Arc<dyn StatefulEntityStore<ContractNegotiation>>,
);

async fn open_stores(config: &Config) -> Result<Stores> {
    let owner = config.connector_id.as_str();
    let lease_duration = config.lease_duration;

    let stores: Stores = match &config.store {
        StoreBackend::InMemory => (
            Arc::new(
                InMemoryEntityStore::<TransferProcess>::new(owner)
                    .with_lease_duration(lease_duration),
            ),
            Arc::new(
                InMemoryEntityStore::<ContractNegotiation>::new(owner)
                    .with_lease_duration(lease_duration),
            ),
        ),
        StoreBackend::Sqlite(url) => {
            let transfers = SqliteEntityStore::<TransferProcess>::connect(url, owner)
                .await?
                .with_lease_duration(lease_duration);
            let negotiations = transfers.for_entity::<ContractNegotiation>();
            (Arc::new(transfers), Arc::new(negotiations))
        }
        StoreBackend::Postgres(url) => {
            let transfers = PostgresEntityStore::<TransferProcess>::connect(url, owner)
                .await?
                .with_lease_duration(lease_duration);
            let negotiations = transfers.for_entity::<ContractNegotiation>();
            (Arc::new(transfers), Arc::new(negotiations))
        }
    };
    Ok(stores)
}
