// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transfer processes.
//!
//! Consumer side: provision, send a transfer request, wait for the provider
//! to start. Provider side: provision, send a transfer start. Either side may
//! complete or terminate a started transfer; both end with deprovisioning.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use statemachine_core::{EntityMeta, Result, StatefulEntity, StatefulEntityStore};
use tracing::info;
use uuid::Uuid;

use crate::dispatcher::{MessageType, ProtocolMessage};
use crate::manager::{Action, TransitionTable};
use crate::types::{Role, ServiceResult, invalid_state, lease_and_update};

/// Transfer process states. The numeric codes are what the store persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum TransferProcessState {
    /// Created, nothing done yet.
    Initial = 100,
    /// Provisioning resources.
    Provisioning = 200,
    /// Resources ready.
    Provisioned = 300,
    /// Consumer is sending the transfer request.
    Requesting = 400,
    /// Consumer waits for the provider to start.
    Requested = 500,
    /// Provider is sending the transfer start.
    Starting = 550,
    /// Data is flowing.
    Started = 600,
    /// Sending the completion message.
    Completing = 700,
    /// Transfer finished.
    Completed = 800,
    /// Sending the termination message.
    Terminating = 825,
    /// Transfer aborted.
    Terminated = 850,
    /// Releasing resources.
    Deprovisioning = 900,
    /// Resources released.
    Deprovisioned = 1100,
}

impl TransferProcessState {
    const ALL: [Self; 13] = [
        Self::Initial,
        Self::Provisioning,
        Self::Provisioned,
        Self::Requesting,
        Self::Requested,
        Self::Starting,
        Self::Started,
        Self::Completing,
        Self::Completed,
        Self::Terminating,
        Self::Terminated,
        Self::Deprovisioning,
        Self::Deprovisioned,
    ];

    /// Persisted state code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// State for a persisted code.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.code() == code)
    }

    /// Whether the transfer is over, successfully or not.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Terminated | Self::Deprovisioning | Self::Deprovisioned
        )
    }
}

/// A data transfer between this connector and a counter-party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProcess {
    meta: EntityMeta,
    /// Our side of the transfer.
    pub role: Role,
    /// Counter-party endpoint.
    pub counter_party_address: String,
    /// Contract agreement the transfer runs under.
    pub contract_id: String,
    /// Asset being transferred.
    pub asset_id: String,
}

impl TransferProcess {
    /// A new transfer in [`TransferProcessState::Initial`].
    pub fn new(
        role: Role,
        counter_party_address: impl Into<String>,
        contract_id: impl Into<String>,
        asset_id: impl Into<String>,
    ) -> Self {
        Self {
            meta: EntityMeta::new(
                Uuid::new_v4().to_string(),
                TransferProcessState::Initial.code(),
            ),
            role,
            counter_party_address: counter_party_address.into(),
            contract_id: contract_id.into(),
            asset_id: asset_id.into(),
        }
    }

    /// Typed current state; `None` for codes this build does not know.
    pub fn transfer_state(&self) -> Option<TransferProcessState> {
        TransferProcessState::from_code(self.state())
    }

    fn message(&self, message_type: MessageType) -> ProtocolMessage {
        ProtocolMessage::new(message_type, self.id(), &self.counter_party_address).with_payload(
            serde_json::json!({
                "contract_id": self.contract_id,
                "asset_id": self.asset_id,
            }),
        )
    }
}

impl StatefulEntity for TransferProcess {
    const ENTITY_TYPE: &'static str = "transfer_process";

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

/// Outbound transitions of a transfer process.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransferProcessTable;

impl TransitionTable<TransferProcess> for TransferProcessTable {
    fn name(&self) -> &'static str {
        "transfer-process"
    }

    fn processable_states(&self) -> &'static [i32] {
        use TransferProcessState::*;
        const STATES: [i32; 8] = [
            Initial as i32,
            Provisioning as i32,
            Provisioned as i32,
            Requesting as i32,
            Starting as i32,
            Completing as i32,
            Terminating as i32,
            Deprovisioning as i32,
        ];
        &STATES
    }

    fn action(&self, process: &TransferProcess) -> Option<Action> {
        use TransferProcessState::*;
        let send = |message_type: MessageType, next: TransferProcessState| Action::Send {
            message: process.message(message_type),
            next: next.code(),
        };
        match process.transfer_state()? {
            Initial => Some(Action::Advance(Provisioning.code())),
            Provisioning => Some(Action::Advance(Provisioned.code())),
            Provisioned => Some(Action::Advance(match process.role {
                Role::Consumer => Requesting.code(),
                Role::Provider => Starting.code(),
            })),
            Requesting => Some(send(MessageType::TransferRequest, Requested)),
            Starting => Some(send(MessageType::TransferStart, Started)),
            Completing => Some(send(MessageType::TransferCompletion, Completed)),
            Terminating => Some(send(MessageType::TransferTermination, Terminated)),
            Deprovisioning => Some(Action::Advance(Deprovisioned.code())),
            Requested | Started | Completed | Terminated | Deprovisioned => None,
        }
    }

    fn failure_state(&self, process: &TransferProcess) -> i32 {
        match process.transfer_state() {
            Some(TransferProcessState::Terminating) => TransferProcessState::Terminated.code(),
            Some(TransferProcessState::Deprovisioning) => {
                TransferProcessState::Deprovisioned.code()
            }
            _ => TransferProcessState::Terminating.code(),
        }
    }
}

/// Inbound operations on transfer processes.
///
/// Every mutation leases the process first, so a call racing the process
/// loop gets [`ServiceResult::Conflict`] instead of clobbering it.
#[derive(Clone)]
pub struct TransferProcessService {
    store: Arc<dyn StatefulEntityStore<TransferProcess>>,
}

impl TransferProcessService {
    /// Create a service over `store`.
    pub fn new(store: Arc<dyn StatefulEntityStore<TransferProcess>>) -> Self {
        Self { store }
    }

    /// Create and persist a new transfer.
    pub async fn initiate(
        &self,
        role: Role,
        counter_party_address: &str,
        contract_id: &str,
        asset_id: &str,
    ) -> Result<TransferProcess> {
        let process = TransferProcess::new(role, counter_party_address, contract_id, asset_id);
        self.store.save(&process).await?;
        info!(process_id = %process.id(), role = ?role, "Transfer process initiated");
        Ok(process)
    }

    /// Look a transfer up without leasing it.
    pub async fn find(&self, id: &str) -> Result<Option<TransferProcess>> {
        self.store.find_by_id(id).await
    }

    /// The provider reported the transfer as started.
    pub async fn notify_started(&self, id: &str) -> Result<ServiceResult<TransferProcess>> {
        lease_and_update(self.store.as_ref(), id, |process: &mut TransferProcess| {
            if process.role != Role::Consumer
                || process.transfer_state() != Some(TransferProcessState::Requested)
            {
                return Err(invalid_state(process, "only a requested consumer transfer can start"));
            }
            process.transition_to(TransferProcessState::Started.code());
            Ok(())
        })
        .await
    }

    /// Complete a started transfer.
    pub async fn complete(&self, id: &str) -> Result<ServiceResult<TransferProcess>> {
        lease_and_update(self.store.as_ref(), id, |process: &mut TransferProcess| {
            if process.transfer_state() != Some(TransferProcessState::Started) {
                return Err(invalid_state(process, "only a started transfer can complete"));
            }
            process.transition_to(TransferProcessState::Completing.code());
            Ok(())
        })
        .await
    }

    /// Terminate a transfer that has not finished yet.
    pub async fn terminate(&self, id: &str, reason: &str) -> Result<ServiceResult<TransferProcess>> {
        lease_and_update(self.store.as_ref(), id, |process: &mut TransferProcess| {
            match process.transfer_state() {
                Some(state) if !state.is_final() && state != TransferProcessState::Terminating => {
                    process.transition_to(TransferProcessState::Terminating.code());
                    process.set_error_detail(reason);
                    Ok(())
                }
                _ => Err(invalid_state(process, "transfer already finished")),
            }
        })
        .await
    }

    /// Release the resources of a completed or terminated transfer.
    pub async fn deprovision(&self, id: &str) -> Result<ServiceResult<TransferProcess>> {
        lease_and_update(self.store.as_ref(), id, |process: &mut TransferProcess| {
            match process.transfer_state() {
                Some(TransferProcessState::Completed | TransferProcessState::Terminated) => {
                    process.transition_to(TransferProcessState::Deprovisioning.code());
                    Ok(())
                }
                _ => Err(invalid_state(process, "only a finished transfer can be deprovisioned")),
            }
        })
        .await
    }
}
