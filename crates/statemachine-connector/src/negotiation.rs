// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Contract negotiations.
//!
//! The consumer requests, accepts and verifies; the provider offers, agrees
//! and finalizes. Sending states are driven by the process loop, waiting
//! states move on when the counter-party's message arrives through
//! [`ContractNegotiationService`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use statemachine_core::{
    EngineError, EntityMeta, Result, StatefulEntity, StatefulEntityStore, StoreResult,
};
use tracing::info;
use uuid::Uuid;

use crate::dispatcher::{MessageType, ProtocolMessage};
use crate::manager::{Action, TransitionTable};
use crate::types::{Role, ServiceResult, invalid_state, lease_and_update};

/// Contract negotiation states. The numeric codes are what the store persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ContractNegotiationState {
    /// Created, nothing sent yet.
    Initial = 50,
    /// Consumer is sending the contract request.
    Requesting = 100,
    /// Request delivered or received.
    Requested = 200,
    /// Provider is sending an offer.
    Offering = 300,
    /// Offer delivered or received.
    Offered = 400,
    /// Consumer is sending its acceptance.
    Accepting = 700,
    /// Acceptance delivered or received.
    Accepted = 800,
    /// Provider is sending the agreement.
    Agreeing = 825,
    /// Agreement delivered or received.
    Agreed = 850,
    /// Consumer is sending the verification.
    Verifying = 1050,
    /// Verification delivered or received.
    Verified = 1100,
    /// Provider is sending the finalization.
    Finalizing = 1150,
    /// Negotiation concluded with an agreement.
    Finalized = 1200,
    /// Sending the termination message.
    Terminating = 1300,
    /// Negotiation aborted.
    Terminated = 1600,
}

impl ContractNegotiationState {
    const ALL: [Self; 15] = [
        Self::Initial,
        Self::Requesting,
        Self::Requested,
        Self::Offering,
        Self::Offered,
        Self::Accepting,
        Self::Accepted,
        Self::Agreeing,
        Self::Agreed,
        Self::Verifying,
        Self::Verified,
        Self::Finalizing,
        Self::Finalized,
        Self::Terminating,
        Self::Terminated,
    ];

    /// Persisted state code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// State for a persisted code.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.code() == code)
    }

    /// Whether no further transition can happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized | Self::Terminated)
    }
}

/// A contract negotiation with a counter-party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractNegotiation {
    meta: EntityMeta,
    /// Our side of the negotiation.
    pub role: Role,
    /// Counter-party endpoint.
    pub counter_party_address: String,
    /// Offer being negotiated.
    pub offer_id: String,
    /// Set once an agreement was reached.
    pub contract_agreement_id: Option<String>,
}

impl ContractNegotiation {
    /// A new negotiation in `state`.
    pub fn new(
        role: Role,
        counter_party_address: impl Into<String>,
        offer_id: impl Into<String>,
        state: ContractNegotiationState,
    ) -> Self {
        Self {
            meta: EntityMeta::new(Uuid::new_v4().to_string(), state.code()),
            role,
            counter_party_address: counter_party_address.into(),
            offer_id: offer_id.into(),
            contract_agreement_id: None,
        }
    }

    /// Typed current state; `None` for codes this build does not know.
    pub fn negotiation_state(&self) -> Option<ContractNegotiationState> {
        ContractNegotiationState::from_code(self.state())
    }

    fn message(&self, message_type: MessageType) -> ProtocolMessage {
        ProtocolMessage::new(message_type, self.id(), &self.counter_party_address).with_payload(
            serde_json::json!({
                "offer_id": self.offer_id,
                "contract_agreement_id": self.contract_agreement_id,
            }),
        )
    }
}

impl StatefulEntity for ContractNegotiation {
    const ENTITY_TYPE: &'static str = "contract_negotiation";

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

/// Outbound transitions of a contract negotiation.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContractNegotiationTable;

impl TransitionTable<ContractNegotiation> for ContractNegotiationTable {
    fn name(&self) -> &'static str {
        "contract-negotiation"
    }

    fn processable_states(&self) -> &'static [i32] {
        use ContractNegotiationState::*;
        const STATES: [i32; 10] = [
            Initial as i32,
            Requesting as i32,
            Offering as i32,
            Accepting as i32,
            Agreeing as i32,
            Agreed as i32,
            Verifying as i32,
            Verified as i32,
            Finalizing as i32,
            Terminating as i32,
        ];
        &STATES
    }

    fn action(&self, negotiation: &ContractNegotiation) -> Option<Action> {
        use ContractNegotiationState::*;
        let send = |message_type: MessageType, next: ContractNegotiationState| Action::Send {
            message: negotiation.message(message_type),
            next: next.code(),
        };
        let consumer = negotiation.role == Role::Consumer;
        match negotiation.negotiation_state()? {
            Initial if consumer => Some(Action::Advance(Requesting.code())),
            Initial => Some(Action::Advance(Offering.code())),
            Requesting => Some(send(MessageType::ContractRequest, Requested)),
            Offering => Some(send(MessageType::ContractOffer, Offered)),
            Accepting => Some(send(MessageType::ContractAcceptance, Accepted)),
            Agreeing => Some(send(MessageType::ContractAgreement, Agreed)),
            Agreed if consumer => Some(Action::Advance(Verifying.code())),
            Verifying => Some(send(MessageType::ContractAgreementVerification, Verified)),
            Verified if !consumer => Some(Action::Advance(Finalizing.code())),
            Finalizing => Some(send(MessageType::ContractFinalization, Finalized)),
            Terminating => Some(send(MessageType::ContractNegotiationTermination, Terminated)),
            Requested | Offered | Accepted | Agreed | Verified | Finalized | Terminated => None,
        }
    }

    fn failure_state(&self, negotiation: &ContractNegotiation) -> i32 {
        match negotiation.negotiation_state() {
            Some(ContractNegotiationState::Terminating) => {
                ContractNegotiationState::Terminated.code()
            }
            _ => ContractNegotiationState::Terminating.code(),
        }
    }
}

/// Inbound operations on contract negotiations.
#[derive(Clone)]
pub struct ContractNegotiationService {
    store: Arc<dyn StatefulEntityStore<ContractNegotiation>>,
}

impl ContractNegotiationService {
    /// Create a service over `store`.
    pub fn new(store: Arc<dyn StatefulEntityStore<ContractNegotiation>>) -> Self {
        Self { store }
    }

    /// Start a negotiation as consumer.
    pub async fn initiate(
        &self,
        counter_party_address: &str,
        offer_id: &str,
    ) -> Result<ContractNegotiation> {
        let negotiation = ContractNegotiation::new(
            Role::Consumer,
            counter_party_address,
            offer_id,
            ContractNegotiationState::Initial,
        );
        self.store.save(&negotiation).await?;
        info!(negotiation_id = %negotiation.id(), offer_id = %offer_id, "Contract negotiation initiated");
        Ok(negotiation)
    }

    /// A consumer's contract request arrived; record it as provider.
    pub async fn handle_request(
        &self,
        counter_party_address: &str,
        offer_id: &str,
    ) -> Result<ContractNegotiation> {
        let negotiation = ContractNegotiation::new(
            Role::Provider,
            counter_party_address,
            offer_id,
            ContractNegotiationState::Requested,
        );
        self.store.save(&negotiation).await?;
        info!(negotiation_id = %negotiation.id(), offer_id = %offer_id, "Contract request received");
        Ok(negotiation)
    }

    /// Look a negotiation up without leasing it.
    pub async fn find(&self, id: &str) -> Result<Option<ContractNegotiation>> {
        self.store.find_by_id(id).await
    }

    /// Consumer accepts the provider's offer.
    pub async fn accept(&self, id: &str) -> Result<ServiceResult<ContractNegotiation>> {
        lease_and_update(self.store.as_ref(), id, |negotiation: &mut ContractNegotiation| {
            match negotiation.negotiation_state() {
                Some(ContractNegotiationState::Offered) if negotiation.role == Role::Consumer => {
                    negotiation.transition_to(ContractNegotiationState::Accepting.code());
                    Ok(())
                }
                _ => Err(invalid_state(negotiation, "only an offered negotiation can be accepted")),
            }
        })
        .await
    }

    /// Provider agrees to a requested or accepted negotiation.
    pub async fn agree(&self, id: &str) -> Result<ServiceResult<ContractNegotiation>> {
        lease_and_update(self.store.as_ref(), id, |negotiation: &mut ContractNegotiation| {
            use ContractNegotiationState::*;
            match negotiation.negotiation_state() {
                Some(Requested | Accepted) if negotiation.role == Role::Provider => {
                    negotiation.contract_agreement_id = Some(Uuid::new_v4().to_string());
                    negotiation.transition_to(Agreeing.code());
                    Ok(())
                }
                _ => Err(invalid_state(negotiation, "provider can only agree after a request or acceptance")),
            }
        })
        .await
    }

    /// The provider's agreement arrived.
    pub async fn handle_agreement(
        &self,
        id: &str,
        agreement_id: &str,
    ) -> Result<ServiceResult<ContractNegotiation>> {
        lease_and_update(self.store.as_ref(), id, |negotiation: &mut ContractNegotiation| {
            use ContractNegotiationState::*;
            match negotiation.negotiation_state() {
                Some(Requested | Accepting | Accepted) if negotiation.role == Role::Consumer => {
                    negotiation.contract_agreement_id = Some(agreement_id.to_string());
                    negotiation.transition_to(Agreed.code());
                    Ok(())
                }
                _ => Err(invalid_state(negotiation, "agreement not expected")),
            }
        })
        .await
    }

    /// The consumer's verification arrived.
    pub async fn handle_verification(&self, id: &str) -> Result<ServiceResult<ContractNegotiation>> {
        lease_and_update(self.store.as_ref(), id, |negotiation: &mut ContractNegotiation| {
            match negotiation.negotiation_state() {
                Some(ContractNegotiationState::Agreed) if negotiation.role == Role::Provider => {
                    negotiation.transition_to(ContractNegotiationState::Verified.code());
                    Ok(())
                }
                _ => Err(invalid_state(negotiation, "verification not expected")),
            }
        })
        .await
    }

    /// The provider's finalization arrived.
    pub async fn handle_finalization(&self, id: &str) -> Result<ServiceResult<ContractNegotiation>> {
        lease_and_update(self.store.as_ref(), id, |negotiation: &mut ContractNegotiation| {
            match negotiation.negotiation_state() {
                Some(ContractNegotiationState::Verified) if negotiation.role == Role::Consumer => {
                    negotiation.transition_to(ContractNegotiationState::Finalized.code());
                    Ok(())
                }
                _ => Err(invalid_state(negotiation, "finalization not expected")),
            }
        })
        .await
    }

    /// Terminate a negotiation that has not concluded.
    pub async fn terminate(
        &self,
        id: &str,
        reason: &str,
    ) -> Result<ServiceResult<ContractNegotiation>> {
        lease_and_update(self.store.as_ref(), id, |negotiation: &mut ContractNegotiation| {
            match negotiation.negotiation_state() {
                Some(state)
                    if !state.is_terminal() && state != ContractNegotiationState::Terminating =>
                {
                    negotiation.transition_to(ContractNegotiationState::Terminating.code());
                    negotiation.set_error_detail(reason);
                    Ok(())
                }
                _ => Err(invalid_state(negotiation, "negotiation already concluded")),
            }
        })
        .await
    }

    /// Delete a terminated negotiation that never produced an agreement.
    pub async fn delete(&self, id: &str) -> Result<ServiceResult<()>> {
        let Some(negotiation) = self.store.find_by_id(id).await? else {
            return Ok(ServiceResult::NotFound);
        };

        let refusal = if negotiation.contract_agreement_id.is_some() {
            Some("a contract agreement exists")
        } else if !negotiation
            .negotiation_state()
            .is_some_and(ContractNegotiationState::is_terminal)
        {
            Some("negotiation is not terminated")
        } else {
            None
        };
        if let Some(reason) = refusal {
            return Ok(ServiceResult::Conflict(
                EngineError::DeletionRefused {
                    entity_id: id.to_string(),
                    reason: reason.to_string(),
                }
                .to_string(),
            ));
        }

        Ok(match self.store.delete_by_id(id).await? {
            StoreResult::Success(()) => {
                info!(negotiation_id = %id, "Contract negotiation deleted");
                ServiceResult::Success(())
            }
            StoreResult::NotFound => ServiceResult::NotFound,
            StoreResult::AlreadyLeased { leased_by } => ServiceResult::Conflict(
                EngineError::AlreadyLeased {
                    entity_id: id.to_string(),
                    leased_by,
                }
                .to_string(),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statemachine_core::InMemoryEntityStore;

    fn service() -> (
        Arc<InMemoryEntityStore<ContractNegotiation>>,
        ContractNegotiationService,
    ) {
        let store = Arc::new(InMemoryEntityStore::<ContractNegotiation>::new("node-a"));
        (store.clone(), ContractNegotiationService::new(store))
    }

    fn negotiation(role: Role, state: ContractNegotiationState) -> ContractNegotiation {
        ContractNegotiation::new(role, "https://peer", "offer-1", state)
    }

    #[test]
    fn test_state_codes_round_trip() {
        for state in ContractNegotiationState::ALL {
            assert_eq!(ContractNegotiationState::from_code(state.code()), Some(state));
        }
        assert_eq!(ContractNegotiationState::from_code(0), None);
    }

    #[test]
    fn test_initial_branches_on_role() {
        let table = ContractNegotiationTable;
        assert_eq!(
            table.action(&negotiation(Role::Consumer, ContractNegotiationState::Initial)),
            Some(Action::Advance(ContractNegotiationState::Requesting.code()))
        );
        assert_eq!(
            table.action(&negotiation(Role::Provider, ContractNegotiationState::Initial)),
            Some(Action::Advance(ContractNegotiationState::Offering.code()))
        );
    }

    #[test]
    fn test_agreed_only_advances_for_consumer() {
        let table = ContractNegotiationTable;
        assert_eq!(
            table.action(&negotiation(Role::Consumer, ContractNegotiationState::Agreed)),
            Some(Action::Advance(ContractNegotiationState::Verifying.code()))
        );
        assert!(
            table
                .action(&negotiation(Role::Provider, ContractNegotiationState::Agreed))
                .is_none()
        );
    }

    #[test]
    fn test_send_states_carry_agreement_id() {
        let mut provider = negotiation(Role::Provider, ContractNegotiationState::Agreeing);
        provider.contract_agreement_id = Some("agreement-1".to_string());
        match ContractNegotiationTable.action(&provider) {
            Some(Action::Send { message, next }) => {
                assert_eq!(message.message_type, MessageType::ContractAgreement);
                assert_eq!(message.payload["contract_agreement_id"], "agreement-1");
                assert_eq!(next, ContractNegotiationState::Agreed.code());
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handle_agreement_moves_to_agreed() {
        let (store, service) = service();
        let consumer = negotiation(Role::Consumer, ContractNegotiationState::Requested);
        store.save(&consumer).await.unwrap();

        let agreed = service
            .handle_agreement(consumer.id(), "agreement-1")
            .await
            .unwrap()
            .success()
            .unwrap();
        assert_eq!(agreed.negotiation_state(), Some(ContractNegotiationState::Agreed));
        assert_eq!(agreed.contract_agreement_id.as_deref(), Some("agreement-1"));
        assert!(store.lease_of(consumer.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handle_agreement_conflicts_while_leased() {
        let (store, service) = service();
        let consumer = negotiation(Role::Consumer, ContractNegotiationState::Requested);
        store.save(&consumer).await.unwrap();
        let loop_owner = store.with_owner("node-b");
        assert!(
            loop_owner
                .find_by_id_and_lease(consumer.id())
                .await
                .unwrap()
                .is_success()
        );

        match service.handle_agreement(consumer.id(), "agreement-1").await.unwrap() {
            ServiceResult::Conflict(message) => assert!(message.contains("node-b")),
            other => panic!("unexpected result {other:?}"),
        }
        let stored = store.find_by_id(consumer.id()).await.unwrap().unwrap();
        assert_eq!(stored.contract_agreement_id, None);
    }

    #[tokio::test]
    async fn test_handle_agreement_in_wrong_state_is_bad_request() {
        let (store, service) = service();
        let consumer = negotiation(Role::Consumer, ContractNegotiationState::Initial);
        store.save(&consumer).await.unwrap();

        assert!(matches!(
            service.handle_agreement(consumer.id(), "agreement-1").await.unwrap(),
            ServiceResult::BadRequest(_)
        ));
        assert!(store.lease_of(consumer.id()).await.unwrap().is_none());
        assert_eq!(
            service.handle_agreement("missing", "agreement-1").await.unwrap(),
            ServiceResult::NotFound
        );
    }

    #[tokio::test]
    async fn test_provider_agree_assigns_agreement() {
        let (_store, service) = service();
        let provider = service.handle_request("https://consumer", "offer-1").await.unwrap();

        let agreeing = service.agree(provider.id()).await.unwrap().success().unwrap();
        assert_eq!(
            agreeing.negotiation_state(),
            Some(ContractNegotiationState::Agreeing)
        );
        assert!(agreeing.contract_agreement_id.is_some());
    }

    #[tokio::test]
    async fn test_delete_refused_with_agreement() {
        let (store, service) = service();
        let mut finalized = negotiation(Role::Consumer, ContractNegotiationState::Finalized);
        finalized.contract_agreement_id = Some("agreement-1".to_string());
        store.save(&finalized).await.unwrap();

        match service.delete(finalized.id()).await.unwrap() {
            ServiceResult::Conflict(message) => assert!(message.contains("agreement")),
            other => panic!("unexpected result {other:?}"),
        }
        assert!(store.find_by_id(finalized.id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_refused_while_running() {
        let (store, service) = service();
        let running = negotiation(Role::Consumer, ContractNegotiationState::Requested);
        store.save(&running).await.unwrap();

        match service.delete(running.id()).await.unwrap() {
            ServiceResult::Conflict(message) => assert!(message.contains("not terminated")),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_delete_terminated_without_agreement() {
        let (store, service) = service();
        let terminated = negotiation(Role::Consumer, ContractNegotiationState::Terminated);
        store.save(&terminated).await.unwrap();

        assert_eq!(
            service.delete(terminated.id()).await.unwrap(),
            ServiceResult::Success(())
        );
        assert!(store.find_by_id(terminated.id()).await.unwrap().is_none());
        assert_eq!(
            service.delete(terminated.id()).await.unwrap(),
            ServiceResult::NotFound
        );
    }

    #[tokio::test]
    async fn test_terminate_from_offered() {
        let (store, service) = service();
        let consumer = negotiation(Role::Consumer, ContractNegotiationState::Offered);
        store.save(&consumer).await.unwrap();

        let terminating = service
            .terminate(consumer.id(), "offer declined")
            .await
            .unwrap()
            .success()
            .unwrap();
        assert_eq!(
            terminating.negotiation_state(),
            Some(ContractNegotiationState::Terminating)
        );
        assert_eq!(terminating.meta().error_detail.as_deref(), Some("offer declined"));
    }
}
