// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound protocol messages.
//!
//! State machines never talk to counter-parties directly; they hand a
//! [`ProtocolMessage`] to a [`RemoteMessageDispatcher`]. A dispatch failure is
//! a business-level outcome that the caller records on the entity.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Kinds of outbound protocol messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Consumer asks the provider to start a transfer.
    TransferRequest,
    /// Provider announces the transfer has started.
    TransferStart,
    /// Either side announces completion.
    TransferCompletion,
    /// Either side terminates the transfer.
    TransferTermination,
    /// Consumer requests a contract.
    ContractRequest,
    /// Provider offers a contract.
    ContractOffer,
    /// Consumer accepts the current offer.
    ContractAcceptance,
    /// Provider sends the agreement.
    ContractAgreement,
    /// Consumer verifies the agreement.
    ContractAgreementVerification,
    /// Provider finalizes the negotiation.
    ContractFinalization,
    /// Either side terminates the negotiation.
    ContractNegotiationTermination,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::TransferRequest => "transfer_request",
            Self::TransferStart => "transfer_start",
            Self::TransferCompletion => "transfer_completion",
            Self::TransferTermination => "transfer_termination",
            Self::ContractRequest => "contract_request",
            Self::ContractOffer => "contract_offer",
            Self::ContractAcceptance => "contract_acceptance",
            Self::ContractAgreement => "contract_agreement",
            Self::ContractAgreementVerification => "contract_agreement_verification",
            Self::ContractFinalization => "contract_finalization",
            Self::ContractNegotiationTermination => "contract_negotiation_termination",
        };
        f.write_str(name)
    }
}

/// A message addressed to a counter-party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    /// What is being communicated.
    pub message_type: MessageType,
    /// The local entity the message is about.
    pub process_id: String,
    /// Counter-party endpoint.
    pub counter_party_address: String,
    /// Message body.
    pub payload: serde_json::Value,
}

impl ProtocolMessage {
    /// Create a message with an empty payload.
    pub fn new(
        message_type: MessageType,
        process_id: impl Into<String>,
        counter_party_address: impl Into<String>,
    ) -> Self {
        Self {
            message_type,
            process_id: process_id.into(),
            counter_party_address: counter_party_address.into(),
            payload: serde_json::Value::Null,
        }
    }

    /// Attach a body.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Why a message could not be delivered.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The counter-party could not be reached.
    #[error("counter-party {address} unreachable: {reason}")]
    Unreachable {
        /// Counter-party endpoint.
        address: String,
        /// Transport failure.
        reason: String,
    },

    /// The counter-party answered with a rejection.
    #[error("counter-party rejected {message_type}: {reason}")]
    Rejected {
        /// Message that was rejected.
        message_type: MessageType,
        /// Rejection reason.
        reason: String,
    },
}

/// Delivers protocol messages to counter-parties.
#[async_trait]
pub trait RemoteMessageDispatcher: Send + Sync {
    /// Deliver `message`, returning once the counter-party acknowledged it.
    async fn dispatch(&self, message: ProtocolMessage) -> Result<(), DispatchError>;
}

/// Dispatcher that only logs; used when no transport is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDispatcher;

#[async_trait]
impl RemoteMessageDispatcher for LoggingDispatcher {
    async fn dispatch(&self, message: ProtocolMessage) -> Result<(), DispatchError> {
        info!(
            message_type = %message.message_type,
            process_id = %message.process_id,
            counter_party = %message.counter_party_address,
            "Dispatching protocol message"
        );
        Ok(())
    }
}
