// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for connector integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use statemachine_connector::{
    DispatchError, MessageType, ProtocolMessage, RemoteMessageDispatcher,
};

/// Dispatcher that records every delivered message and can be switched to
/// fail every delivery.
#[derive(Default)]
pub struct RecordingDispatcher {
    failing: AtomicBool,
    sent: Mutex<Vec<ProtocolMessage>>,
}

impl RecordingDispatcher {
    pub fn failing() -> Self {
        let dispatcher = Self::default();
        dispatcher.set_failing(true);
        dispatcher
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<ProtocolMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Message types delivered for `process_id`, in order.
    pub fn sent_for(&self, process_id: &str) -> Vec<MessageType> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.process_id == process_id)
            .map(|m| m.message_type)
            .collect()
    }
}

#[async_trait]
impl RemoteMessageDispatcher for RecordingDispatcher {
    async fn dispatch(&self, message: ProtocolMessage) -> Result<(), DispatchError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DispatchError::Unreachable {
                address: message.counter_party_address,
                reason: "connection refused".to_string(),
            });
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

/// Poll an async condition until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition().await
}
