// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for statemachine-core integration tests.
//!
//! Provides a scripted processor, a recording wait strategy and a small
//! stateful entity.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use statemachine_core::{EngineError, EntityMeta, EntityProcessor, Result, StatefulEntity, WaitStrategy};

/// One scripted processor outcome.
#[derive(Debug, Clone)]
pub enum Step {
    /// Return this count.
    Count(usize),
    /// Sleep, then return the count.
    SlowCount(Duration, usize),
    /// Return a recoverable error.
    Recoverable,
    /// Return a fatal error.
    Fatal,
    /// Panic.
    Panic,
}

/// Processor replaying a script, then repeating `fallback` forever.
#[derive(Clone)]
pub struct ScriptedProcessor {
    script: Arc<Mutex<VecDeque<Step>>>,
    fallback: Step,
    invocations: Arc<Mutex<Vec<Instant>>>,
}

impl ScriptedProcessor {
    pub fn new(script: impl IntoIterator<Item = Step>, fallback: Step) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into_iter().collect())),
            fallback,
            invocations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Always return the same outcome.
    pub fn always(step: Step) -> Self {
        Self::new([], step)
    }

    pub fn invocations(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }

    pub fn invocation_times(&self) -> Vec<Instant> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl EntityProcessor for ScriptedProcessor {
    async fn process(&self) -> Result<usize> {
        self.invocations.lock().unwrap().push(Instant::now());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match step {
            Step::Count(n) => Ok(n),
            Step::SlowCount(delay, n) => {
                tokio::time::sleep(delay).await;
                Ok(n)
            }
            Step::Recoverable => Err(EngineError::store("next_not_leased", "connection reset")),
            Step::Fatal => Err(EngineError::fatal("store corrupted")),
            Step::Panic => panic!("processor bug"),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Calls made on a [`RecordingWaitStrategy`].
#[derive(Debug, Default)]
pub struct WaitCalls {
    pub wait_for: AtomicUsize,
    pub success: AtomicUsize,
    pub retry_in: AtomicUsize,
}

impl WaitCalls {
    pub fn wait_for(&self) -> usize {
        self.wait_for.load(Ordering::SeqCst)
    }

    pub fn success(&self) -> usize {
        self.success.load(Ordering::SeqCst)
    }

    pub fn retry_in(&self) -> usize {
        self.retry_in.load(Ordering::SeqCst)
    }
}

/// Wait strategy returning fixed delays and counting every call.
pub struct RecordingWaitStrategy {
    wait_ms: u64,
    retry_ms: u64,
    calls: Arc<WaitCalls>,
}

impl RecordingWaitStrategy {
    pub fn new(wait_ms: u64, retry_ms: u64) -> (Self, Arc<WaitCalls>) {
        let calls = Arc::new(WaitCalls::default());
        (
            Self {
                wait_ms,
                retry_ms,
                calls: calls.clone(),
            },
            calls,
        )
    }
}

impl WaitStrategy for RecordingWaitStrategy {
    fn wait_for_millis(&mut self) -> u64 {
        self.calls.wait_for.fetch_add(1, Ordering::SeqCst);
        self.wait_ms
    }

    fn success(&mut self) {
        self.calls.success.fetch_add(1, Ordering::SeqCst);
    }

    fn retry_in_millis(&mut self) -> u64 {
        self.calls.retry_in.fetch_add(1, Ordering::SeqCst);
        self.retry_ms
    }
}

/// Poll `condition` every 5 ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Minimal entity for store tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub meta: EntityMeta,
    pub sku: String,
}

impl Order {
    pub fn new(id: impl Into<String>, state: i32) -> Self {
        let meta = EntityMeta::new(id, state);
        let sku = format!("sku-{}", meta.id);
        Self { meta, sku }
    }
}

impl StatefulEntity for Order {
    const ENTITY_TYPE: &'static str = "order";

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}
