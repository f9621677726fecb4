// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inter-cycle wait strategies.
//!
//! A process loop asks its strategy how long to sleep after every cycle:
//! `wait_for_millis()` after an idle cycle, `retry_in_millis()` after a
//! recoverable error. `success()` is called after a cycle that did work and
//! is followed by no sleep at all.

/// Policy computing the delay before the next cycle.
pub trait WaitStrategy: Send + 'static {
    /// Delay after a cycle that processed nothing.
    fn wait_for_millis(&mut self) -> u64;

    /// A cycle processed at least one entity; reset any backoff.
    fn success(&mut self) {}

    /// Delay after a recoverable processor error.
    fn retry_in_millis(&mut self) -> u64 {
        self.wait_for_millis()
    }
}

/// Always waits the same amount of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWaitStrategy {
    millis: u64,
}

impl FixedWaitStrategy {
    /// Wait `millis` after idle cycles and after errors.
    pub fn new(millis: u64) -> Self {
        Self { millis }
    }
}

impl Default for FixedWaitStrategy {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl WaitStrategy for FixedWaitStrategy {
    fn wait_for_millis(&mut self) -> u64 {
        self.millis
    }
}

/// Idle delay doubles with every consecutive idle cycle up to `max_ms`.
///
/// `retry_in_millis()` always returns `base_ms`: a failing dependency is
/// retried promptly regardless of how long the loop has been idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialWaitStrategy {
    base_ms: u64,
    max_ms: u64,
    idle_cycles: u32,
}

impl ExponentialWaitStrategy {
    /// Largest exponent applied to `base_ms`.
    const MAX_EXPONENT: u32 = 16;

    /// Create a strategy growing from `base_ms` to at most `max_ms`.
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms: max_ms.max(base_ms),
            idle_cycles: 0,
        }
    }

    /// Consecutive idle cycles since the last success.
    pub fn idle_cycles(&self) -> u32 {
        self.idle_cycles
    }
}

impl WaitStrategy for ExponentialWaitStrategy {
    fn wait_for_millis(&mut self) -> u64 {
        let exponent = self.idle_cycles.min(Self::MAX_EXPONENT);
        self.idle_cycles = self.idle_cycles.saturating_add(1);
        self.base_ms
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(self.max_ms)
    }

    fn success(&mut self) {
        self.idle_cycles = 0;
    }

    fn retry_in_millis(&mut self) -> u64 {
        self.base_ms
    }
}
