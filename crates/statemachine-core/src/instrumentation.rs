// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hooks for observing a process loop without changing its behaviour.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::ErrorSeverity;

/// Observer called from the loop's worker task.
///
/// Implementations must be cheap; they run inline between cycles.
pub trait LoopInstrumentation: Send + Sync {
    /// A cycle finished without error.
    fn on_cycle(&self, loop_name: &str, processed: usize, elapsed: Duration) {
        let _ = (loop_name, processed, elapsed);
    }

    /// A cycle ended with an error.
    fn on_error(&self, loop_name: &str, severity: ErrorSeverity, error: &str) {
        let _ = (loop_name, severity, error);
    }
}

/// Instrumentation that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInstrumentation;

impl LoopInstrumentation for NoopInstrumentation {}

/// Counters maintained by every process loop.
#[derive(Debug, Default)]
pub struct LoopStats {
    cycles: AtomicU64,
    idle_cycles: AtomicU64,
    processed: AtomicU64,
    recoverable_errors: AtomicU64,
    fatal_errors: AtomicU64,
}

impl LoopStats {
    pub(crate) fn record_cycle(&self, processed: usize) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if processed == 0 {
            self.idle_cycles.fetch_add(1, Ordering::Relaxed);
        } else {
            self.processed
                .fetch_add(processed as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_error(&self, severity: ErrorSeverity) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        match severity {
            ErrorSeverity::Recoverable => self.recoverable_errors.fetch_add(1, Ordering::Relaxed),
            ErrorSeverity::Fatal => self.fatal_errors.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> LoopStatsSnapshot {
        LoopStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            idle_cycles: self.idle_cycles.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            recoverable_errors: self.recoverable_errors.load(Ordering::Relaxed),
            fatal_errors: self.fatal_errors.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`LoopStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStatsSnapshot {
    /// Cycles run, including failed ones.
    pub cycles: u64,
    /// Cycles that processed nothing.
    pub idle_cycles: u64,
    /// Entities processed across all cycles.
    pub processed: u64,
    /// Cycles ended by a recoverable error.
    pub recoverable_errors: u64,
    /// Cycles ended by a fatal error.
    pub fatal_errors: u64,
}
