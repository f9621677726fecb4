// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The single-worker process loop.
//!
//! A [`ProcessLoop`] owns exactly one background task. Each cycle runs every
//! registered processor in order and sums their counts, then consults the
//! wait strategy:
//!
//! - work was done: `success()`, next cycle starts immediately
//! - nothing to do: sleep `wait_for_millis()`
//! - recoverable error: sleep `retry_in_millis()`, keep running
//! - fatal error or panic: the worker exits and the loop stays stopped
//!
//! Shutdown is cooperative. `stop()` flips a watch channel that the worker
//! checks between cycles and races against every sleep, so a long idle
//! backoff never delays shutdown, while a cycle in progress is always
//! allowed to finish its batch.
//!
//! `stop()` waits at most `shutdown_timeout`. When the timeout wins, `stop()`
//! still returns and the loop reports `Stopping` until the worker's current
//! cycle completes; callers needing certainty must poll [`ProcessLoop::state`].

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::error::{EngineError, ErrorSeverity};
use crate::instrumentation::{LoopInstrumentation, LoopStats, LoopStatsSnapshot, NoopInstrumentation};
use crate::processor::EntityProcessor;
use crate::wait::{FixedWaitStrategy, WaitStrategy};

/// Default bound on how long `stop()` waits for the worker.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle state of a process loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    /// No worker.
    Stopped = 0,
    /// Worker spawned, not yet cycling.
    Starting = 1,
    /// Worker cycling.
    Running = 2,
    /// Shutdown requested, worker finishing its cycle.
    Stopping = 3,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Builder for [`ProcessLoop`].
pub struct ProcessLoopBuilder {
    name: String,
    processors: Vec<Arc<dyn EntityProcessor>>,
    wait_strategy: Option<Box<dyn WaitStrategy>>,
    shutdown_timeout: Duration,
    instrumentation: Option<Arc<dyn LoopInstrumentation>>,
}

impl Default for ProcessLoopBuilder {
    fn default() -> Self {
        Self {
            name: "process-loop".to_string(),
            processors: Vec::new(),
            wait_strategy: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            instrumentation: None,
        }
    }
}

impl ProcessLoopBuilder {
    /// Create a builder with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Name used in logs, spans and instrumentation.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Register a processor. Processors run in registration order.
    pub fn processor(self, processor: impl EntityProcessor + 'static) -> Self {
        self.processor_arc(Arc::new(processor))
    }

    /// Register a shared processor.
    pub fn processor_arc(mut self, processor: Arc<dyn EntityProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    /// Set the wait strategy (default: fixed 1000 ms).
    pub fn wait_strategy(mut self, strategy: impl WaitStrategy) -> Self {
        self.wait_strategy = Some(Box::new(strategy));
        self
    }

    /// Set the `stop()` timeout (default: 10 s).
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Attach an observer.
    pub fn instrumentation(mut self, instrumentation: Arc<dyn LoopInstrumentation>) -> Self {
        self.instrumentation = Some(instrumentation);
        self
    }

    /// Build the loop. It is created stopped.
    ///
    /// A loop without processors is valid; every cycle is idle.
    pub fn build(self) -> ProcessLoop {
        if self.processors.is_empty() {
            warn!(loop_name = %self.name, "Process loop built without processors");
        }
        ProcessLoop {
            shared: Arc::new(Shared {
                name: self.name,
                state: AtomicU8::new(LoopState::Stopped as u8),
                processors: self.processors,
                wait_strategy: Mutex::new(
                    self.wait_strategy
                        .unwrap_or_else(|| Box::new(FixedWaitStrategy::default())),
                ),
                instrumentation: self
                    .instrumentation
                    .unwrap_or_else(|| Arc::new(NoopInstrumentation)),
                stats: LoopStats::default(),
                shutdown_timeout: self.shutdown_timeout,
            }),
            run: Mutex::new(None),
        }
    }
}

struct Shared {
    name: String,
    state: AtomicU8,
    processors: Vec<Arc<dyn EntityProcessor>>,
    wait_strategy: Mutex<Box<dyn WaitStrategy>>,
    instrumentation: Arc<dyn LoopInstrumentation>,
    stats: LoopStats,
    shutdown_timeout: Duration,
}

struct RunHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Why a cycle did not complete.
enum CycleFailure {
    Error { processor: String, error: EngineError },
    Panic { processor: String, message: String },
}

impl CycleFailure {
    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Error { error, .. } => error.severity(),
            Self::Panic { .. } => ErrorSeverity::Fatal,
        }
    }

    fn processor(&self) -> &str {
        match self {
            Self::Error { processor, .. } | Self::Panic { processor, .. } => processor,
        }
    }
}

impl fmt::Display for CycleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error { error, .. } => write!(f, "{}", error),
            Self::Panic { message, .. } => write!(f, "processor panicked: {}", message),
        }
    }
}

impl Shared {
    fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: LoopState, to: LoopState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn wait_strategy(&self) -> MutexGuard<'_, Box<dyn WaitStrategy>> {
        self.wait_strategy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_cycle(&self) -> Result<usize, CycleFailure> {
        let mut processed = 0;
        for processor in &self.processors {
            match AssertUnwindSafe(processor.process()).catch_unwind().await {
                Ok(Ok(count)) => processed += count,
                Ok(Err(error)) => {
                    return Err(CycleFailure::Error {
                        processor: processor.name().to_string(),
                        error,
                    });
                }
                Err(payload) => {
                    return Err(CycleFailure::Panic {
                        processor: processor.name().to_string(),
                        message: panic_message(payload.as_ref()),
                    });
                }
            }
        }
        Ok(processed)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Marks the loop stopped when the worker exits, however it exits.
struct StoppedOnExit(Arc<Shared>);

impl Drop for StoppedOnExit {
    fn drop(&mut self) {
        self.0
            .state
            .store(LoopState::Stopped as u8, Ordering::Release);
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    mut shutdown_rx: watch::Receiver<bool>,
    started_tx: oneshot::Sender<()>,
) {
    let _stopped = StoppedOnExit(shared.clone());
    shared.transition(LoopState::Starting, LoopState::Running);
    let _ = started_tx.send(());

    info!(
        processors = shared.processors.len(),
        "Process loop started"
    );

    loop {
        if *shutdown_rx.borrow() || shutdown_rx.has_changed().is_err() {
            break;
        }

        let cycle_started = Instant::now();
        let delay_ms = match shared.run_cycle().await {
            Ok(processed) if processed > 0 => {
                shared.wait_strategy().success();
                shared.stats.record_cycle(processed);
                shared
                    .instrumentation
                    .on_cycle(&shared.name, processed, cycle_started.elapsed());
                debug!(processed, "Cycle processed entities");
                None
            }
            Ok(_) => {
                shared.stats.record_cycle(0);
                shared
                    .instrumentation
                    .on_cycle(&shared.name, 0, cycle_started.elapsed());
                Some(shared.wait_strategy().wait_for_millis())
            }
            Err(failure) => {
                let severity = failure.severity();
                shared.stats.record_error(severity);
                shared
                    .instrumentation
                    .on_error(&shared.name, severity, &failure.to_string());
                match severity {
                    ErrorSeverity::Recoverable => {
                        let retry_ms = shared.wait_strategy().retry_in_millis();
                        warn!(
                            processor = failure.processor(),
                            error = %failure,
                            retry_in_ms = retry_ms,
                            "Recoverable error in process loop cycle"
                        );
                        Some(retry_ms)
                    }
                    ErrorSeverity::Fatal => {
                        error!(
                            processor = failure.processor(),
                            error = %failure,
                            "Fatal error in process loop, worker exiting"
                        );
                        break;
                    }
                }
            }
        };

        match delay_ms {
            None => tokio::task::yield_now().await,
            Some(ms) => {
                tokio::select! {
                    biased;
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                }
            }
        }
    }

    info!(cycles = shared.stats.snapshot().cycles, "Process loop stopped");
}

/// Drives one family of stateful entities with a single background worker.
///
/// ```ignore
/// let process_loop = ProcessLoop::builder()
///     .name("transfer-process")
///     .processor(processor)
///     .wait_strategy(ExponentialWaitStrategy::new(100, 5_000))
///     .shutdown_timeout(Duration::from_secs(5))
///     .build();
///
/// process_loop.start().await;
/// assert!(process_loop.is_active());
/// process_loop.stop().await;
/// ```
pub struct ProcessLoop {
    shared: Arc<Shared>,
    run: Mutex<Option<RunHandle>>,
}

impl fmt::Debug for ProcessLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessLoop")
            .field("name", &self.shared.name)
            .field("state", &self.shared.state())
            .field("processors", &self.shared.processors.len())
            .field("shutdown_timeout", &self.shared.shutdown_timeout)
            .finish()
    }
}

impl ProcessLoop {
    /// Start building a loop.
    pub fn builder() -> ProcessLoopBuilder {
        ProcessLoopBuilder::new()
    }

    /// Loop name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LoopState {
        self.shared.state()
    }

    /// True only while the worker is cycling.
    pub fn is_active(&self) -> bool {
        self.state() == LoopState::Running
    }

    /// Configured `stop()` bound.
    pub fn shutdown_timeout(&self) -> Duration {
        self.shared.shutdown_timeout
    }

    /// Counters since construction.
    pub fn stats(&self) -> LoopStatsSnapshot {
        self.shared.stats.snapshot()
    }

    fn run_handle(&self) -> MutexGuard<'_, Option<RunHandle>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the worker and wait until it has begun.
    ///
    /// No-op unless the loop is stopped. Must be called from within a Tokio
    /// runtime.
    pub async fn start(&self) {
        if !self.shared.transition(LoopState::Stopped, LoopState::Starting) {
            debug!(
                loop_name = %self.shared.name,
                state = %self.state(),
                "Process loop not stopped, ignoring start"
            );
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (started_tx, started_rx) = oneshot::channel();
        let span = info_span!("process_loop", name = %self.shared.name);
        let handle = tokio::spawn(
            run_worker(self.shared.clone(), shutdown_rx, started_tx).instrument(span),
        );
        *self.run_handle() = Some(RunHandle {
            shutdown_tx,
            handle,
        });

        let _ = started_rx.await;
    }

    /// Ask the worker to exit after its current cycle and wait for it, at
    /// most `shutdown_timeout`.
    ///
    /// Never fails. If the timeout elapses first the worker keeps finishing
    /// its cycle in the background and the loop reports `Stopping` until it
    /// does.
    pub async fn stop(&self) {
        let run = self.run_handle().take();
        let Some(RunHandle {
            shutdown_tx,
            handle,
        }) = run
        else {
            debug!(loop_name = %self.shared.name, "Process loop not running, ignoring stop");
            return;
        };

        if !self.shared.transition(LoopState::Running, LoopState::Stopping) {
            self.shared
                .transition(LoopState::Starting, LoopState::Stopping);
        }
        let _ = shutdown_tx.send(true);

        match tokio::time::timeout(self.shared.shutdown_timeout, handle).await {
            Ok(Ok(())) => {
                debug!(loop_name = %self.shared.name, "Process loop worker joined");
            }
            Ok(Err(e)) => {
                error!(loop_name = %self.shared.name, error = %e, "Process loop worker failed");
            }
            Err(_) => {
                warn!(
                    loop_name = %self.shared.name,
                    timeout_ms = self.shared.shutdown_timeout.as_millis() as u64,
                    "Process loop did not stop within shutdown timeout, worker still finishing its cycle"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::EntitiesProcessor;

    fn idle_loop() -> ProcessLoop {
        ProcessLoop::builder()
            .name("idle")
            .processor(EntitiesProcessor::new(
                || async { Ok(Vec::<u32>::new()) },
                |_n: u32| async { Ok(true) },
            ))
            .wait_strategy(FixedWaitStrategy::new(5))
            .shutdown_timeout(Duration::from_secs(1))
            .build()
    }

    #[test]
    fn test_builder_defaults() {
        let process_loop = ProcessLoopBuilder::new().build();
        assert_eq!(process_loop.name(), "process-loop");
        assert_eq!(process_loop.state(), LoopState::Stopped);
        assert_eq!(process_loop.shutdown_timeout(), DEFAULT_SHUTDOWN_TIMEOUT);
        assert!(!process_loop.is_active());
        assert_eq!(process_loop.stats(), LoopStatsSnapshot::default());
    }

    #[test]
    fn test_loop_state_display_and_round_trip() {
        for state in [
            LoopState::Stopped,
            LoopState::Starting,
            LoopState::Running,
            LoopState::Stopping,
        ] {
            assert_eq!(LoopState::from_u8(state as u8), state);
        }
        assert_eq!(LoopState::Running.to_string(), "running");
        assert_eq!(LoopState::from_u8(42), LoopState::Stopped);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let process_loop = idle_loop();

        process_loop.start().await;
        assert!(process_loop.is_active());

        process_loop.stop().await;
        assert_eq!(process_loop.state(), LoopState::Stopped);
        assert!(!process_loop.is_active());
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let process_loop = idle_loop();
        process_loop.stop().await;
        assert_eq!(process_loop.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn test_loop_can_be_restarted() {
        let process_loop = idle_loop();

        process_loop.start().await;
        process_loop.stop().await;
        process_loop.start().await;
        assert!(process_loop.is_active());

        process_loop.stop().await;
        assert!(!process_loop.is_active());
    }

    #[tokio::test]
    async fn test_dropping_loop_stops_worker() {
        let process_loop = idle_loop();
        process_loop.start().await;
        let shared = process_loop.shared.clone();

        drop(process_loop);

        tokio::time::timeout(Duration::from_secs(1), async {
            while LoopState::from_u8(shared.state.load(Ordering::Acquire)) != LoopState::Stopped {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker should exit once the loop is dropped");
    }
}
