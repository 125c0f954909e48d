//! Single-flight run gate, one per backend engine.
//!
//! The check and the set happen under one lock acquisition with no await
//! point in between, so two concurrent callers can never both observe "not
//! running" and proceed. Cancellation is cooperative: the gate owns the
//! current run's token and `stop()` fires it.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Outcome of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// A query was actively running and has been told to cancel.
    Stopped,
    /// Processing had started but no query was in flight yet; the run will
    /// bail at its first cancellation checkpoint.
    Pending,
    /// Nothing to stop.
    Idle,
}

impl StopSignal {
    pub fn delivered(self) -> bool {
        !matches!(self, StopSignal::Idle)
    }
}

/// Lifecycle of the gated run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    /// Gate acquired, backend call not yet issued.
    Starting,
    Running,
    Completed,
    Cancelled,
    Stalled,
    Crashed,
}

impl RunPhase {
    fn is_in_flight(self) -> bool {
        matches!(self, RunPhase::Starting | RunPhase::Running)
    }
}

#[derive(Debug)]
struct GateInner {
    phase: RunPhase,
    last_outcome: RunPhase,
    stop_requested: bool,
    processing: u32,
    cancel: Option<CancellationToken>,
}

#[derive(Debug)]
pub struct RunGate {
    inner: Mutex<GateInner>,
}

impl Default for RunGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RunGate {
    fn lock(&self) -> std::sync::MutexGuard<'_, GateInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GateInner {
                phase: RunPhase::Idle,
                last_outcome: RunPhase::Idle,
                stop_requested: false,
                processing: 0,
                cancel: None,
            }),
        }
    }

    /// Acquire the gate or fail immediately with [`Error::RunInFlight`].
    ///
    /// Leaves any earlier `stop_requested` mark in place: a stop that raced
    /// ahead of the run must still be honored at the first checkpoint.
    pub fn acquire_or_fail(self: &Arc<Self>) -> Result<RunGuard> {
        let mut inner = self.lock();
        if inner.phase.is_in_flight() {
            return Err(Error::RunInFlight);
        }
        let cancel = CancellationToken::new();
        inner.phase = RunPhase::Starting;
        inner.cancel = Some(cancel.clone());
        Ok(RunGuard {
            gate: Arc::clone(self),
            cancel,
            finished: false,
        })
    }

    /// Request a cooperative stop of whatever is underway.
    pub fn stop(&self) -> StopSignal {
        let mut inner = self.lock();
        if inner.phase.is_in_flight() {
            if let Some(cancel) = &inner.cancel {
                inner.stop_requested = true;
                cancel.cancel();
                return StopSignal::Stopped;
            }
        }
        if inner.processing > 0 {
            inner.stop_requested = true;
            return StopSignal::Pending;
        }
        StopSignal::Idle
    }

    /// Mark the pre-query processing phase. The guard keeps `stop()`
    /// answering `Pending` until the query starts or the caller bails.
    pub fn begin_processing(self: &Arc<Self>) -> ProcessingGuard {
        let mut inner = self.lock();
        inner.processing += 1;
        ProcessingGuard {
            gate: Arc::clone(self),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().phase.is_in_flight()
    }

    /// Running, or parked in the processing phase ahead of a run.
    pub fn is_busy(&self) -> bool {
        let inner = self.lock();
        inner.phase.is_in_flight() || inner.processing > 0
    }

    /// Consume the stop mark. Returns whether a stop had been requested.
    pub fn take_stop_requested(&self) -> bool {
        let mut inner = self.lock();
        std::mem::take(&mut inner.stop_requested)
    }

    pub fn stop_was_requested(&self) -> bool {
        self.lock().stop_requested
    }

    pub fn last_outcome(&self) -> RunPhase {
        self.lock().last_outcome
    }

    fn record_finish(&self, outcome: RunPhase) {
        let mut inner = self.lock();
        inner.last_outcome = outcome;
        inner.phase = RunPhase::Idle;
        inner.stop_requested = false;
        inner.cancel = None;
    }

    fn mark_running(&self) {
        let mut inner = self.lock();
        if inner.phase == RunPhase::Starting {
            inner.phase = RunPhase::Running;
            // The pre-query checkpoint has passed; a stop from here on
            // belongs to this run and arrives through the token.
            inner.stop_requested = false;
        }
    }
}

/// Exclusive hold on the gate for one run attempt.
#[derive(Debug)]
pub struct RunGuard {
    gate: Arc<RunGate>,
    cancel: CancellationToken,
    finished: bool,
}

impl RunGuard {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Transition Starting → Running once the backend call is issued.
    pub fn mark_running(&self) {
        self.gate.mark_running();
    }

    /// Record the terminal phase and release the gate.
    pub fn finish(mut self, outcome: RunPhase) {
        self.finished = true;
        self.gate.record_finish(outcome);
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.finished {
            // A guard dropped without an explicit outcome means the run
            // unwound unexpectedly.
            self.gate.record_finish(RunPhase::Crashed);
        }
    }
}

#[derive(Debug)]
pub struct ProcessingGuard {
    gate: Arc<RunGate>,
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        let mut inner = self.gate.lock();
        inner.processing = inner.processing.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_with_nothing_running_is_idempotent() {
        let gate = Arc::new(RunGate::new());
        for _ in 0..3 {
            assert_eq!(gate.stop(), StopSignal::Idle);
        }
        assert!(!gate.stop_was_requested());
    }

    #[test]
    fn second_acquire_fails_while_first_holds_the_gate() {
        let gate = Arc::new(RunGate::new());
        let guard = gate.acquire_or_fail().expect("first acquire");
        assert!(matches!(gate.acquire_or_fail(), Err(Error::RunInFlight)));
        guard.finish(RunPhase::Completed);
        assert!(gate.acquire_or_fail().is_ok());
    }

    #[test]
    fn concurrent_acquires_admit_exactly_one_winner() {
        let gate = Arc::new(RunGate::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = Arc::clone(&gate);
            handles.push(std::thread::spawn(move || {
                gate.acquire_or_fail().map(|guard| {
                    // Hold long enough for every thread to attempt.
                    std::thread::sleep(std::time::Duration::from_millis(50));
                    guard.finish(RunPhase::Completed);
                })
            }));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .filter(Result::is_ok)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn stop_during_processing_is_pending_and_sticks() {
        let gate = Arc::new(RunGate::new());
        let processing = gate.begin_processing();
        assert_eq!(gate.stop(), StopSignal::Pending);
        assert!(gate.stop_was_requested());
        drop(processing);
        // The mark survives until consumed at the next checkpoint.
        assert!(gate.take_stop_requested());
        assert!(!gate.take_stop_requested());
    }

    #[test]
    fn stop_while_running_cancels_the_token() {
        let gate = Arc::new(RunGate::new());
        let guard = gate.acquire_or_fail().expect("acquire");
        guard.mark_running();
        let token = guard.cancel_token();
        assert_eq!(gate.stop(), StopSignal::Stopped);
        assert!(token.is_cancelled());
        guard.finish(RunPhase::Cancelled);
        assert_eq!(gate.last_outcome(), RunPhase::Cancelled);
        assert_eq!(gate.stop(), StopSignal::Idle);
    }

    #[test]
    fn mark_running_clears_a_consumed_pre_query_stop() {
        let gate = Arc::new(RunGate::new());
        let _processing = gate.begin_processing();
        assert_eq!(gate.stop(), StopSignal::Pending);
        let guard = gate.acquire_or_fail().expect("acquire");
        guard.mark_running();
        assert!(!gate.stop_was_requested());
        guard.finish(RunPhase::Completed);
    }

    #[test]
    fn dropped_guard_records_a_crash_outcome() {
        let gate = Arc::new(RunGate::new());
        {
            let guard = gate.acquire_or_fail().expect("acquire");
            guard.mark_running();
        }
        assert_eq!(gate.last_outcome(), RunPhase::Crashed);
        assert!(!gate.is_running());
    }
}
