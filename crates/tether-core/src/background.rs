//! Arbitration between scheduled background work and the operator.
//!
//! Any non-interactive run is bracketed by [`BackgroundRunCoordinator::begin`],
//! which keeps a reentrant depth counter. Interactive entry points consult
//! the coordinator before proceeding: if background work is underway it is
//! cancelled, and the `preempted` flag stays raised until every bracketed
//! run has unwound so the background path can tell a preemption apart from
//! an ordinary failure. Background work never cancels interactive work.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::router::DriverRouter;

#[derive(Debug, Default)]
struct CoordinatorInner {
    depth: u32,
    preempted: bool,
}

#[derive(Debug, Default)]
pub struct BackgroundRunCoordinator {
    inner: Mutex<CoordinatorInner>,
}

impl BackgroundRunCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bracket a background run. Nested brackets are counted; the
    /// `preempted` flag survives until the outermost guard drops.
    pub fn begin(self: &Arc<Self>) -> BackgroundRunGuard {
        let mut inner = self.lock();
        inner.depth += 1;
        BackgroundRunGuard {
            coordinator: Arc::clone(self),
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock().depth > 0
    }

    /// Raised by a preemption and held until background depth returns to
    /// zero, so an unwinding background run can see why it was cancelled.
    pub fn was_preempted(&self) -> bool {
        self.lock().preempted
    }

    /// Give the operator priority over any active background work.
    ///
    /// When background runs are in flight, marks them preempted and stops
    /// whichever backend is currently busy, falling back to the other one
    /// through the router. Returns whether a stop signal was actually
    /// delivered; with no background work active this is a no-op.
    pub async fn preempt_for_user_priority(&self, router: &DriverRouter) -> bool {
        {
            let mut inner = self.lock();
            if inner.depth == 0 {
                return false;
            }
            inner.preempted = true;
        }
        let signal = router.stop_active_query().await;
        if signal.delivered() {
            info!("interactive input preempted background work");
        } else {
            // Depth was positive but nothing was cancellable yet; the run
            // will observe the preempted flag at its next checkpoint.
            debug!("preemption requested but no query was stoppable");
        }
        signal.delivered()
    }

    fn end(&self) {
        let mut inner = self.lock();
        inner.depth = inner.depth.saturating_sub(1);
        if inner.depth == 0 {
            inner.preempted = false;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CoordinatorInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// RAII bracket for one background run.
#[derive(Debug)]
pub struct BackgroundRunGuard {
    coordinator: Arc<BackgroundRunCoordinator>,
}

impl Drop for BackgroundRunGuard {
    fn drop(&mut self) {
        self.coordinator.end();
    }
}
