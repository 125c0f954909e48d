//! Uniform interface over the two session engines, and the retry policy.
//!
//! The router owns the one piece of logic that decides what a failed run is
//! allowed to cost: at most one extra attempt, and never a blind replay of
//! side effects. Classification comes from the engines; the policy here only
//! matches on it together with what the attempt was observed doing.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use tether_driver::{DriverId, UsageStats};

use crate::error::{Error, Result};
use crate::gate::{ProcessingGuard, StopSignal};
use crate::preferences::PreferenceStore;
use crate::stream::{ObservingSink, RunObservation, StatusSink};

/// One retry per logical run. Surfacing a failure is preferred over risking
/// a duplicated side effect.
const MAX_RETRIES: u32 = 1;

/// What kind of caller started the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOrigin {
    Interactive,
    Deferred,
    Scheduled,
}

#[derive(Debug, Clone)]
pub struct RunInput {
    pub message: String,
    pub conversation_id: i64,
    pub sender: String,
    pub origin: RunOrigin,
}

/// Point-in-time view of one engine, for status surfaces.
#[derive(Debug, Clone)]
pub struct DriverStatus {
    pub driver: DriverId,
    pub display_name: String,
    pub is_active: bool,
    pub resume_handle: Option<String>,
    pub title: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_usage: Option<UsageStats>,
}

/// Router-facing surface of one session engine.
#[async_trait]
pub trait Driver: Send + Sync {
    fn id(&self) -> DriverId;
    fn display_name(&self) -> &str;
    async fn run_message(&self, input: RunInput, sink: Arc<dyn StatusSink>) -> Result<String>;
    async fn stop(&self) -> StopSignal;
    /// Discard the resumable handle. Only called when a reset is safe.
    async fn kill(&self);
    /// Running, or parked in the pre-query processing phase.
    fn is_busy(&self) -> bool;
    fn begin_processing(&self) -> ProcessingGuard;
    fn status(&self) -> DriverStatus;
}

/// Rewritten first line of a retry after a stall that had already invoked a
/// tool: pick up where things left off without replaying side effects.
pub fn continue_safely_prompt(original: &str) -> String {
    format!(
        "The previous attempt's event stream stalled mid-task after tool activity. \
         Continue the task from its current state. Do not blindly repeat side-effecting \
         operations; check what already happened before redoing anything.\n\n\
         Original request:\n{original}"
    )
}

/// Rewritten retry after a stall that followed spawn orchestration: the
/// backend must audit what it already launched before touching anything.
pub fn audit_spawned_work_prompt(original: &str) -> String {
    format!(
        "The previous attempt's event stream stalled after spawn orchestration activity. \
         Before taking any further side-effecting action, audit what already happened: \
         list the sub-agents that are already running (for example with `agentctl list`) \
         and reconcile them against the request. Continue from that state without \
         re-spawning anything that already exists.\n\n\
         Original request:\n{original}"
    )
}

enum RetryDecision {
    ResetAndRetry,
    RecoverWithPrompt { audit_spawned: bool },
    Propagate,
}

fn retry_decision(err: &Error, observation: &RunObservation) -> RetryDecision {
    if err.is_stall() {
        if observation.saw_tool_use() {
            RetryDecision::RecoverWithPrompt {
                audit_spawned: observation.saw_spawn_orchestration(),
            }
        } else {
            // Nothing side-effecting ran; a fresh session is free.
            RetryDecision::ResetAndRetry
        }
    } else if err.is_crash() && !observation.saw_tool_use() {
        RetryDecision::ResetAndRetry
    } else {
        RetryDecision::Propagate
    }
}

/// Process-wide registry of the two engines, keyed by backend id. Engines
/// are explicit values handed in at construction; nothing here is ambient.
pub struct DriverRouter {
    claude: Arc<dyn Driver>,
    codex: Arc<dyn Driver>,
    prefs: Arc<PreferenceStore>,
}

impl DriverRouter {
    pub fn new(
        prefs: Arc<PreferenceStore>,
        claude: Arc<dyn Driver>,
        codex: Arc<dyn Driver>,
    ) -> Self {
        Self {
            claude,
            codex,
            prefs,
        }
    }

    pub fn driver(&self, id: DriverId) -> Arc<dyn Driver> {
        match id {
            DriverId::Claude => Arc::clone(&self.claude),
            DriverId::Codex => Arc::clone(&self.codex),
        }
    }

    pub fn active_id(&self) -> DriverId {
        self.prefs.active_driver()
    }

    pub fn active(&self) -> Arc<dyn Driver> {
        self.driver(self.active_id())
    }

    pub fn is_any_running(&self) -> bool {
        self.claude.is_busy() || self.codex.is_busy()
    }

    /// Stop the active driver's work; when it has nothing to stop, try the
    /// other one: a background run may still be finishing on the backend
    /// the operator just switched away from.
    pub async fn stop_active_query(&self) -> StopSignal {
        let active = self.active();
        let signal = active.stop().await;
        if signal.delivered() {
            return signal;
        }
        self.driver(active.id().other()).stop().await
    }

    /// Run one logical message through a driver, absorbing at most one
    /// stall/crash per the recovery policy.
    pub async fn run_message(
        &self,
        id: DriverId,
        input: RunInput,
        sink: Arc<dyn StatusSink>,
    ) -> Result<String> {
        let driver = self.driver(id);
        let original_message = input.message.clone();
        let mut message = original_message.clone();
        let mut attempt: u32 = 0;

        loop {
            let observation = Arc::new(RunObservation::default());
            let attempt_sink: Arc<dyn StatusSink> = Arc::new(ObservingSink::new(
                Arc::clone(&sink),
                Arc::clone(&observation),
            ));
            let attempt_input = RunInput {
                message: message.clone(),
                ..input.clone()
            };

            let err = match driver.run_message(attempt_input, attempt_sink).await {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            if attempt >= MAX_RETRIES {
                return Err(err);
            }
            match retry_decision(&err, &observation) {
                RetryDecision::ResetAndRetry => {
                    warn!(
                        driver = %id,
                        error = %err,
                        "run failed with no tool activity; resetting session for retry"
                    );
                    driver.kill().await;
                    message.clone_from(&original_message);
                }
                RetryDecision::RecoverWithPrompt { audit_spawned } => {
                    warn!(
                        driver = %id,
                        audit_spawned,
                        "stream stalled mid-task after tool activity; retrying with recovery prompt"
                    );
                    message = if audit_spawned {
                        audit_spawned_work_prompt(&original_message)
                    } else {
                        continue_safely_prompt(&original_message)
                    };
                }
                RetryDecision::Propagate => return Err(err),
            }
            attempt += 1;
        }
    }
}
