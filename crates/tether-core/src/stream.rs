//! Streaming event state machine.
//!
//! Consumes one backend call's event stream, racing every `next()` against a
//! stall timer whose length depends on whether a tool is currently executing.
//! Output is segmented: a contiguous span of text between tool invocations is
//! one segment, and segment ids strictly increase within a run. Partial text
//! is pushed at most once per throttle interval, and whatever is buffered
//! when a stall fires is still flushed as a final segment.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tether_driver::{BackendEvent, DriverError, EventStream, UsageStats};

use crate::config::StreamConfig;

/// One status update delivered to the caller, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    Thinking {
        text: String,
    },
    ToolInvocation {
        name: String,
        rendered_status: String,
    },
    TextDelta {
        segment_id: u64,
        text: String,
    },
    SegmentEnd {
        segment_id: u64,
        text: String,
    },
    Done {
        usage: Option<UsageStats>,
    },
}

/// Caller-supplied receiver for status updates. Rendering and transport are
/// the caller's problem; the engine only guarantees ordering.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn update(&self, update: StatusUpdate);
}

/// Sink that swallows everything. Background runs that should stay silent
/// use this directly.
pub struct NullSink;

#[async_trait]
impl StatusSink for NullSink {
    async fn update(&self, _update: StatusUpdate) {}
}

/// The front-end, seen from the engine's side: it can mint a status sink
/// for a conversation and deliver a one-off notification. Rendering and the
/// transport behind it are entirely out of scope here.
#[async_trait]
pub trait FrontendBridge: Send + Sync {
    fn sink(&self, conversation_id: i64, silent: bool) -> Arc<dyn StatusSink>;
    async fn notify(&self, conversation_id: i64, text: String);
}

/// What one run attempt was seen doing, shared between the stream consumer
/// and the retry policy.
#[derive(Debug, Default)]
pub struct RunObservation {
    saw_tool_use: AtomicBool,
    saw_spawn_orchestration: AtomicBool,
}

impl RunObservation {
    pub fn record_tool_status(&self, rendered_status: &str) {
        self.saw_tool_use.store(true, Ordering::Relaxed);
        if is_spawn_orchestration_status(rendered_status) {
            self.saw_spawn_orchestration.store(true, Ordering::Relaxed);
        }
    }

    pub fn saw_tool_use(&self) -> bool {
        self.saw_tool_use.load(Ordering::Relaxed)
    }

    pub fn saw_spawn_orchestration(&self) -> bool {
        self.saw_spawn_orchestration.load(Ordering::Relaxed)
    }
}

/// Recognize tool activity that just orchestrated sub-agent spawns. After a
/// stall, replaying such a run blindly would double-launch work, so the
/// retry policy treats these runs specially.
pub fn is_spawn_orchestration_status(rendered_status: &str) -> bool {
    let normalized = rendered_status
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    if !normalized.contains("spawn") {
        return false;
    }
    normalized.contains("agentctl") || normalized.contains("/ctl") || normalized.contains(" ctl ")
}

/// Wraps a caller sink so every attempt records tool activity into its
/// [`RunObservation`] before forwarding.
pub struct ObservingSink {
    inner: Arc<dyn StatusSink>,
    observation: Arc<RunObservation>,
}

impl ObservingSink {
    pub fn new(inner: Arc<dyn StatusSink>, observation: Arc<RunObservation>) -> Self {
        Self { inner, observation }
    }
}

#[async_trait]
impl StatusSink for ObservingSink {
    async fn update(&self, update: StatusUpdate) {
        if let StatusUpdate::ToolInvocation {
            rendered_status, ..
        } = &update
        {
            self.observation.record_tool_status(rendered_status);
        }
        self.inner.update(update).await;
    }
}

/// Engine-side observers for events that matter mid-stream.
///
/// `handle_received` fires the moment the backend announces its resume
/// handle, so it can hit disk before a later crash loses it. `tool_invoked`
/// fires after a tool status is forwarded, giving the engine a chance to
/// service side-channel request files the tool just wrote.
#[async_trait]
pub trait RunHooks: Send + Sync {
    async fn tool_invoked(&self, _name: &str) {}
    fn handle_received(&self, _handle: &str) {}
}

/// Result of consuming one backend stream to its end, stall, or teardown.
#[derive(Debug, Default)]
pub struct StreamOutcome {
    pub response_text: String,
    pub usage: Option<UsageStats>,
    pub resume_handle: Option<String>,
    /// The backend signalled logical completion (`Done`).
    pub completed: bool,
    /// The stall timer won the race; the token has been cancelled.
    pub stalled: bool,
    /// Which patience window was active when the stall fired.
    pub stall_timeout_ms: u64,
}

pub struct StreamEventProcessor {
    config: StreamConfig,
}

impl StreamEventProcessor {
    pub fn new(config: StreamConfig) -> Self {
        Self { config }
    }

    /// Drive the stream to completion, stall, or teardown.
    ///
    /// Stream errors before completion propagate; errors after `Done` are
    /// late noise from a backend that already succeeded and are downgraded
    /// to a warning. An aborted stream with the token already cancelled is
    /// an expected teardown, not a failure.
    pub async fn consume(
        &self,
        mut stream: EventStream,
        sink: &dyn StatusSink,
        cancel: &CancellationToken,
        hooks: Option<&dyn RunHooks>,
    ) -> Result<StreamOutcome, DriverError> {
        let mut outcome = StreamOutcome::default();
        let mut segment_id: u64 = 0;
        let mut segment_text = String::new();
        let mut tool_active = false;
        // Throttling only spaces out pushes after the first one.
        let mut last_flush: Option<Instant> = None;

        loop {
            let patience = if tool_active {
                self.config.tool_active_stall_timeout
            } else {
                self.config.idle_stall_timeout
            };

            let next = tokio::select! {
                biased;
                next = stream.next() => next,
                () = tokio::time::sleep(patience) => {
                    outcome.stalled = true;
                    outcome.stall_timeout_ms = patience.as_millis() as u64;
                    warn!(
                        timeout_ms = outcome.stall_timeout_ms,
                        tool_active, "event stream stalled; cancelling and flushing partial output"
                    );
                    cancel.cancel();
                    break;
                }
            };

            let Some(event) = next else {
                break;
            };

            let event = match event {
                Ok(event) => event,
                Err(DriverError::Aborted) if cancel.is_cancelled() => {
                    debug!("backend stream torn down after cancellation");
                    break;
                }
                Err(err) if outcome.completed => {
                    // Transport noise after semantic success must not look
                    // like a broken run.
                    warn!(error = %err, "suppressed post-completion backend error");
                    break;
                }
                Err(err) => return Err(err),
            };

            match event {
                BackendEvent::Thinking { text } => {
                    tool_active = false;
                    if !text.is_empty() {
                        sink.update(StatusUpdate::Thinking { text }).await;
                    }
                }
                BackendEvent::Tool {
                    name,
                    rendered_status,
                } => {
                    tool_active = true;
                    if !segment_text.is_empty() {
                        sink.update(StatusUpdate::SegmentEnd {
                            segment_id,
                            text: segment_text.clone(),
                        })
                        .await;
                        segment_id += 1;
                        segment_text.clear();
                    }
                    sink.update(StatusUpdate::ToolInvocation {
                        name: name.clone(),
                        rendered_status,
                    })
                    .await;
                    if let Some(hooks) = hooks {
                        hooks.tool_invoked(&name).await;
                    }
                }
                BackendEvent::Text { text } => {
                    tool_active = false;
                    segment_text.push_str(&text);
                    outcome.response_text.push_str(&text);
                    let now = Instant::now();
                    let throttled = last_flush
                        .is_some_and(|at| now.duration_since(at) < self.config.delta_throttle);
                    if !throttled && segment_text.len() > self.config.min_delta_len {
                        sink.update(StatusUpdate::TextDelta {
                            segment_id,
                            text: segment_text.clone(),
                        })
                        .await;
                        last_flush = Some(now);
                    }
                }
                BackendEvent::SessionHandle { handle } => {
                    tool_active = false;
                    if let Some(hooks) = hooks {
                        hooks.handle_received(&handle);
                    }
                    outcome.resume_handle = Some(handle);
                }
                BackendEvent::Done { usage } => {
                    outcome.completed = true;
                    outcome.usage = usage;
                    break;
                }
            }
        }

        // The current segment is emitted even on a stall; buffered text is
        // never discarded.
        if !segment_text.is_empty() {
            sink.update(StatusUpdate::SegmentEnd {
                segment_id,
                text: segment_text,
            })
            .await;
        }
        if outcome.completed {
            sink.update(StatusUpdate::Done {
                usage: outcome.usage,
            })
            .await;
        }

        Ok(outcome)
    }
}
