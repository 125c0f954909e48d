//! Session engine: one backend's resumable conversation, gated to a single
//! run in flight.
//!
//! There are exactly two instances of this type, one per backend; they share
//! the preference store and nothing else. Handles are opaque and never cross
//! engines. The engine classifies its backend's failures into the crate
//! error taxonomy at the boundary so the router's policy can match on
//! variants instead of error text.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use tether_driver::{AgentBackend, DriverError, DriverId, EffortLevel, SendOptions, UsageStats};

use crate::config::{CorePaths, StreamConfig};
use crate::error::{self, Error, Result, looks_like_quota};
use crate::gate::{ProcessingGuard, RunGate, RunPhase, StopSignal};
use crate::preferences::PreferenceStore;
use crate::router::{Driver, DriverStatus, RunInput};
use crate::sessions::{SavedSession, SessionFileStore};
use crate::sidechannel::{self, ControlTarget};
use crate::stream::{RunHooks, StatusSink, StreamEventProcessor};

/// Tool-name prefix of the backend's host-control tool. Invocations trigger
/// a side-channel sweep for remote-control request files.
const CONTROL_TOOL_PREFIX: &str = "control__";

/// Conversation titles keep roughly the first line of the first message.
const TITLE_MAX_LEN: usize = 50;

#[derive(Debug, Clone, Copy)]
pub struct ModelInfo {
    pub value: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
}

/// Static description of one backend: identity, model catalog, and the
/// error text its CLI emits when it dies.
#[derive(Debug, Clone)]
pub struct BackendProfile {
    pub id: DriverId,
    pub display_name: &'static str,
    pub default_model: &'static str,
    pub models: Vec<ModelInfo>,
    pub crash_patterns: Vec<&'static str>,
}

impl BackendProfile {
    pub fn claude() -> Self {
        Self {
            id: DriverId::Claude,
            display_name: "Claude",
            default_model: "claude-opus-4",
            models: vec![
                ModelInfo {
                    value: "claude-opus-4",
                    display_name: "Opus 4",
                    description: "Most capable for complex work",
                },
                ModelInfo {
                    value: "claude-sonnet-4",
                    display_name: "Sonnet 4",
                    description: "Best for everyday tasks",
                },
                ModelInfo {
                    value: "claude-haiku-4",
                    display_name: "Haiku 4",
                    description: "Fastest for quick answers",
                },
            ],
            crash_patterns: vec!["exited with code"],
        }
    }

    pub fn codex() -> Self {
        Self {
            id: DriverId::Codex,
            display_name: "Codex",
            default_model: "gpt-5-codex",
            models: vec![
                ModelInfo {
                    value: "gpt-5-codex",
                    display_name: "GPT-5 Codex",
                    description: "Agentic coding default",
                },
                ModelInfo {
                    value: "gpt-5",
                    display_name: "GPT-5",
                    description: "General reasoning",
                },
            ],
            crash_patterns: vec!["exited with code", "stream disconnected"],
        }
    }

    /// Look a model up by value or display name, case-insensitively.
    pub fn model_info(&self, value_or_name: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|m| {
            m.value == value_or_name || m.display_name.eq_ignore_ascii_case(value_or_name)
        })
    }
}

#[derive(Debug, Default)]
struct EngineState {
    resume_handle: Option<String>,
    title: Option<String>,
    last_message: Option<String>,
    last_activity: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
    last_usage: Option<UsageStats>,
}

pub struct SessionEngine {
    profile: BackendProfile,
    backend: Arc<dyn AgentBackend>,
    gate: Arc<RunGate>,
    store: SessionFileStore,
    prefs: Arc<PreferenceStore>,
    stream_config: StreamConfig,
    spool_dir: PathBuf,
    state: Mutex<EngineState>,
}

fn truncate_title(message: &str) -> String {
    let first_line = message.lines().next().unwrap_or_default();
    if first_line.chars().count() <= TITLE_MAX_LEN {
        return first_line.to_string();
    }
    let kept: String = first_line.chars().take(TITLE_MAX_LEN - 3).collect();
    format!("{kept}...")
}

fn date_prefix(now: DateTime<Utc>) -> String {
    // Parseable, human-shaped, and injected only on the first message of a
    // session so the backend needn't call a tool to learn the date.
    format!(
        "[Current date/time: {}]\n\n",
        now.format("%A, %B %-d, %Y %H:%M UTC")
    )
}

fn short_handle(handle: &str) -> &str {
    handle.get(..8).unwrap_or(handle)
}

impl SessionEngine {
    pub fn new(
        profile: BackendProfile,
        backend: Arc<dyn AgentBackend>,
        prefs: Arc<PreferenceStore>,
        paths: &CorePaths,
        stream_config: StreamConfig,
    ) -> Arc<Self> {
        let sessions_file = paths
            .sessions_file
            .with_file_name(format!("sessions-{}.json", profile.id));
        Arc::new(Self {
            store: SessionFileStore::new(sessions_file, &paths.workspace_dir),
            spool_dir: paths.spool_dir.clone(),
            gate: Arc::new(RunGate::new()),
            backend,
            prefs,
            stream_config,
            profile,
            state: Mutex::new(EngineState::default()),
        })
    }

    pub fn profile(&self) -> &BackendProfile {
        &self.profile
    }

    pub fn gate(&self) -> &Arc<RunGate> {
        &self.gate
    }

    /// The model this engine will use: the preferred one when it belongs to
    /// this backend's catalog, its default otherwise.
    pub fn model(&self) -> String {
        match self.prefs.model() {
            Some(preferred) if self.profile.model_info(&preferred).is_some() => preferred,
            _ => self.profile.default_model.to_string(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock_state().resume_handle.is_some()
    }

    pub fn session_list(&self) -> Vec<SavedSession> {
        self.store.list()
    }

    /// Point the engine at a saved session.
    pub fn resume_saved(&self, handle_or_prefix: &str) -> Result<SavedSession> {
        let session = self.store.find(handle_or_prefix).ok_or_else(|| {
            Error::NotFound(format!("no saved session matching \"{handle_or_prefix}\""))
        })?;
        let mut state = self.lock_state();
        state.resume_handle = Some(session.handle.clone());
        state.title = Some(session.title.clone());
        state.last_activity = Some(Utc::now());
        info!(
            driver = %self.profile.id,
            handle = short_handle(&session.handle),
            title = %session.title,
            "resumed saved session"
        );
        Ok(session)
    }

    async fn send(&self, input: RunInput, sink: Arc<dyn StatusSink>) -> Result<String> {
        // Check-and-set in one step; a second caller fails instead of
        // resuming the same session concurrently.
        let guard = self.gate.acquire_or_fail()?;

        // A stop that arrived during the processing phase bails here,
        // before the backend call.
        if self.gate.take_stop_requested() {
            debug!(driver = %self.profile.id, "run cancelled before the backend call");
            guard.finish(RunPhase::Cancelled);
            return Err(Error::Cancelled);
        }

        let (is_new_session, resume_handle) = {
            let mut state = self.lock_state();
            let resume_handle = state.resume_handle.clone();
            let is_new_session = resume_handle.is_none();
            state.last_message = Some(input.message.clone());
            if is_new_session && state.title.is_none() {
                state.title = Some(truncate_title(&input.message));
            }
            (is_new_session, resume_handle)
        };

        let model = self.model();
        let effort = self.prefs.effort();
        let prompt = if is_new_session {
            info!(driver = %self.profile.id, %model, %effort, "starting new session");
            format!("{}{}", date_prefix(Utc::now()), input.message)
        } else {
            if let Some(handle) = &resume_handle {
                info!(
                    driver = %self.profile.id,
                    handle = short_handle(handle),
                    %model,
                    %effort,
                    "resuming session"
                );
            }
            input.message.clone()
        };

        let options = SendOptions {
            resume_handle,
            model,
            effort,
            system_prompt: None,
        };
        let cancel = guard.cancel_token();

        let stream = match self.backend.send(&prompt, options, cancel.clone()).await {
            Ok(stream) => stream,
            Err(err) => {
                let err = self.classify(err);
                self.record_error(&err);
                guard.finish(RunPhase::Crashed);
                return Err(err);
            }
        };
        guard.mark_running();

        let hooks = EngineRunHooks {
            engine: self,
            conversation_id: input.conversation_id,
        };
        let processor = StreamEventProcessor::new(self.stream_config.clone());
        let outcome = match processor
            .consume(stream, sink.as_ref(), &cancel, Some(&hooks))
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                let err = self.classify(err);
                if err.is_cancellation() {
                    guard.finish(RunPhase::Cancelled);
                    return Err(Error::Cancelled);
                }
                self.record_error(&err);
                guard.finish(RunPhase::Crashed);
                return Err(err);
            }
        };

        if let Some(usage) = outcome.usage {
            let mut state = self.lock_state();
            state.last_usage = Some(usage);
            debug!(
                driver = %self.profile.id,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                cache_read = usage.cache_read_input_tokens,
                "usage captured"
            );
        }

        if outcome.stalled && !outcome.completed {
            let err = Error::Stall {
                timeout_ms: outcome.stall_timeout_ms,
            };
            self.record_error(&err);
            guard.finish(RunPhase::Stalled);
            return Err(err);
        }

        if !outcome.completed && cancel.is_cancelled() {
            // Operator stop mid-stream: whatever already streamed stands,
            // and the stop itself is not an error.
            debug!(driver = %self.profile.id, "run stopped by request; keeping partial output");
            guard.finish(RunPhase::Cancelled);
            let mut state = self.lock_state();
            state.last_activity = Some(Utc::now());
            return Ok(self.final_text(outcome.response_text));
        }

        // A completed run that produced nothing and consumed nothing means
        // the resumed handle went stale on the backend side.
        if outcome.completed
            && outcome.response_text.is_empty()
            && outcome.usage.is_some_and(|usage| usage.is_empty())
        {
            warn!(
                driver = %self.profile.id,
                "empty completion from resumed session; clearing handle"
            );
            self.lock_state().resume_handle = None;
            let err = Error::Crash {
                message: "empty completion from stale session".to_string(),
            };
            self.record_error(&err);
            guard.finish(RunPhase::Crashed);
            return Err(err);
        }

        {
            let mut state = self.lock_state();
            state.last_activity = Some(Utc::now());
            state.last_error = None;
            state.last_error_at = None;
        }
        guard.finish(RunPhase::Completed);
        Ok(self.final_text(outcome.response_text))
    }

    fn final_text(&self, response_text: String) -> String {
        if response_text.is_empty() {
            format!("No response from {}.", self.profile.display_name)
        } else {
            response_text
        }
    }

    fn classify(&self, err: DriverError) -> Error {
        match err {
            DriverError::Aborted => Error::Cancelled,
            other => {
                let text = other.to_string();
                if looks_like_quota(&text) {
                    Error::QuotaOrLimit { message: text }
                } else if self
                    .profile
                    .crash_patterns
                    .iter()
                    .any(|pattern| text.contains(pattern))
                {
                    Error::Crash { message: text }
                } else {
                    Error::Driver(other)
                }
            }
        }
    }

    fn record_error(&self, err: &Error) {
        let mut state = self.lock_state();
        state.last_error = Some(error::summarize(err, 100));
        state.last_error_at = Some(Utc::now());
    }

    /// Persist a newly announced handle right away; a crash after this
    /// point must not lose the ability to resume.
    fn adopt_handle(&self, handle: &str) {
        let title = {
            let mut state = self.lock_state();
            if state.resume_handle.as_deref() == Some(handle) {
                return;
            }
            state.resume_handle = Some(handle.to_string());
            state
                .title
                .clone()
                .unwrap_or_else(|| "Untitled session".to_string())
        };
        self.store.record(handle, &title);
        info!(
            driver = %self.profile.id,
            handle = short_handle(handle),
            "captured session handle"
        );
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

struct EngineRunHooks<'a> {
    engine: &'a SessionEngine,
    conversation_id: i64,
}

#[async_trait]
impl RunHooks for EngineRunHooks<'_> {
    async fn tool_invoked(&self, name: &str) {
        if name.starts_with(CONTROL_TOOL_PREFIX) {
            sidechannel::settle_and_fulfill_control_requests(
                &self.engine.spool_dir,
                self.engine,
                self.conversation_id,
            )
            .await;
        }
    }

    fn handle_received(&self, handle: &str) {
        self.engine.adopt_handle(handle);
    }
}

#[async_trait]
impl Driver for SessionEngine {
    fn id(&self) -> DriverId {
        self.profile.id
    }

    fn display_name(&self) -> &str {
        self.profile.display_name
    }

    async fn run_message(&self, input: RunInput, sink: Arc<dyn StatusSink>) -> Result<String> {
        self.send(input, sink).await
    }

    async fn stop(&self) -> StopSignal {
        self.gate.stop()
    }

    async fn kill(&self) {
        let mut state = self.lock_state();
        state.resume_handle = None;
        state.last_activity = None;
        state.title = None;
        info!(driver = %self.profile.id, "session cleared");
    }

    fn is_busy(&self) -> bool {
        self.gate.is_busy()
    }

    fn begin_processing(&self) -> ProcessingGuard {
        self.gate.begin_processing()
    }

    fn status(&self) -> DriverStatus {
        let state = self.lock_state();
        DriverStatus {
            driver: self.profile.id,
            display_name: self.profile.display_name.to_string(),
            is_active: state.resume_handle.is_some(),
            resume_handle: state.resume_handle.clone(),
            title: state.title.clone(),
            last_activity: state.last_activity,
            last_error: state.last_error.clone(),
            last_error_at: state.last_error_at,
            last_usage: state.last_usage,
        }
    }
}

#[async_trait]
impl ControlTarget for SessionEngine {
    fn usage_summary(&self) -> String {
        let state = self.lock_state();
        let mut lines = vec![format!(
            "{}: model={}, effort={}",
            self.profile.display_name,
            self.model(),
            self.prefs.effort()
        )];
        match state.last_usage {
            Some(usage) => lines.push(format!(
                "Last run: in={} out={} cache_read={} cache_create={}",
                usage.input_tokens,
                usage.output_tokens,
                usage.cache_read_input_tokens,
                usage.cache_creation_input_tokens
            )),
            None => lines.push("No usage recorded yet.".to_string()),
        }
        lines.join("\n")
    }

    fn switch_model(&self, model: Option<&str>, effort: Option<&str>) -> String {
        if let Some(requested) = model {
            let Some(info) = self.profile.model_info(requested) else {
                let valid = self
                    .profile
                    .models
                    .iter()
                    .map(|m| format!("{} ({})", m.display_name, m.value))
                    .collect::<Vec<_>>()
                    .join(", ");
                return format!("Unknown model \"{requested}\". Available: {valid}");
            };
            self.prefs.set_model(info.value);
        }
        if let Some(requested) = effort {
            let Ok(level) = requested.to_lowercase().parse::<EffortLevel>() else {
                return format!("Invalid effort \"{requested}\". Use: low, medium, high");
            };
            self.prefs.set_effort(level);
        }
        let display = self
            .profile
            .model_info(&self.model())
            .map_or_else(|| self.model(), |m| m.display_name.to_string());
        format!(
            "Now using: {display}, effort: {}",
            self.prefs.effort()
        )
    }

    async fn reset_session(&self) -> String {
        self.gate.stop();
        Driver::kill(self).await;
        "Session cleared. Next message will start a fresh session.".to_string()
    }

    fn list_sessions(&self) -> String {
        let sessions = self.session_list();
        if sessions.is_empty() {
            return "No saved sessions.".to_string();
        }
        sessions
            .iter()
            .enumerate()
            .map(|(index, s)| {
                format!(
                    "{}. \"{}\" ({}) - {}...",
                    index + 1,
                    s.title,
                    s.saved_at.format("%b %-d %H:%M"),
                    short_handle(&s.handle)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn resume_session(&self, handle_or_prefix: &str) -> String {
        match self.resume_saved(handle_or_prefix) {
            Ok(session) => format!("Resumed: \"{}\"", session.title),
            Err(err) => format!("Failed: {err}"),
        }
    }
}
