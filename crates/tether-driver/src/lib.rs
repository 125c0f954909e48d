//! Backend-call contract shared by the Tether engine and its backends.
//!
//! A backend is one interchangeable agent implementation reachable as a
//! subprocess. This crate defines the event union a backend emits, the error
//! surface of the call itself, and the [`AgentBackend`] trait the engine
//! consumes. It deliberately excludes orchestration concerns: retries, stall
//! detection, and session bookkeeping all live in `tether-core`.

pub mod process;
pub mod wire;

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Identifier for one of the two agent backends.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DriverId {
    #[default]
    Claude,
    Codex,
}

impl DriverId {
    /// The alternate backend, used for background fail-over and stop fallback.
    pub fn other(self) -> Self {
        match self {
            DriverId::Claude => DriverId::Codex,
            DriverId::Codex => DriverId::Claude,
        }
    }
}

/// Reasoning effort forwarded to the backend.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EffortLevel {
    Low,
    Medium,
    #[default]
    High,
}

/// Token usage reported by a backend on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UsageStats {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl UsageStats {
    /// True when the backend did no work at all. A resumed session that
    /// reports zero tokens in both directions is stale.
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

/// One event decoded from a backend's output stream.
///
/// This is the closed union the rest of the system sees; loosely-typed wire
/// records are decoded into it at the boundary (see [`wire`]) and malformed
/// records never propagate inward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Thinking {
        text: String,
    },
    /// A tool started executing. `rendered_status` is the human-readable
    /// one-line description the backend chose for it.
    Tool {
        name: String,
        rendered_status: String,
    },
    Text {
        text: String,
    },
    /// The backend announced (or re-announced) its resumable handle. Opaque;
    /// meaningless outside the backend that produced it.
    SessionHandle {
        handle: String,
    },
    /// Terminal event for a successful call.
    Done {
        usage: Option<UsageStats>,
    },
}

/// Errors surfaced by a backend call itself.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to launch backend process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("backend process error: {message}")]
    Process { message: String },
    #[error("backend stream error: {message}")]
    Stream { message: String },
    /// The call was torn down by the cancellation token. Distinguished from
    /// real failure so the engine never reports a requested stop as a crash.
    #[error("backend call aborted")]
    Aborted,
}

/// Options for a single backend call.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Resume token from an earlier call on the same backend, if any.
    pub resume_handle: Option<String>,
    pub model: String,
    pub effort: EffortLevel,
    pub system_prompt: Option<String>,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<BackendEvent, DriverError>> + Send>>;

/// A single agent backend: send one prompt, receive a stream of events
/// terminated by [`BackendEvent::Done`].
///
/// Implementations must honor the cancellation token promptly and surface the
/// teardown as [`DriverError::Aborted`] rather than a process failure.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn send(
        &self,
        prompt: &str,
        options: SendOptions,
        cancel: CancellationToken,
    ) -> Result<EventStream, DriverError>;
}
