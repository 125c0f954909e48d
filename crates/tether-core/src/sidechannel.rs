//! File-spool side channel between the backends' tools and the engine.
//!
//! Backend tools communicate with the host by dropping small JSON request
//! files into a spool directory; the engine polls for them, acts, and writes
//! the outcome back into the same file for the tool's own polling loop to
//! pick up. Delivery is eventually-consistent: the writer may still be
//! flushing when we look, so every check settles briefly and retries a
//! bounded number of times, never an unbounded block.
//!
//! Most request kinds are only *queried* here (the front-end owns acting on
//! them). Remote-control requests are the exception: the engine executes a
//! small fixed action vocabulary and reports the result.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Inline option prompts for the operator.
pub const KIND_OPERATOR_CHOICE: &str = "operator-choice";
/// Media the backend wants pushed to the conversation.
pub const KIND_OUTBOUND_MEDIA: &str = "outbound-media";
/// Control actions executed by the engine itself.
pub const KIND_REMOTE_CONTROL: &str = "remote-control";

/// Delay before the first scan, giving the tool's writer time to flush.
const SETTLE_DELAY: Duration = Duration::from_millis(200);
/// Scans per check.
const POLL_ATTEMPTS: u32 = 3;
/// Delay between scans.
const POLL_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One request file with a `pending` status for the given conversation.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub path: PathBuf,
    pub payload: Value,
}

/// Pure query: pending request files of one kind for one conversation.
/// Malformed files are logged and skipped.
pub fn pending_requests(spool_dir: &Path, kind: &str, conversation_id: i64) -> Vec<PendingRequest> {
    let Ok(entries) = std::fs::read_dir(spool_dir) else {
        return Vec::new();
    };
    let prefix = format!("{kind}-");
    let mut pending = Vec::new();

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(&prefix) || !name.ends_with(".json") {
            continue;
        }
        let path = entry.path();
        let payload: Value = match std::fs::read_to_string(&path)
            .map_err(|err| err.to_string())
            .and_then(|text| serde_json::from_str(&text).map_err(|err| err.to_string()))
        {
            Ok(payload) => payload,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable request file");
                continue;
            }
        };

        if payload.get("status").and_then(Value::as_str) != Some("pending") {
            continue;
        }
        if let Some(target) = payload.get("conversation_id").and_then(Value::as_i64) {
            if target != conversation_id {
                continue;
            }
        }
        pending.push(PendingRequest { path, payload });
    }
    pending
}

/// Poll for pending requests with the standard settle-then-retry cadence.
/// Returns the first non-empty batch, or empty after the retry budget.
pub async fn poll_pending_with_retries(
    spool_dir: &Path,
    kind: &str,
    conversation_id: i64,
) -> Vec<PendingRequest> {
    tokio::time::sleep(SETTLE_DELAY).await;
    for attempt in 0..POLL_ATTEMPTS {
        let pending = pending_requests(spool_dir, kind, conversation_id);
        if !pending.is_empty() {
            return pending;
        }
        if attempt + 1 < POLL_ATTEMPTS {
            tokio::time::sleep(POLL_RETRY_DELAY).await;
        }
    }
    Vec::new()
}

/// What a remote-control request can act on. Implemented by the session
/// engine; kept as a trait so the action executor stays testable without a
/// backend.
#[async_trait]
pub trait ControlTarget: Send + Sync {
    fn usage_summary(&self) -> String;
    fn switch_model(&self, model: Option<&str>, effort: Option<&str>) -> String;
    async fn reset_session(&self) -> String;
    fn list_sessions(&self) -> String;
    fn resume_session(&self, handle_or_prefix: &str) -> String;
}

#[derive(Debug, Deserialize)]
struct ControlRequest {
    action: String,
    #[serde(default)]
    params: HashMap<String, String>,
}

async fn execute_control_action(
    target: &dyn ControlTarget,
    request: &ControlRequest,
) -> Result<String, String> {
    match request.action.as_str() {
        "fetch_usage" => Ok(target.usage_summary()),
        "switch_model" => Ok(target.switch_model(
            request.params.get("model").map(String::as_str),
            request.params.get("effort").map(String::as_str),
        )),
        "new_session" => Ok(target.reset_session().await),
        "list_sessions" => Ok(target.list_sessions()),
        "resume_session" => {
            let handle = request
                .params
                .get("session")
                .ok_or_else(|| "missing session parameter".to_string())?;
            Ok(target.resume_session(handle))
        }
        other => Ok(format!("Unknown action: {other}")),
    }
}

/// Execute every pending remote-control request and write the outcome back.
/// Returns whether anything was handled.
pub async fn fulfill_control_requests(
    spool_dir: &Path,
    target: &dyn ControlTarget,
    conversation_id: i64,
) -> bool {
    let mut handled = false;
    for request in pending_requests(spool_dir, KIND_REMOTE_CONTROL, conversation_id) {
        let mut payload = request.payload;
        match serde_json::from_value::<ControlRequest>(payload.clone()) {
            Ok(control) => {
                debug!(action = %control.action, conversation_id, "executing remote-control action");
                match execute_control_action(target, &control).await {
                    Ok(result) => {
                        payload["status"] = Value::from("completed");
                        payload["result"] = Value::from(result);
                    }
                    Err(message) => {
                        payload["status"] = Value::from("error");
                        payload["error"] = Value::from(message);
                    }
                }
            }
            Err(err) => {
                payload["status"] = Value::from("error");
                payload["error"] = Value::from(format!("malformed control request: {err}"));
            }
        }
        if let Err(err) = write_back(&request.path, &payload) {
            warn!(path = %request.path.display(), error = %err, "failed to write control result");
            continue;
        }
        handled = true;
    }
    handled
}

/// Settle, then fulfill control requests with the bounded retry cadence.
/// Used right after the backend invokes its control tool.
pub async fn settle_and_fulfill_control_requests(
    spool_dir: &Path,
    target: &dyn ControlTarget,
    conversation_id: i64,
) -> bool {
    tokio::time::sleep(SETTLE_DELAY).await;
    for attempt in 0..POLL_ATTEMPTS {
        if fulfill_control_requests(spool_dir, target, conversation_id).await {
            return true;
        }
        if attempt + 1 < POLL_ATTEMPTS {
            tokio::time::sleep(POLL_RETRY_DELAY).await;
        }
    }
    false
}

fn write_back(path: &Path, payload: &Value) -> std::io::Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(payload)?)
}
