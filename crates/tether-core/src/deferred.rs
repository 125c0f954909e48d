//! Per-conversation overflow buffer for input that arrives mid-run.
//!
//! Messages that can't start immediately (the gate is held) wait here and
//! are replayed strictly FIFO once the engine goes idle. An identical
//! message arriving right after the previous one (a double-send, a
//! transcription retry) collapses into it instead of queueing twice, but
//! only against the immediately preceding entry: a duplicate separated by a
//! different message is intentionally kept.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use tracing::{info, warn};

use crate::error;
use crate::router::{DriverRouter, RunInput, RunOrigin};
use crate::stream::FrontendBridge;

/// Queue depth per conversation; the oldest entry is dropped beyond this.
const MAX_QUEUE_PER_CONVERSATION: usize = 10;
/// An identical message within this window collapses into its predecessor.
const COLLAPSE_WINDOW_MS: u64 = 5_000;

/// Where a deferred message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSource {
    Text,
    Voice,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredMessage {
    pub text: String,
    pub conversation_id: i64,
    pub sender: String,
    pub source: MessageSource,
    pub enqueued_at_ms: u64,
}

#[derive(Debug, Default)]
pub struct DeferredMessageQueue {
    queues: Mutex<HashMap<i64, VecDeque<DeferredMessage>>>,
    draining: Mutex<HashSet<i64>>,
}

impl DeferredMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message, collapsing doubles. Returns the queue length for the
    /// conversation afterwards.
    pub fn enqueue(&self, item: DeferredMessage) -> usize {
        let mut queues = self.lock_queues();
        let queue = queues.entry(item.conversation_id).or_default();

        if let Some(last) = queue.back() {
            if last.text.trim() == item.text.trim()
                && item.enqueued_at_ms.saturating_sub(last.enqueued_at_ms) <= COLLAPSE_WINDOW_MS
            {
                return queue.len();
            }
        }

        queue.push_back(item);
        if queue.len() > MAX_QUEUE_PER_CONVERSATION {
            queue.pop_front();
        }
        queue.len()
    }

    pub fn dequeue(&self, conversation_id: i64) -> Option<DeferredMessage> {
        let mut queues = self.lock_queues();
        let queue = queues.get_mut(&conversation_id)?;
        let next = queue.pop_front();
        if queue.is_empty() {
            queues.remove(&conversation_id);
        }
        next
    }

    pub fn len(&self, conversation_id: i64) -> usize {
        self.lock_queues()
            .get(&conversation_id)
            .map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, conversation_id: i64) -> bool {
        self.len(conversation_id) == 0
    }

    /// Replay queued messages while nothing is running anywhere.
    ///
    /// Stops silently on a cancellation-class failure; on anything else it
    /// notifies the conversation once and leaves the remainder queued.
    /// Reentrant calls for a conversation already draining return
    /// immediately.
    pub async fn drain_when_idle(
        &self,
        conversation_id: i64,
        router: &DriverRouter,
        bridge: &dyn FrontendBridge,
    ) {
        if router.is_any_running() || !self.begin_drain(conversation_id) {
            return;
        }
        let _guard = DrainGuard {
            queue: self,
            conversation_id,
        };

        while !router.is_any_running() {
            let Some(next) = self.dequeue(conversation_id) else {
                break;
            };

            let driver = router.active();
            let _processing = driver.begin_processing();
            let sink = bridge.sink(conversation_id, false);
            let input = RunInput {
                message: next.text.clone(),
                conversation_id,
                sender: next.sender.clone(),
                origin: RunOrigin::Deferred,
            };

            match router.run_message(driver.id(), input, sink).await {
                Ok(response) => {
                    info!(
                        target: "audit",
                        conversation_id,
                        sender = %next.sender,
                        source = ?next.source,
                        message = %next.text,
                        response_len = response.len(),
                        "deferred message replayed"
                    );
                }
                Err(err) if err.is_cancellation() => break,
                Err(err) => {
                    warn!(conversation_id, error = %err, "deferred drain failed; keeping remaining messages");
                    bridge
                        .notify(
                            conversation_id,
                            format!("Error: {}", error::summarize(&err, 200)),
                        )
                        .await;
                    break;
                }
            }
        }
    }

    fn begin_drain(&self, conversation_id: i64) -> bool {
        self.lock_draining().insert(conversation_id)
    }

    fn lock_queues(&self) -> std::sync::MutexGuard<'_, HashMap<i64, VecDeque<DeferredMessage>>> {
        self.queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_draining(&self) -> std::sync::MutexGuard<'_, HashSet<i64>> {
        self.draining
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

struct DrainGuard<'a> {
    queue: &'a DeferredMessageQueue,
    conversation_id: i64,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.queue
            .lock_draining()
            .remove(&self.conversation_id);
    }
}
