//! Inbound-event deduplication.
//!
//! Long-poll transports replay events after reconnects and timeouts. Every
//! inbound event is reduced to a handful of stable fingerprint keys and
//! checked against a TTL cache before routing; a hit on any key means the
//! event was already handled. Keys are refreshed on every sighting, so a
//! replay storm keeps its keys alive rather than aging them out mid-storm.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;

const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Message payload of an inbound event, as much of it as survived decoding.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub conversation_id: Option<i64>,
    pub message_id: Option<i64>,
    pub sender_id: Option<i64>,
    pub sent_at: Option<i64>,
    pub text: Option<String>,
}

/// A button/action reply attached to an earlier outbound message.
#[derive(Debug, Clone, Default)]
pub struct ActionReply {
    pub id: Option<String>,
    pub sender_id: Option<i64>,
    pub data: Option<String>,
    /// Set when the reply references a message the transport detached from
    /// its conversation.
    pub detached_ref: Option<String>,
    pub message: Option<InboundMessage>,
}

/// Envelope for one inbound event.
#[derive(Debug, Clone, Default)]
pub struct InboundEvent {
    pub envelope_id: Option<i64>,
    pub message: Option<InboundMessage>,
    pub action_reply: Option<ActionReply>,
}

fn message_fingerprint(message: &InboundMessage) -> Option<String> {
    if let (Some(conversation_id), Some(message_id)) =
        (message.conversation_id, message.message_id)
    {
        return Some(format!("msg:{conversation_id}:{message_id}"));
    }
    if let (Some(sender), Some(sent_at), Some(text)) =
        (message.sender_id, message.sent_at, message.text.as_deref())
    {
        return Some(format!("msg_fallback:{sender}:{sent_at}:{text}"));
    }
    None
}

fn action_reply_fingerprint(reply: &ActionReply) -> Option<String> {
    if let Some(id) = reply.id.as_deref() {
        if !id.is_empty() {
            return Some(format!("ar:{id}"));
        }
    }
    let sender = reply.sender_id?;
    let data = reply.data.as_deref()?;
    if let Some(detached) = reply.detached_ref.as_deref() {
        if !detached.is_empty() {
            return Some(format!("ar_fallback:detached:{sender}:{detached}:{data}"));
        }
    }
    if let Some(message) = &reply.message {
        if let (Some(conversation_id), Some(message_id)) =
            (message.conversation_id, message.message_id)
        {
            return Some(format!(
                "ar_fallback:conv:{sender}:{conversation_id}:{message_id}:{data}"
            ));
        }
    }
    Some(format!("ar_fallback:sender:{sender}:{data}"))
}

/// Derive the 1–3 stable keys for an event. An event with no recognizable
/// payload yields no keys and is never considered a duplicate.
pub fn fingerprint_keys(event: &InboundEvent) -> Vec<String> {
    let message_key = event.message.as_ref().and_then(message_fingerprint);
    let reply_key = event.action_reply.as_ref().and_then(action_reply_fingerprint);
    if message_key.is_none() && reply_key.is_none() {
        return Vec::new();
    }

    let mut keys = Vec::with_capacity(3);
    if let Some(envelope_id) = event.envelope_id {
        keys.push(format!("env:{envelope_id}"));
    }
    keys.extend(message_key);
    keys.extend(reply_key);
    keys
}

/// TTL cache over fingerprint keys.
///
/// Every key gets the same TTL and is moved to the front on every check, so
/// recency order and expiry order coincide: expired entries cluster at the
/// LRU end and are swept lazily, and the size bound evicts the
/// least-recently-refreshed key first.
#[derive(Debug)]
pub struct UpdateDedupeCache {
    ttl: Duration,
    seen_until: Mutex<LruCache<String, u64>>,
}

impl Default for UpdateDedupeCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}

impl UpdateDedupeCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            seen_until: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Report whether this event was already seen, and remember it either
    /// way. All derived keys are (re)inserted with a fresh expiry on every
    /// call, duplicate or not.
    pub fn is_duplicate(&self, event: &InboundEvent, now_ms: u64) -> bool {
        let mut cache = self
            .seen_until
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        // Lazy sweep: the LRU tail always holds the earliest expiry.
        while let Some((_, expires_at)) = cache.peek_lru() {
            if *expires_at <= now_ms {
                cache.pop_lru();
            } else {
                break;
            }
        }

        let keys = fingerprint_keys(event);
        if keys.is_empty() {
            return false;
        }

        let duplicate = keys
            .iter()
            .any(|key| cache.peek(key).is_some_and(|expires_at| *expires_at > now_ms));

        let expires_at = now_ms + self.ttl.as_millis() as u64;
        for key in keys {
            cache.put(key, expires_at);
        }

        duplicate
    }

    pub fn tracked_key_count(&self) -> usize {
        self.seen_until
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}
