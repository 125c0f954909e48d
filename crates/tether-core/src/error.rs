use thiserror::Error;

use tether_driver::DriverError;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy for one logical run.
///
/// The router's retry policy keys off these variants, so classification
/// happens once, at the engine boundary, and the rest of the system matches
/// on variants instead of scraping error text.
#[derive(Debug, Error)]
pub enum Error {
    /// The run was torn down cooperatively. Never retried; reported as a
    /// quiet "stopped" unless the operator explicitly asked for the stop.
    #[error("run cancelled")]
    Cancelled,
    /// No event arrived within the active stall timeout.
    #[error("event stream stalled for {timeout_ms}ms before completion")]
    Stall { timeout_ms: u64 },
    /// The backend terminated abnormally before signalling completion.
    #[error("backend crashed: {message}")]
    Crash { message: String },
    /// Usage/quota exhaustion. Only consulted when deciding whether a
    /// background run should fail over to the alternate backend.
    #[error("backend quota or limit reached: {message}")]
    QuotaOrLimit { message: String },
    /// The single-flight gate is already held for this backend.
    #[error("a run is already in flight for this backend")]
    RunInFlight,
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unexpected failure: {0}")]
    Unknown(String),
}

impl Error {
    pub fn is_cancellation(&self) -> bool {
        match self {
            Error::Cancelled | Error::Driver(DriverError::Aborted) => true,
            other => {
                let text = other.to_string().to_lowercase();
                text.contains("cancel") || text.contains("abort")
            }
        }
    }

    pub fn is_stall(&self) -> bool {
        matches!(self, Error::Stall { .. })
    }

    pub fn is_crash(&self) -> bool {
        matches!(self, Error::Crash { .. })
    }

    pub fn is_quota_or_limit(&self) -> bool {
        matches!(self, Error::QuotaOrLimit { .. })
    }
}

/// Compact an error message for operator-facing surfaces and stored state:
/// collapse whitespace and truncate with an ellipsis.
pub fn summarize(err: &Error, max_len: usize) -> String {
    let compact = err
        .to_string()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if compact.len() > max_len {
        let mut cut = max_len.saturating_sub(3);
        while cut > 0 && !compact.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &compact[..cut])
    } else {
        compact
    }
}

/// Text-pattern check for quota-flavored backend failures. The patterns are
/// deliberately broad: both backends phrase exhaustion differently and the
/// only consequence of a match is a one-time background fail-over.
pub fn looks_like_quota(message: &str) -> bool {
    let text = message.to_lowercase();
    text.contains("quota")
        || text.contains("usage limit")
        || text.contains("rate limit")
        || text.contains("limit reached")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_covers_aborted_driver_errors() {
        assert!(Error::Cancelled.is_cancellation());
        assert!(Error::Driver(DriverError::Aborted).is_cancellation());
        assert!(!Error::Stall { timeout_ms: 1 }.is_cancellation());
    }

    #[test]
    fn stall_message_names_the_timeout() {
        let err = Error::Stall { timeout_ms: 120_000 };
        assert_eq!(
            err.to_string(),
            "event stream stalled for 120000ms before completion"
        );
    }

    #[test]
    fn quota_patterns_match_both_backends_phrasing() {
        assert!(looks_like_quota("Weekly usage limit reached"));
        assert!(looks_like_quota("429 rate limit exceeded"));
        assert!(looks_like_quota("insufficient quota"));
        assert!(!looks_like_quota("process exited with code 1"));
    }
}
