//! Boundary decode from backend wire records to [`BackendEvent`].
//!
//! Backends emit newline-delimited JSON. Records are decoded into the closed
//! event union here; anything malformed or unrecognized is logged and skipped
//! so untyped data never travels further into the system.

use serde::Deserialize;
use tracing::warn;

use crate::{BackendEvent, UsageStats};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireRecord {
    Thinking {
        text: String,
    },
    Tool {
        name: String,
        #[serde(default)]
        status: Option<String>,
    },
    Text {
        text: String,
    },
    Session {
        handle: String,
    },
    Done {
        #[serde(default)]
        usage: Option<UsageStats>,
    },
}

impl From<WireRecord> for BackendEvent {
    fn from(record: WireRecord) -> Self {
        match record {
            WireRecord::Thinking { text } => BackendEvent::Thinking { text },
            WireRecord::Tool { name, status } => {
                let rendered_status = status.unwrap_or_else(|| name.clone());
                BackendEvent::Tool {
                    name,
                    rendered_status,
                }
            }
            WireRecord::Text { text } => BackendEvent::Text { text },
            WireRecord::Session { handle } => BackendEvent::SessionHandle { handle },
            WireRecord::Done { usage } => BackendEvent::Done { usage },
        }
    }
}

/// Decode one line of backend output. Returns `None` for blank lines and for
/// records that fail to parse.
pub fn decode_line(line: &str) -> Option<BackendEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<WireRecord>(trimmed) {
        Ok(record) => Some(record.into()),
        Err(err) => {
            warn!(error = %err, "skipping malformed backend record");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_each_record_kind() {
        assert_eq!(
            decode_line(r#"{"type":"thinking","text":"hm"}"#),
            Some(BackendEvent::Thinking {
                text: "hm".to_string()
            })
        );
        assert_eq!(
            decode_line(r#"{"type":"tool","name":"shell","status":"shell: git status"}"#),
            Some(BackendEvent::Tool {
                name: "shell".to_string(),
                rendered_status: "shell: git status".to_string(),
            })
        );
        assert_eq!(
            decode_line(r#"{"type":"text","text":"hello"}"#),
            Some(BackendEvent::Text {
                text: "hello".to_string()
            })
        );
        assert_eq!(
            decode_line(r#"{"type":"session","handle":"abc-123"}"#),
            Some(BackendEvent::SessionHandle {
                handle: "abc-123".to_string()
            })
        );
    }

    #[test]
    fn tool_status_falls_back_to_tool_name() {
        assert_eq!(
            decode_line(r#"{"type":"tool","name":"shell"}"#),
            Some(BackendEvent::Tool {
                name: "shell".to_string(),
                rendered_status: "shell".to_string(),
            })
        );
    }

    #[test]
    fn done_usage_is_optional() {
        let done = decode_line(r#"{"type":"done","usage":{"input_tokens":10,"output_tokens":2}}"#);
        match done {
            Some(BackendEvent::Done { usage: Some(usage) }) => {
                assert_eq!(usage.input_tokens, 10);
                assert_eq!(usage.output_tokens, 2);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
        assert_eq!(
            decode_line(r#"{"type":"done"}"#),
            Some(BackendEvent::Done { usage: None })
        );
    }

    #[test]
    fn malformed_and_blank_lines_are_skipped() {
        assert_eq!(decode_line(""), None);
        assert_eq!(decode_line("   "), None);
        assert_eq!(decode_line("not json"), None);
        assert_eq!(decode_line(r#"{"type":"mystery"}"#), None);
        assert_eq!(decode_line(r#"{"type":"text"}"#), None);
    }
}
