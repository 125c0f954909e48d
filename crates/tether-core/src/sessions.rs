//! Saved-session history for one backend.
//!
//! Holds the last few resumable handles with enough metadata to pick one
//! from a list. Records are scoped to the workspace directory they were
//! created in; a handle from another workspace is shown but refused on
//! resume. Handles are opaque and never shared across backends; each engine
//! owns its own store file.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Keep only this many sessions in the history.
const MAX_SAVED_SESSIONS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SavedSession {
    pub handle: String,
    pub saved_at: DateTime<Utc>,
    pub workspace_dir: String,
    /// First operator message, truncated for display.
    pub title: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionHistory {
    sessions: Vec<SavedSession>,
}

#[derive(Debug)]
pub struct SessionFileStore {
    path: PathBuf,
    workspace_dir: String,
}

impl SessionFileStore {
    pub fn new(path: impl Into<PathBuf>, workspace_dir: impl AsRef<Path>) -> Self {
        Self {
            path: path.into(),
            workspace_dir: workspace_dir.as_ref().to_string_lossy().into_owned(),
        }
    }

    /// Record (or refresh) a session. Existing entries with the same handle
    /// are updated in place; new ones go to the front of the list.
    pub fn record(&self, handle: &str, title: &str) {
        let mut history = self.load();
        let entry = SavedSession {
            handle: handle.to_string(),
            saved_at: Utc::now(),
            workspace_dir: self.workspace_dir.clone(),
            title: title.to_string(),
        };
        if let Some(existing) = history.sessions.iter_mut().find(|s| s.handle == handle) {
            *existing = entry;
        } else {
            history.sessions.insert(0, entry);
        }
        history.sessions.truncate(MAX_SAVED_SESSIONS);
        self.persist(&history);
    }

    /// Sessions usable from the current workspace, most recent first.
    pub fn list(&self) -> Vec<SavedSession> {
        self.load()
            .sessions
            .into_iter()
            .filter(|s| s.workspace_dir.is_empty() || s.workspace_dir == self.workspace_dir)
            .collect()
    }

    /// Find by full handle or handle prefix.
    pub fn find(&self, handle_or_prefix: &str) -> Option<SavedSession> {
        if handle_or_prefix.is_empty() {
            return None;
        }
        let sessions = self.list();
        sessions
            .iter()
            .find(|s| s.handle == handle_or_prefix)
            .or_else(|| {
                sessions
                    .iter()
                    .find(|s| s.handle.starts_with(handle_or_prefix))
            })
            .cloned()
    }

    pub fn most_recent(&self) -> Option<SavedSession> {
        self.list().into_iter().next()
    }

    fn load(&self) -> SessionHistory {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(history) => history,
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "unreadable session history");
                    SessionHistory::default()
                }
            },
            Err(_) => SessionHistory::default(),
        }
    }

    fn persist(&self, history: &SessionHistory) {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let contents = serde_json::to_string_pretty(history)?;
            std::fs::write(&self.path, contents)
        };
        if let Err(err) = write() {
            warn!(path = %self.path.display(), error = %err, "failed to save session history");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &tempfile::TempDir) -> SessionFileStore {
        SessionFileStore::new(dir.path().join("sessions.json"), "/work")
    }

    #[test]
    fn records_newest_first_and_updates_in_place() {
        let dir = tempdir().expect("tempdir");
        let store = store(&dir);

        store.record("h-1", "first question");
        store.record("h-2", "second question");
        store.record("h-1", "first question, renamed");

        let sessions = store.list();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].handle, "h-2");
        assert_eq!(sessions[1].handle, "h-1");
        assert_eq!(sessions[1].title, "first question, renamed");
    }

    #[test]
    fn history_is_bounded() {
        let dir = tempdir().expect("tempdir");
        let store = store(&dir);
        for i in 0..8 {
            store.record(&format!("h-{i}"), "t");
        }
        let sessions = store.list();
        assert_eq!(sessions.len(), MAX_SAVED_SESSIONS);
        assert_eq!(sessions[0].handle, "h-7");
        assert_eq!(sessions.last().expect("last").handle, "h-3");
    }

    #[test]
    fn find_matches_exact_then_prefix() {
        let dir = tempdir().expect("tempdir");
        let store = store(&dir);
        store.record("abc-123", "one");
        store.record("abd-456", "two");

        assert_eq!(store.find("abc-123").expect("exact").title, "one");
        assert_eq!(store.find("abd").expect("prefix").title, "two");
        assert!(store.find("zzz").is_none());
        assert!(store.find("").is_none());
    }

    #[test]
    fn other_workspace_sessions_are_filtered_out() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sessions.json");
        let here = SessionFileStore::new(&path, "/work");
        let elsewhere = SessionFileStore::new(&path, "/other");

        here.record("h-here", "mine");
        elsewhere.record("h-elsewhere", "theirs");

        let visible: Vec<_> = here.list().into_iter().map(|s| s.handle).collect();
        assert_eq!(visible, vec!["h-here".to_string()]);
    }

    #[test]
    fn corrupt_history_reads_as_empty() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("sessions.json"), "[broken").expect("write");
        assert!(store(&dir).list().is_empty());
    }
}
