//! Operator preferences: model, effort, and the active backend.
//!
//! A small JSON blob loaded once at startup and rewritten on every setter so
//! a restart resumes exactly where the operator left off. An unreadable file
//! is logged and replaced with defaults rather than failing startup.

use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tether_driver::{DriverId, EffortLevel};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Preferences {
    pub model: Option<String>,
    #[serde(default)]
    pub effort: EffortLevel,
    #[serde(default)]
    pub active_driver: DriverId,
}

#[derive(Debug)]
pub struct PreferenceStore {
    path: PathBuf,
    state: Mutex<Preferences>,
}

impl PreferenceStore {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Preferences>(&contents) {
                Ok(prefs) => {
                    debug!(
                        model = prefs.model.as_deref().unwrap_or("default"),
                        effort = %prefs.effort,
                        driver = %prefs.active_driver,
                        "loaded preferences"
                    );
                    prefs
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "unreadable preferences file; using defaults");
                    Preferences::default()
                }
            },
            Err(_) => Preferences::default(),
        };
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn snapshot(&self) -> Preferences {
        self.lock().clone()
    }

    pub fn model(&self) -> Option<String> {
        self.lock().model.clone()
    }

    pub fn effort(&self) -> EffortLevel {
        self.lock().effort
    }

    pub fn active_driver(&self) -> DriverId {
        self.lock().active_driver
    }

    pub fn set_model(&self, model: impl Into<String>) {
        let mut state = self.lock();
        state.model = Some(model.into());
        self.persist(&state);
    }

    pub fn set_effort(&self, effort: EffortLevel) {
        let mut state = self.lock();
        state.effort = effort;
        self.persist(&state);
    }

    pub fn set_active_driver(&self, driver: DriverId) {
        let mut state = self.lock();
        state.active_driver = driver;
        self.persist(&state);
        debug!(driver = %driver, "switched active driver");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Preferences> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn persist(&self, prefs: &Preferences) {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let contents = serde_json::to_string_pretty(prefs)?;
            std::fs::write(&self.path, contents)
        };
        if let Err(err) = write() {
            // Losing a preference write is an inconvenience, not a reason to
            // abort the run that triggered it.
            warn!(path = %self.path.display(), error = %err, "failed to save preferences");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn setters_persist_and_survive_reload() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("preferences.json");

        let store = PreferenceStore::load(&path);
        store.set_model("sonnet-main");
        store.set_effort(EffortLevel::Low);
        store.set_active_driver(DriverId::Codex);

        let reloaded = PreferenceStore::load(&path);
        assert_eq!(reloaded.model().as_deref(), Some("sonnet-main"));
        assert_eq!(reloaded.effort(), EffortLevel::Low);
        assert_eq!(reloaded.active_driver(), DriverId::Codex);
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("preferences.json");
        std::fs::write(&path, "{not json").expect("write");

        let store = PreferenceStore::load(&path);
        assert_eq!(store.snapshot(), Preferences::default());
    }

    #[test]
    fn missing_file_starts_from_defaults() {
        let dir = tempdir().expect("tempdir");
        let store = PreferenceStore::load(dir.path().join("absent.json"));
        assert_eq!(store.active_driver(), DriverId::Claude);
        assert_eq!(store.effort(), EffortLevel::High);
        assert!(store.model().is_none());
    }
}
