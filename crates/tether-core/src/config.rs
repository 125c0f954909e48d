//! Tunables and owned-file locations.
//!
//! Stall timeouts and streaming throttles are overridable through the
//! environment so a slow deployment can loosen them without a rebuild;
//! anything else is a module-local constant next to its use.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Parse an env var as milliseconds, falling back to `default_ms` and
/// clamping to a floor so a typo can't produce a sub-second stall timer.
fn env_ms(key: &str, default_ms: u64, floor_ms: u64) -> Duration {
    let ms = env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .filter(|parsed| *parsed >= floor_ms)
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}

/// Streaming behavior for one run.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Patience while the backend is between events.
    pub idle_stall_timeout: Duration,
    /// Longer patience while a tool is executing; backends emit nothing
    /// until the tool returns.
    pub tool_active_stall_timeout: Duration,
    /// Minimum spacing between partial-text pushes to the caller.
    pub delta_throttle: Duration,
    /// Partial text shorter than this is held back until the next flush.
    pub min_delta_len: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            idle_stall_timeout: Duration::from_secs(120),
            tool_active_stall_timeout: Duration::from_secs(180),
            delta_throttle: Duration::from_millis(500),
            min_delta_len: 20,
        }
    }
}

impl StreamConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            idle_stall_timeout: env_ms(
                "TETHER_STALL_TIMEOUT_MS",
                defaults.idle_stall_timeout.as_millis() as u64,
                1_000,
            ),
            tool_active_stall_timeout: env_ms(
                "TETHER_TOOL_ACTIVE_STALL_TIMEOUT_MS",
                defaults.tool_active_stall_timeout.as_millis() as u64,
                1_000,
            ),
            delta_throttle: env_ms(
                "TETHER_STREAM_THROTTLE_MS",
                defaults.delta_throttle.as_millis() as u64,
                50,
            ),
            min_delta_len: defaults.min_delta_len,
        }
    }
}

/// Locations of the files this crate owns.
#[derive(Debug, Clone)]
pub struct CorePaths {
    pub preferences_file: PathBuf,
    pub sessions_file: PathBuf,
    pub jobs_file: PathBuf,
    /// Spool directory polled for side-channel request files.
    pub spool_dir: PathBuf,
    /// Directory the backends run in; session records are scoped to it.
    pub workspace_dir: PathBuf,
}

impl CorePaths {
    /// Resolve under the platform data directory, honoring
    /// `TETHER_WORKSPACE_DIR` for the backend working directory.
    pub fn resolve() -> Result<Self> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| Error::Configuration("could not determine data directory".to_string()))?
            .join("tether");
        let workspace_dir = env::var("TETHER_WORKSPACE_DIR")
            .map(PathBuf::from)
            .or_else(|_| env::current_dir())?;
        Ok(Self {
            preferences_file: data_dir.join("preferences.json"),
            sessions_file: data_dir.join("sessions.json"),
            jobs_file: data_dir.join("jobs.json"),
            spool_dir: env::temp_dir(),
            workspace_dir,
        })
    }

    /// Same layout rooted at an explicit directory. Used by tests and by
    /// embedders that already own a state directory.
    pub fn rooted_at(root: impl Into<PathBuf>, workspace_dir: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            preferences_file: root.join("preferences.json"),
            sessions_file: root.join("sessions.json"),
            jobs_file: root.join("jobs.json"),
            spool_dir: root.join("spool"),
            workspace_dir: workspace_dir.into(),
        }
    }
}
