//! Durable store for scheduled one-shot and recurring jobs.
//!
//! Jobs live in a whole-file JSON array, read-modify-written with a
//! synchronous flush after every mutation. Reads always go back to disk so
//! writes from outside the process are observed. A corrupt file keeps the
//! last good in-memory cache instead of wiping state, and individually
//! malformed records are logged and skipped during a bulk load.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::Result;

/// Milliseconds since the epoch. Fallible clocks aren't worth modeling; a
/// pre-1970 system clock has bigger problems than job scheduling.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    OneShot,
    Recurring,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub prompt: String,
    /// Target conversation; the caller supplies a default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<i64>,
    pub kind: JobKind,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    /// Output stays silent unless notable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub silent: Option<bool>,
    pub fire_at: u64,
    pub created_at: DateTime<Utc>,
}

impl ScheduledJob {
    pub fn is_silent(&self) -> bool {
        self.silent == Some(true)
    }
}

/// Fields for a new job; `fire_at` is computed from `delay_ms` or, for
/// recurring jobs, `interval_ms`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub prompt: String,
    pub conversation_id: Option<i64>,
    pub kind: JobKind,
    pub delay_ms: Option<u64>,
    pub interval_ms: Option<u64>,
    pub silent: bool,
}

#[derive(Debug)]
pub struct ScheduledJobStore {
    path: PathBuf,
    cache: Mutex<Vec<ScheduledJob>>,
}

impl ScheduledJobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(Vec::new()),
        }
    }

    /// Re-read the store from disk into the cache and return a copy.
    ///
    /// Parse failures keep the previous cache so a transient corrupt read
    /// can't drop every job on the floor.
    pub fn reload(&self) -> Vec<ScheduledJob> {
        let mut cache = self.lock();
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => match serde_json::from_str::<Vec<serde_json::Value>>(&contents) {
                Ok(records) => {
                    *cache = records
                        .into_iter()
                        .enumerate()
                        .filter_map(|(index, value)| {
                            match serde_json::from_value::<ScheduledJob>(value) {
                                Ok(job) => Some(job),
                                Err(err) => {
                                    warn!(index, error = %err, "skipping invalid scheduled job");
                                    None
                                }
                            }
                        })
                        .collect();
                }
                Err(err) => {
                    error!(path = %self.path.display(), error = %err, "failed to load scheduled jobs; keeping cache");
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => cache.clear(),
            Err(err) => {
                error!(path = %self.path.display(), error = %err, "failed to read scheduled jobs; keeping cache");
            }
        }
        cache.clone()
    }

    pub fn jobs(&self) -> Vec<ScheduledJob> {
        self.reload()
    }

    /// Jobs whose fire time has arrived.
    pub fn due_jobs(&self, now_ms: u64) -> Vec<ScheduledJob> {
        self.reload()
            .into_iter()
            .filter(|job| job.fire_at <= now_ms)
            .collect()
    }

    pub fn add(&self, new: NewJob, now_ms: u64) -> Result<ScheduledJob> {
        self.reload();

        let fire_at = match (new.delay_ms, new.interval_ms, new.kind) {
            (Some(delay), _, _) => now_ms + delay,
            (None, Some(interval), JobKind::Recurring) => now_ms + interval,
            _ => now_ms,
        };
        let job = ScheduledJob {
            id: Uuid::new_v4().to_string(),
            prompt: new.prompt,
            conversation_id: new.conversation_id,
            kind: new.kind,
            interval_ms: new.interval_ms,
            silent: new.silent.then_some(true),
            fire_at,
            created_at: Utc::now(),
        };

        let mut cache = self.lock();
        cache.push(job.clone());
        self.persist(&cache)?;
        Ok(job)
    }

    pub fn remove(&self, id: &str) -> Result<bool> {
        self.reload();
        let mut cache = self.lock();
        let before = cache.len();
        cache.retain(|job| job.id != id);
        if cache.len() == before {
            return Ok(false);
        }
        self.persist(&cache)?;
        Ok(true)
    }

    /// Push a recurring job's fire time forward after it ran.
    ///
    /// Always reschedules from "now" when the stored time is in the past, so
    /// a long downtime produces one catch-up run instead of a burst.
    pub fn advance_recurring(&self, id: &str, now_ms: u64) -> Result<bool> {
        self.reload();
        let mut cache = self.lock();
        let Some(job) = cache.iter_mut().find(|job| job.id == id) else {
            return Ok(false);
        };
        let (JobKind::Recurring, Some(interval)) = (job.kind, job.interval_ms) else {
            return Ok(false);
        };
        job.fire_at = now_ms.max(job.fire_at) + interval;
        self.persist(&cache)?;
        Ok(true)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ScheduledJob>> {
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // Persist failures propagate: a job mutation that didn't reach disk must
    // not look like it did.
    fn persist(&self, jobs: &[ScheduledJob]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(jobs)?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }
}
