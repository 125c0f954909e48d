//! Fires due scheduled jobs through the router.
//!
//! A periodic caller invokes [`Scheduler::fire_due_jobs`]; everything here is
//! glue between the job store, the snapshot queue, the background
//! coordinator, and the router. Scheduled work always yields to the
//! operator: a busy engine skips the whole tick, and a preemption mid-run
//! ends the job quietly and leaves it due for a later tick. Jobs advance or
//! disappear only after a successful run.

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::background::BackgroundRunCoordinator;
use crate::jobs::{JobKind, ScheduledJob, ScheduledJobStore, epoch_ms};
use crate::router::{DriverRouter, RunInput, RunOrigin};
use crate::snapshots::{PreparedSnapshot, SnapshotPrepQueue};
use crate::stream::FrontendBridge;

/// Leading marker telling the backend this is automated work, not the
/// operator typing. Injection is idempotent so a job prompt that already
/// carries the marker (for example one built from a previous recovery
/// rewrite) is not double-tagged.
const SCHEDULED_NOTICE: &str =
    "[Scheduled task firing. This is an automated check-in, not a live operator message.]";

/// Prefix a job prompt with the scheduled-run notice, exactly once.
pub fn scheduled_prompt(prompt: &str) -> String {
    if prompt.trim_start().starts_with(SCHEDULED_NOTICE) {
        prompt.to_string()
    } else {
        format!("{SCHEDULED_NOTICE}\n\n{prompt}")
    }
}

/// Render a prepared snapshot as a context section appended to the prompt,
/// so the backend needn't re-collect what the preparer already gathered.
fn snapshot_section(snapshot: &PreparedSnapshot) -> String {
    let mut section = format!(
        "\n\n--- Prepared context (task {}, snapshot #{}) ---\n",
        snapshot.monitored_task_id, snapshot.seq
    );
    if !snapshot.bundle.status_output.is_empty() {
        let _ = writeln!(section, "Status:\n{}", snapshot.bundle.status_output);
    }
    if !snapshot.bundle.state_excerpt.is_empty() {
        let _ = writeln!(section, "State:\n{}", snapshot.bundle.state_excerpt);
    }
    if !snapshot.bundle.activity_log.is_empty() {
        let _ = writeln!(
            section,
            "Recent activity:\n{}",
            snapshot.bundle.activity_log
        );
    }
    if let Some(url) = &snapshot.bundle.endpoint_url {
        let _ = writeln!(section, "Endpoint: {url}");
    }
    if !snapshot.prep_errors.is_empty() {
        let _ = writeln!(
            section,
            "Context collection issues: {}",
            snapshot.prep_errors.join("; ")
        );
    }
    section
}

pub struct Scheduler {
    router: Arc<DriverRouter>,
    jobs: Arc<ScheduledJobStore>,
    snapshots: Arc<SnapshotPrepQueue>,
    coordinator: Arc<BackgroundRunCoordinator>,
    bridge: Arc<dyn FrontendBridge>,
    /// Conversation used by jobs that don't name one.
    default_conversation_id: i64,
}

impl Scheduler {
    pub fn new(
        router: Arc<DriverRouter>,
        jobs: Arc<ScheduledJobStore>,
        snapshots: Arc<SnapshotPrepQueue>,
        coordinator: Arc<BackgroundRunCoordinator>,
        bridge: Arc<dyn FrontendBridge>,
        default_conversation_id: i64,
    ) -> Self {
        Self {
            router,
            jobs,
            snapshots,
            coordinator,
            bridge,
            default_conversation_id,
        }
    }

    /// One tick against the wall clock.
    pub async fn tick(&self) -> usize {
        self.fire_due_jobs(epoch_ms()).await
    }

    /// Run every job due at `now_ms`. Returns how many completed.
    ///
    /// The whole tick is skipped while anything is running; scheduled work
    /// never contends with the operator. Failed and preempted jobs are left
    /// due, so the next tick picks them up; recurring ones can't pile up
    /// because their advance reschedules forward from "now".
    pub async fn fire_due_jobs(&self, now_ms: u64) -> usize {
        if self.router.is_any_running() {
            debug!("skipping scheduled tick; a run is in flight");
            return 0;
        }

        let mut completed = 0;
        for job in self.jobs.due_jobs(now_ms) {
            // Re-check between jobs: the operator may have started typing
            // while the previous job ran.
            if self.router.is_any_running() {
                break;
            }
            if self.run_job(&job, now_ms).await {
                completed += 1;
            }
            if self.coordinator.was_preempted() {
                break;
            }
        }
        completed
    }

    async fn run_job(&self, job: &ScheduledJob, now_ms: u64) -> bool {
        let _bracket = self.coordinator.begin();
        let conversation_id = job.conversation_id.unwrap_or(self.default_conversation_id);

        let mut message = scheduled_prompt(&job.prompt);
        if let Some(snapshot) = self.snapshots.dequeue_for_job(&job.id) {
            message.push_str(&snapshot_section(&snapshot));
        }

        let input = RunInput {
            message,
            conversation_id,
            sender: "scheduler".to_string(),
            origin: RunOrigin::Scheduled,
        };
        let sink = self.bridge.sink(conversation_id, job.is_silent());

        let primary = self.router.active_id();
        info!(job_id = %job.id, driver = %primary, "firing scheduled job");
        let result = match self
            .router
            .run_message(primary, input.clone(), Arc::clone(&sink))
            .await
        {
            Err(err) if err.is_quota_or_limit() => {
                // Quota classification exists for exactly this decision: a
                // background run gets one shot on the alternate backend.
                warn!(
                    job_id = %job.id,
                    driver = %primary,
                    error = %err,
                    "background run hit a usage limit; failing over"
                );
                self.router.run_message(primary.other(), input, sink).await
            }
            other => other,
        };

        match result {
            // A preempted run may still unwind as a success carrying partial
            // output; the job hasn't really run, so it stays due.
            Ok(_) if self.coordinator.was_preempted() => {
                debug!(job_id = %job.id, "scheduled job preempted; leaving it due");
                false
            }
            Ok(response) => {
                info!(
                    target: "audit",
                    job_id = %job.id,
                    response_len = response.len(),
                    "scheduled job completed"
                );
                self.settle_job(job, now_ms);
                true
            }
            Err(err) if err.is_cancellation() => {
                // Preempted or stopped: end quietly, leave the job due.
                debug!(job_id = %job.id, "scheduled job cancelled");
                false
            }
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "scheduled job failed; leaving it due");
                false
            }
        }
    }

    fn settle_job(&self, job: &ScheduledJob, now_ms: u64) {
        let settled = match job.kind {
            JobKind::Recurring => self.jobs.advance_recurring(&job.id, now_ms),
            JobKind::OneShot => self.jobs.remove(&job.id),
        };
        if let Err(err) = settled {
            warn!(job_id = %job.id, error = %err, "failed to persist job settlement");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tempfile::tempdir;

    use tether_driver::DriverId;

    use crate::error::{Error, Result};
    use crate::gate::{ProcessingGuard, RunGate, StopSignal};
    use crate::jobs::NewJob;
    use crate::preferences::PreferenceStore;
    use crate::router::{Driver, DriverStatus};
    use crate::snapshots::{ContextBundle, NewSnapshot};
    use crate::stream::{NullSink, StatusSink};

    struct ScriptedDriver {
        id: DriverId,
        gate: Arc<RunGate>,
        script: Mutex<VecDeque<Result<String>>>,
        messages: Mutex<Vec<String>>,
        kills: AtomicU32,
    }

    impl ScriptedDriver {
        fn new(id: DriverId, script: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                id,
                gate: Arc::new(RunGate::new()),
                script: Mutex::new(script.into()),
                messages: Mutex::new(Vec::new()),
                kills: AtomicU32::new(0),
            })
        }

        fn messages(&self) -> Vec<String> {
            self.messages.lock().expect("messages lock").clone()
        }
    }

    #[async_trait]
    impl Driver for ScriptedDriver {
        fn id(&self) -> DriverId {
            self.id
        }

        fn display_name(&self) -> &str {
            "Scripted"
        }

        async fn run_message(
            &self,
            input: RunInput,
            _sink: Arc<dyn StatusSink>,
        ) -> Result<String> {
            self.messages
                .lock()
                .expect("messages lock")
                .push(input.message);
            self.script
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or_else(|| Ok("done".to_string()))
        }

        async fn stop(&self) -> StopSignal {
            self.gate.stop()
        }

        async fn kill(&self) {
            self.kills.fetch_add(1, Ordering::SeqCst);
        }

        fn is_busy(&self) -> bool {
            self.gate.is_busy()
        }

        fn begin_processing(&self) -> ProcessingGuard {
            self.gate.begin_processing()
        }

        fn status(&self) -> DriverStatus {
            DriverStatus {
                driver: self.id,
                display_name: "Scripted".to_string(),
                is_active: false,
                resume_handle: None,
                title: None,
                last_activity: None,
                last_error: None,
                last_error_at: None,
                last_usage: None,
            }
        }
    }

    struct SilentBridge;

    #[async_trait]
    impl FrontendBridge for SilentBridge {
        fn sink(&self, _conversation_id: i64, _silent: bool) -> Arc<dyn StatusSink> {
            Arc::new(NullSink)
        }
        async fn notify(&self, _conversation_id: i64, _text: String) {}
    }

    struct Fixture {
        scheduler: Scheduler,
        jobs: Arc<ScheduledJobStore>,
        snapshots: Arc<SnapshotPrepQueue>,
        claude: Arc<ScriptedDriver>,
        codex: Arc<ScriptedDriver>,
        _dir: tempfile::TempDir,
    }

    fn fixture(claude: Arc<ScriptedDriver>, codex: Arc<ScriptedDriver>) -> Fixture {
        let dir = tempdir().expect("tempdir");
        let prefs = Arc::new(PreferenceStore::load(dir.path().join("preferences.json")));
        let router = Arc::new(DriverRouter::new(
            prefs,
            Arc::clone(&claude) as Arc<dyn Driver>,
            Arc::clone(&codex) as Arc<dyn Driver>,
        ));
        let jobs = Arc::new(ScheduledJobStore::new(dir.path().join("jobs.json")));
        let snapshots = Arc::new(SnapshotPrepQueue::new());
        let scheduler = Scheduler::new(
            router,
            Arc::clone(&jobs),
            Arc::clone(&snapshots),
            Arc::new(BackgroundRunCoordinator::new()),
            Arc::new(SilentBridge),
            7,
        );
        Fixture {
            scheduler,
            jobs,
            snapshots,
            claude,
            codex,
            _dir: dir,
        }
    }

    fn due_job(jobs: &ScheduledJobStore, prompt: &str, kind: JobKind) -> ScheduledJob {
        jobs.add(
            NewJob {
                prompt: prompt.to_string(),
                conversation_id: None,
                kind,
                delay_ms: None,
                interval_ms: matches!(kind, JobKind::Recurring).then_some(60_000),
                silent: false,
            },
            0,
        )
        .expect("add job")
    }

    #[test]
    fn scheduled_notice_is_injected_exactly_once() {
        let tagged = scheduled_prompt("check the build");
        assert!(tagged.starts_with(SCHEDULED_NOTICE));
        assert_eq!(scheduled_prompt(&tagged), tagged);
    }

    #[tokio::test]
    async fn recurring_job_fires_and_reschedules_from_now() {
        let fx = fixture(
            ScriptedDriver::new(DriverId::Claude, vec![]),
            ScriptedDriver::new(DriverId::Codex, vec![]),
        );
        let job = due_job(&fx.jobs, "check the build", JobKind::Recurring);

        let now = 500_000;
        assert_eq!(fx.scheduler.fire_due_jobs(now).await, 1);

        let messages = fx.claude.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with(SCHEDULED_NOTICE));
        assert!(messages[0].contains("check the build"));

        let reloaded = fx.jobs.jobs();
        assert_eq!(reloaded[0].id, job.id);
        assert_eq!(reloaded[0].fire_at, now + 60_000);
    }

    #[tokio::test]
    async fn one_shot_job_is_removed_after_success() {
        let fx = fixture(
            ScriptedDriver::new(DriverId::Claude, vec![]),
            ScriptedDriver::new(DriverId::Codex, vec![]),
        );
        due_job(&fx.jobs, "remind me", JobKind::OneShot);

        assert_eq!(fx.scheduler.fire_due_jobs(1_000).await, 1);
        assert!(fx.jobs.jobs().is_empty());
    }

    #[tokio::test]
    async fn busy_engine_skips_the_whole_tick() {
        let fx = fixture(
            ScriptedDriver::new(DriverId::Claude, vec![]),
            ScriptedDriver::new(DriverId::Codex, vec![]),
        );
        due_job(&fx.jobs, "later", JobKind::OneShot);

        let _held = fx.claude.gate.acquire_or_fail().expect("acquire");
        assert_eq!(fx.scheduler.fire_due_jobs(1_000).await, 0);
        assert!(fx.claude.messages().is_empty());
        assert_eq!(fx.jobs.jobs().len(), 1, "job must stay due");
    }

    #[tokio::test]
    async fn quota_failure_fails_over_to_the_alternate_backend() {
        let fx = fixture(
            ScriptedDriver::new(
                DriverId::Claude,
                vec![Err(Error::QuotaOrLimit {
                    message: "usage limit reached".to_string(),
                })],
            ),
            ScriptedDriver::new(DriverId::Codex, vec![]),
        );
        due_job(&fx.jobs, "check the build", JobKind::OneShot);

        assert_eq!(fx.scheduler.fire_due_jobs(1_000).await, 1);
        assert_eq!(fx.claude.messages().len(), 1);
        assert_eq!(fx.codex.messages().len(), 1, "alternate backend ran");
        assert!(fx.jobs.jobs().is_empty());
    }

    #[tokio::test]
    async fn failed_job_stays_due_for_the_next_tick() {
        let fx = fixture(
            ScriptedDriver::new(
                DriverId::Claude,
                vec![Err(Error::Unknown("backend hiccup".to_string()))],
            ),
            ScriptedDriver::new(DriverId::Codex, vec![]),
        );
        due_job(&fx.jobs, "flaky", JobKind::OneShot);

        assert_eq!(fx.scheduler.fire_due_jobs(1_000).await, 0);
        assert_eq!(fx.jobs.jobs().len(), 1);
        assert!(fx.codex.messages().is_empty(), "no failover on non-quota errors");
    }

    #[tokio::test]
    async fn cancelled_job_ends_quietly_and_stays_due() {
        let fx = fixture(
            ScriptedDriver::new(DriverId::Claude, vec![Err(Error::Cancelled)]),
            ScriptedDriver::new(DriverId::Codex, vec![]),
        );
        due_job(&fx.jobs, "interrupted", JobKind::OneShot);

        assert_eq!(fx.scheduler.fire_due_jobs(1_000).await, 0);
        assert_eq!(fx.jobs.jobs().len(), 1);
    }

    #[tokio::test]
    async fn prepared_snapshot_context_rides_along_with_the_prompt() {
        let fx = fixture(
            ScriptedDriver::new(DriverId::Claude, vec![]),
            ScriptedDriver::new(DriverId::Codex, vec![]),
        );
        let job = due_job(&fx.jobs, "supervise the worker", JobKind::Recurring);
        fx.snapshots.enqueue(NewSnapshot {
            job_id: job.id.clone(),
            monitored_task_id: "web-ui".to_string(),
            prepared_at_ms: 900,
            bundle: ContextBundle {
                status_output: "worker: running".to_string(),
                state_excerpt: "phase: deploy".to_string(),
                activity_log: "14:02 restarted".to_string(),
                endpoint_url: Some("http://localhost:3000".to_string()),
            },
            prep_errors: vec!["log tail truncated".to_string()],
        });

        assert_eq!(fx.scheduler.fire_due_jobs(1_000).await, 1);
        let message = &fx.claude.messages()[0];
        assert!(message.contains("task web-ui, snapshot #1"));
        assert!(message.contains("worker: running"));
        assert!(message.contains("phase: deploy"));
        assert!(message.contains("http://localhost:3000"));
        assert!(message.contains("log tail truncated"));
        assert!(fx.snapshots.is_empty(), "attached snapshot is consumed");
    }
}
