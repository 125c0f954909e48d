//! Bounded queue of prepared background-check context bundles.
//!
//! Supervision jobs gather context (status output, state excerpts, recent
//! activity) ahead of time so the eventual prompt can be assembled without
//! re-running the collection. The queue is bounded two ways: each job keeps
//! at most its own most recent snapshots, and the whole queue is capped with
//! global-oldest eviction. Sequence numbers are per-job, strictly
//! increasing, and never reused, so a consumer can always tell how many
//! snapshots it missed.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Per-job retention.
const MAX_PER_JOB: usize = 20;
/// Whole-queue retention.
const MAX_TOTAL: usize = 200;

/// Context gathered for one background check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextBundle {
    pub status_output: String,
    pub state_excerpt: String,
    pub activity_log: String,
    pub endpoint_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedSnapshot {
    pub job_id: String,
    pub monitored_task_id: String,
    /// Per-job monotonic sequence number, starting at 1.
    pub seq: u64,
    pub prepared_at_ms: u64,
    pub bundle: ContextBundle,
    pub prep_errors: Vec<String>,
}

/// Snapshot fields supplied by the preparer; the queue assigns `seq`.
#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub job_id: String,
    pub monitored_task_id: String,
    pub prepared_at_ms: u64,
    pub bundle: ContextBundle,
    pub prep_errors: Vec<String>,
}

#[derive(Debug, Default)]
struct QueueInner {
    queue: VecDeque<PreparedSnapshot>,
    seq_by_job: HashMap<String, u64>,
}

#[derive(Debug, Default)]
pub struct SnapshotPrepQueue {
    inner: Mutex<QueueInner>,
}

impl SnapshotPrepQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, input: NewSnapshot) -> PreparedSnapshot {
        let mut inner = self.lock();

        // A job at capacity loses its own oldest entries, not someone
        // else's.
        while inner
            .queue
            .iter()
            .filter(|s| s.job_id == input.job_id)
            .count()
            >= MAX_PER_JOB
        {
            let Some(index) = inner.queue.iter().position(|s| s.job_id == input.job_id) else {
                break;
            };
            inner.queue.remove(index);
        }

        while inner.queue.len() >= MAX_TOTAL {
            inner.queue.pop_front();
        }

        let next_seq = inner.seq_by_job.entry(input.job_id.clone()).or_insert(0);
        *next_seq += 1;
        let seq = *next_seq;
        let snapshot = PreparedSnapshot {
            job_id: input.job_id,
            monitored_task_id: input.monitored_task_id,
            seq,
            prepared_at_ms: input.prepared_at_ms,
            bundle: input.bundle,
            prep_errors: input.prep_errors,
        };
        inner.queue.push_back(snapshot.clone());
        snapshot
    }

    pub fn dequeue(&self) -> Option<PreparedSnapshot> {
        self.lock().queue.pop_front()
    }

    /// Oldest retained snapshot for one job.
    pub fn dequeue_for_job(&self, job_id: &str) -> Option<PreparedSnapshot> {
        let mut inner = self.lock();
        let index = inner.queue.iter().position(|s| s.job_id == job_id)?;
        inner.queue.remove(index)
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.queue.clear();
        inner.seq_by_job.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(job_id: &str, at: u64) -> NewSnapshot {
        NewSnapshot {
            job_id: job_id.to_string(),
            monitored_task_id: "task-1".to_string(),
            prepared_at_ms: at,
            bundle: ContextBundle::default(),
            prep_errors: Vec::new(),
        }
    }

    #[test]
    fn per_job_cap_keeps_the_most_recent_twenty() {
        let queue = SnapshotPrepQueue::new();
        for i in 0..25 {
            queue.enqueue(snapshot("job-a", i));
        }
        assert_eq!(queue.len(), 20);
        let first = queue.dequeue_for_job("job-a").expect("snapshot");
        // Sequences 1..=5 were evicted; numbering never restarts.
        assert_eq!(first.seq, 6);
    }

    #[test]
    fn per_job_eviction_spares_other_jobs() {
        let queue = SnapshotPrepQueue::new();
        queue.enqueue(snapshot("job-b", 0));
        for i in 0..MAX_PER_JOB as u64 + 3 {
            queue.enqueue(snapshot("job-a", i));
        }
        assert_eq!(queue.len(), MAX_PER_JOB + 1);
        assert_eq!(queue.dequeue().expect("oldest").job_id, "job-b");
    }

    #[test]
    fn global_cap_evicts_the_globally_oldest() {
        let queue = SnapshotPrepQueue::new();
        for job in 0..MAX_TOTAL / MAX_PER_JOB {
            for i in 0..MAX_PER_JOB as u64 {
                queue.enqueue(snapshot(&format!("job-{job}"), i));
            }
        }
        assert_eq!(queue.len(), MAX_TOTAL);

        queue.enqueue(snapshot("job-new", 0));
        assert_eq!(queue.len(), MAX_TOTAL);
        // job-0's oldest fell off the global end.
        let survivor = queue.dequeue_for_job("job-0").expect("snapshot");
        assert_eq!(survivor.seq, 2);
    }

    #[test]
    fn sequences_are_independent_per_job() {
        let queue = SnapshotPrepQueue::new();
        assert_eq!(queue.enqueue(snapshot("a", 0)).seq, 1);
        assert_eq!(queue.enqueue(snapshot("b", 0)).seq, 1);
        assert_eq!(queue.enqueue(snapshot("a", 1)).seq, 2);
    }

    #[test]
    fn clear_resets_contents_and_sequences() {
        let queue = SnapshotPrepQueue::new();
        queue.enqueue(snapshot("a", 0));
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.enqueue(snapshot("a", 1)).seq, 1);
    }
}
