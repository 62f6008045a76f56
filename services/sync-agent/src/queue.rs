//! Per-application bounded job queue.
//!
//! Only the head (the job being applied) and the second entry (the job that
//! will supersede it) matter to the runtime. When full, the second entry is
//! evicted so the head keeps running and the newest job always gets in.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use cfgsync_id::JobId;
use tokio::sync::mpsc;
use tracing::debug;

use crate::job::{Job, JobContext, JobError};
use crate::retry::RetryPolicy;

/// Smallest usable capacity: a running head plus one successor.
pub const MIN_QUEUE_CAPACITY: usize = 2;

/// Result of a successful push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    pub job_id: JobId,
    /// Job dropped to make room; its token has been cancelled.
    pub evicted: Option<JobId>,
}

pub struct JobQueue {
    capacity: usize,
    jobs: Mutex<VecDeque<Arc<Job>>>,
    notify_tx: mpsc::Sender<()>,
    notify_rx: Mutex<Option<mpsc::Receiver<()>>>,
    default_retry: RetryPolicy,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    pub fn new(capacity: usize, default_retry: RetryPolicy) -> Result<Self, JobError> {
        if capacity < MIN_QUEUE_CAPACITY {
            return Err(JobError::Capacity(capacity));
        }
        let (notify_tx, notify_rx) = mpsc::channel(capacity + 2);
        Ok(Self {
            capacity,
            jobs: Mutex::new(VecDeque::with_capacity(capacity)),
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
            default_retry,
        })
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<Job>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate and enqueue a job, evicting the second entry when full.
    pub fn push(&self, context: JobContext) -> Result<PushOutcome, JobError> {
        let job = Arc::new(Job::from_context(context, &self.default_retry)?);
        let job_id = job.id();

        let evicted = {
            let mut jobs = self.jobs();
            let evicted = if jobs.len() >= self.capacity {
                jobs.remove(1)
            } else {
                None
            };
            jobs.push_back(job);
            evicted
        };

        if let Some(old) = &evicted {
            old.cancel();
            debug!(job_id = %old.id(), "Evicted pending job");
        }

        // A full channel already guarantees a wake-up.
        let _ = self.notify_tx.try_send(());

        Ok(PushOutcome {
            job_id,
            evicted: evicted.map(|j| j.id()),
        })
    }

    /// True when a successor is waiting behind the head.
    pub fn have_more(&self) -> bool {
        self.jobs().len() >= 2
    }

    pub fn current(&self) -> Option<Arc<Job>> {
        self.jobs().front().cloned()
    }

    pub fn next(&self) -> Option<Arc<Job>> {
        self.jobs().get(1).cloned()
    }

    /// Remove the head; no-op when empty.
    pub fn pop_current(&self) -> Option<Arc<Job>> {
        self.jobs().pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take the wake-up receiver. Only the first caller gets it.
    pub fn take_notifications(&self) -> Option<mpsc::Receiver<()>> {
        self.notify_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
