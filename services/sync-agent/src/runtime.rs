//! Per-application control loop.
//!
//! Each application has one runtime task consuming its job queue. At most one
//! apply task is active per application; when a newer job arrives the active
//! one is cancelled and the new task waits for it to exit before starting, so
//! attempts never overlap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cfgsync_events::ReleaseDescriptor;
use cfgsync_id::{AppId, Cursor, ReleaseId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::job::Job;
use crate::pipeline::ReleaseApplier;
use crate::queue::JobQueue;

/// The release most recently applied for an application.
#[derive(Debug, Clone)]
pub struct CurrentRelease {
    /// Descriptor with transport secrets removed.
    pub release: Arc<ReleaseDescriptor>,
    pub cursor: Cursor,
    pub applied_at: DateTime<Utc>,
}

/// Runtime counters.
#[derive(Debug, Default)]
pub struct RuntimeStats {
    pub applied: AtomicU64,
    pub failed_attempts: AtomicU64,
    pub abandoned: AtomicU64,
    pub superseded: AtomicU64,
    pub skipped: AtomicU64,
}

/// Point-in-time copy of `RuntimeStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub applied: u64,
    pub failed_attempts: u64,
    pub abandoned: u64,
    pub superseded: u64,
    pub skipped: u64,
}

impl RuntimeStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// State shared between a runtime and its readers.
#[derive(Debug, Default)]
pub struct AppState {
    current: RwLock<Option<CurrentRelease>>,
    stats: RuntimeStats,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current(&self) -> Option<CurrentRelease> {
        self.current.read().await.clone()
    }

    /// Applied release ID and cursor, if anything was applied yet.
    pub async fn current_release(&self) -> Option<(ReleaseId, Cursor)> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|c| (c.release.release_id, c.cursor))
    }

    pub fn stats(&self) -> &RuntimeStats {
        &self.stats
    }

    async fn replace(&self, release: &ReleaseDescriptor, cursor: Cursor) {
        let next = CurrentRelease {
            release: Arc::new(release.without_secrets()),
            cursor,
            applied_at: Utc::now(),
        };
        *self.current.write().await = Some(next);
    }
}

/// The apply task currently owned by the control loop.
struct ActiveJob {
    job: Arc<Job>,
    handle: JoinHandle<()>,
}

impl ActiveJob {
    fn is(&self, job: &Arc<Job>) -> bool {
        Arc::ptr_eq(&self.job, job)
    }
}

/// One application's control loop.
#[derive(Clone)]
pub struct AppRuntime {
    app_id: AppId,
    queue: Arc<JobQueue>,
    state: Arc<AppState>,
    applier: Arc<ReleaseApplier>,
}

impl AppRuntime {
    pub fn new(
        app_id: AppId,
        queue: Arc<JobQueue>,
        state: Arc<AppState>,
        applier: Arc<ReleaseApplier>,
    ) -> Self {
        Self {
            app_id,
            queue,
            state,
            applier,
        }
    }

    pub fn app_id(&self) -> AppId {
        self.app_id
    }

    /// Run until shutdown is signalled or the queue goes away.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Some(mut notifications) = self.queue.take_notifications() else {
            error!(app_id = %self.app_id, "Job notifications already taken; runtime not started");
            return;
        };
        info!(app_id = %self.app_id, "App runtime started");

        let mut active: Option<ActiveJob> = None;
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                signal = notifications.recv() => {
                    if signal.is_none() {
                        break;
                    }
                }
            }
            self.on_notification(&mut active, &shutdown);
        }

        if let Some(active) = active {
            active.job.cancel();
            if let Err(e) = active.handle.await {
                warn!(app_id = %self.app_id, job_id = %active.job.id(), error = %e, "Apply task ended abnormally");
            }
        }
        info!(app_id = %self.app_id, "App runtime stopped");
    }

    fn on_notification(&self, active: &mut Option<ActiveJob>, shutdown: &watch::Receiver<bool>) {
        let stats = self.state.stats();

        if self.queue.have_more() {
            if let Some(next) = self.queue.next() {
                if !next.kind().is_supported() {
                    warn!(
                        app_id = %self.app_id,
                        job_id = %next.id(),
                        kind = %next.kind(),
                        "Unsupported job kind queued, not superseding"
                    );
                    RuntimeStats::bump(&stats.skipped);
                    return;
                }
            }

            if let Some(current) = self.queue.current() {
                current.cancel();
                let running = active
                    .as_ref()
                    .is_some_and(|a| a.is(&current) && !a.handle.is_finished());
                if running {
                    RuntimeStats::bump(&stats.superseded);
                    info!(app_id = %self.app_id, job_id = %current.id(), "Superseding running job");
                }
            }
            self.queue.pop_current();
        }

        let Some(current) = self.queue.current() else {
            return;
        };
        if active.as_ref().is_some_and(|a| a.is(&current)) {
            debug!(app_id = %self.app_id, job_id = %current.id(), "Job already started");
            return;
        }
        if !current.kind().is_supported() {
            warn!(
                app_id = %self.app_id,
                job_id = %current.id(),
                kind = %current.kind(),
                "Ignoring job of unsupported kind"
            );
            RuntimeStats::bump(&stats.skipped);
            return;
        }

        let previous = active.take().map(|a| a.handle);
        let span = info_span!(
            "release_job",
            app_id = %self.app_id,
            job_id = %current.id(),
            release_id = %current.release_id(),
            event_id = %current.event_id(),
        );
        let handle = tokio::spawn(
            self.clone()
                .loop_apply_release(Arc::clone(&current), previous, shutdown.clone())
                .instrument(span),
        );
        *active = Some(ActiveJob {
            job: current,
            handle,
        });
    }

    /// Drive one job to success, cancellation, shutdown or exhaustion.
    async fn loop_apply_release(
        self,
        job: Arc<Job>,
        previous: Option<JoinHandle<()>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if let Some(previous) = previous {
            if let Err(e) = previous.await {
                warn!(error = %e, "Previous apply task ended abnormally");
            }
        }

        let stats = self.state.stats();
        if self.state.current_release().await.map(|(id, _)| id) == Some(job.release_id()) {
            RuntimeStats::bump(&stats.skipped);
            info!("Release already applied, nothing to do");
            return;
        }

        let cancel = job.cancel_token().clone();
        let mut retry = job.retry_policy();
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                debug!("Job cancelled");
                return;
            }
            if *shutdown.borrow() {
                debug!("Shutdown observed, stopping job");
                return;
            }

            attempt += 1;
            let correlation = format!("{}-{}", job.id(), attempt);
            let span = info_span!("apply_attempt", correlation = %correlation, attempt);
            let result = self
                .applier
                .apply(&job, &correlation)
                .instrument(span)
                .await;

            let err = match result {
                Ok(_) => {
                    self.state.replace(job.release(), job.cursor()).await;
                    RuntimeStats::bump(&stats.applied);
                    info!(cursor = %job.cursor(), attempt, "Current release updated");
                    return;
                }
                Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
                    debug!("Attempt cancelled");
                    return;
                }
                Err(e) => e,
            };

            RuntimeStats::bump(&stats.failed_attempts);
            let Some(delay) = retry.record_failure() else {
                RuntimeStats::bump(&stats.abandoned);
                warn!(
                    attempts = retry.attempts(),
                    error = %err,
                    "Retry budget exhausted, abandoning job"
                );
                return;
            };

            warn!(
                correlation = %correlation,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "Apply attempt failed, will retry"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfgsync_events::{RepositoryLocation, StorageMode, TlsMaterial};

    #[tokio::test]
    async fn test_state_replace_strips_secrets() {
        let state = AppState::new();
        assert!(state.current_release().await.is_none());

        let release = ReleaseDescriptor {
            app_id: AppId::new(42).unwrap(),
            release_id: ReleaseId::new(7).unwrap(),
            storage_mode: StorageMode::Repository,
            repository: RepositoryLocation {
                root: "https://repo.example.com".to_string(),
                tls: Some(TlsMaterial::default()),
            },
            content_items: Vec::new(),
        };
        state.replace(&release, Cursor::new(9)).await;

        let (release_id, cursor) = state.current_release().await.unwrap();
        assert_eq!(release_id.get(), 7);
        assert_eq!(cursor, Cursor::new(9));
        assert!(state.current().await.unwrap().release.repository.tls.is_none());
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = RuntimeStats::default();
        RuntimeStats::bump(&stats.applied);
        RuntimeStats::bump(&stats.failed_attempts);
        RuntimeStats::bump(&stats.failed_attempts);
        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                applied: 1,
                failed_attempts: 2,
                ..Default::default()
            }
        );
    }
}
