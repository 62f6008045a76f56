//! Entry point for upstream release events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cfgsync_events::ReleaseChangeEvent;
use cfgsync_id::{AppId, Cursor, JobId, ReleaseId};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::job::JobContext;
use crate::registry::AppRegistry;
use crate::retry::RetryPolicy;

/// Decodes release events into jobs and answers current-release queries.
pub struct Scheduler {
    registry: Arc<AppRegistry>,
    default_retry: RetryPolicy,
    next_job: AtomicU64,
}

impl Scheduler {
    pub fn new(registry: Arc<AppRegistry>, default_retry: RetryPolicy) -> Self {
        Self {
            registry,
            default_retry,
            next_job: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<AppRegistry> {
        &self.registry
    }

    /// Handle one encoded release-change event.
    ///
    /// Returns the ID of the queued job. Events that fail to decode or that
    /// name an unknown application are logged and dropped.
    pub fn on_release_change(&self, payload: &[u8]) -> Option<JobId> {
        let event = match ReleaseChangeEvent::decode(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable release event");
                return None;
            }
        };

        let app_id = event.payload.app_id;
        let release_id = event.payload.release_id;
        let job_id = match JobId::new(self.next_job.fetch_add(1, Ordering::Relaxed)) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Job identifier space exhausted");
                return None;
            }
        };

        let context = JobContext::release_change(
            job_id,
            event.event_id.clone(),
            event.cursor,
            Arc::new(event.payload),
        )
        .with_retry(self.default_retry.clone());

        match self.registry.push_job(app_id, context) {
            Ok(outcome) => {
                info!(
                    app_id = %app_id,
                    release_id = %release_id,
                    job_id = %job_id,
                    event_id = %event.event_id,
                    cursor = %event.cursor,
                    "Release change queued"
                );
                if let Some(evicted) = outcome.evicted {
                    debug!(app_id = %app_id, job_id = %evicted, "Pending job dropped by newer event");
                }
                Some(outcome.job_id)
            }
            Err(e) => {
                warn!(
                    app_id = %app_id,
                    event_id = %event.event_id,
                    error = %e,
                    "Release change rejected"
                );
                None
            }
        }
    }

    /// Applied release and cursor for `app_id`, if any.
    pub async fn current_release(&self, app_id: AppId) -> Option<(ReleaseId, Cursor)> {
        self.registry.current_release(app_id).await
    }

    /// Feed events from `events` until shutdown or the sender closes.
    pub async fn run(&self, mut events: mpsc::Receiver<Vec<u8>>, mut shutdown: watch::Receiver<bool>) {
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
                }
                event = events.recv() => match event {
                    Some(payload) => {
                        self.on_release_change(&payload);
                    }
                    None => {
                        debug!("Event source closed");
                        break;
                    }
                },
            }
        }
    }
}
