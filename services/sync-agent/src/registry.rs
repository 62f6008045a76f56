//! Per-application runtimes keyed by application ID.
//!
//! The registry is built once from configuration; the set of applications
//! does not change while the agent runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cfgsync_id::{AppId, Cursor, ReleaseId};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::fetch::{FetchError, FetcherTable};
use crate::job::{JobContext, JobError};
use crate::pipeline::{ApplierConfig, ReleaseApplier};
use crate::queue::{JobQueue, PushOutcome};
use crate::reload::ReloadNotifier;
use crate::runtime::{AppRuntime, AppState, StatsSnapshot};
use crate::workspace::ReleaseWorkspace;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown application {0}")]
    UnknownApp(AppId),

    #[error("job for application {actual} pushed to application {expected}")]
    AppMismatch { expected: AppId, actual: AppId },

    #[error("invalid job: {0}")]
    Job(#[from] JobError),

    #[error("fetcher setup failed: {0}")]
    Fetch(#[from] FetchError),
}

struct AppEntry {
    runtime: AppRuntime,
    queue: Arc<JobQueue>,
    state: Arc<AppState>,
}

pub struct AppRegistry {
    apps: HashMap<AppId, AppEntry>,
    started: AtomicBool,
}

impl AppRegistry {
    /// Build the registry and its fetcher table from configuration.
    pub fn from_config(config: &Config) -> Result<Self, RegistryError> {
        let fetchers = Arc::new(FetcherTable::from_config(config)?);
        Self::new(config, fetchers)
    }

    /// Build the registry around an existing fetcher table.
    pub fn new(config: &Config, fetchers: Arc<FetcherTable>) -> Result<Self, RegistryError> {
        let applier_config = ApplierConfig::from_config(config);
        let mut apps = HashMap::with_capacity(config.apps.len());

        for app in &config.apps {
            let workspace = ReleaseWorkspace::new(app.root_dir(&config.data_dir));
            let notifier = ReloadNotifier::file(app.signal_path(&config.data_dir));
            let applier = Arc::new(ReleaseApplier::new(
                workspace,
                Arc::clone(&fetchers),
                notifier,
                applier_config.clone(),
            ));
            let queue = Arc::new(JobQueue::new(app.queue_capacity, config.retry.policy())?);
            let state = Arc::new(AppState::new());
            let runtime = AppRuntime::new(
                app.app_id,
                Arc::clone(&queue),
                Arc::clone(&state),
                applier,
            );

            apps.insert(
                app.app_id,
                AppEntry {
                    runtime,
                    queue,
                    state,
                },
            );
        }

        Ok(Self {
            apps,
            started: AtomicBool::new(false),
        })
    }

    /// Spawn every application's control loop. Only the first call spawns.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("App registry already started");
            return Vec::new();
        }

        let handles: Vec<_> = self
            .apps
            .values()
            .map(|entry| tokio::spawn(entry.runtime.clone().run(shutdown.clone())))
            .collect();
        info!(apps = handles.len(), "App runtimes started");
        handles
    }

    pub fn have(&self, app_id: AppId) -> bool {
        self.apps.contains_key(&app_id)
    }

    /// Validate and enqueue a job for `app_id`.
    pub fn push_job(&self, app_id: AppId, context: JobContext) -> Result<PushOutcome, RegistryError> {
        let entry = self
            .apps
            .get(&app_id)
            .ok_or(RegistryError::UnknownApp(app_id))?;

        if let Some(release) = &context.release {
            if release.app_id != app_id {
                return Err(RegistryError::AppMismatch {
                    expected: app_id,
                    actual: release.app_id,
                });
            }
        }

        Ok(entry.queue.push(context)?)
    }

    /// Applied release and cursor for `app_id`, if any.
    pub async fn current_release(&self, app_id: AppId) -> Option<(ReleaseId, Cursor)> {
        self.apps.get(&app_id)?.state.current_release().await
    }

    pub fn stats(&self, app_id: AppId) -> Option<StatsSnapshot> {
        self.apps
            .get(&app_id)
            .map(|entry| entry.state.stats().snapshot())
    }

    /// Pending jobs for `app_id`, including the one being applied.
    pub fn queued(&self, app_id: AppId) -> Option<usize> {
        self.apps.get(&app_id).map(|entry| entry.queue.len())
    }

    /// Configured application IDs in ascending order.
    pub fn app_ids(&self) -> Vec<AppId> {
        let mut ids: Vec<_> = self.apps.keys().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use cfgsync_events::{ReleaseDescriptor, RepositoryLocation, StorageMode};
    use cfgsync_id::JobId;

    fn config() -> Config {
        let mut config = Config::default();
        config.data_dir = std::env::temp_dir().join("cfgsync-registry-test");
        config.apps.push(AppConfig::new(AppId::new(42).unwrap()));
        config.apps.push(AppConfig::new(AppId::new(7).unwrap()));
        config
    }

    fn context(app: u32) -> JobContext {
        let release = Arc::new(ReleaseDescriptor {
            app_id: AppId::new(app).unwrap(),
            release_id: ReleaseId::new(1).unwrap(),
            storage_mode: StorageMode::Repository,
            repository: RepositoryLocation {
                root: "https://repo.example.com".to_string(),
                tls: None,
            },
            content_items: Vec::new(),
        });
        JobContext::release_change(JobId::new(1).unwrap(), "evt", Cursor::new(1), release)
    }

    #[test]
    fn test_registry_lookup() {
        let registry = AppRegistry::from_config(&config()).unwrap();
        assert!(registry.have(AppId::new(42).unwrap()));
        assert!(!registry.have(AppId::new(43).unwrap()));
        assert_eq!(
            registry.app_ids(),
            vec![AppId::new(7).unwrap(), AppId::new(42).unwrap()]
        );
        assert_eq!(
            registry.stats(AppId::new(42).unwrap()),
            Some(StatsSnapshot::default())
        );
    }

    #[test]
    fn test_push_job_errors() {
        let registry = AppRegistry::from_config(&config()).unwrap();

        let err = registry
            .push_job(AppId::new(43).unwrap(), context(43))
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownApp(_)));

        let err = registry
            .push_job(AppId::new(42).unwrap(), context(7))
            .unwrap_err();
        assert!(matches!(err, RegistryError::AppMismatch { .. }));

        let mut ctx = context(42);
        ctx.cancel = None;
        let err = registry.push_job(AppId::new(42).unwrap(), ctx).unwrap_err();
        assert!(matches!(err, RegistryError::Job(JobError::Missing(_))));

        registry
            .push_job(AppId::new(42).unwrap(), context(42))
            .unwrap();
        assert_eq!(registry.queued(AppId::new(42).unwrap()), Some(1));
    }

    #[tokio::test]
    async fn test_current_release_empty_until_applied() {
        let registry = AppRegistry::from_config(&config()).unwrap();
        assert!(registry
            .current_release(AppId::new(42).unwrap())
            .await
            .is_none());
        assert!(registry
            .current_release(AppId::new(43).unwrap())
            .await
            .is_none());
    }
}
