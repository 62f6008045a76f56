//! One attempt at materializing a release.
//!
//! The attempt holds the release's advisory lock throughout. Items already
//! on disk with the right signature are reused; the rest are downloaded in
//! parallel, verified, and given their declared permissions. Only then is
//! the metadata record written and the application told to reload.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cfgsync_events::{ContentItemMeta, ReleaseDescriptor};
use cfgsync_id::ContentItemId;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::fetch::{ContentFetcher, DownloadRequest, FetchError, FetcherTable};
use crate::job::Job;
use crate::readiness::{file_signature, ReadinessChecker};
use crate::reload::{ReloadError, ReloadNotifier};
use crate::workspace::{ReleaseMetadata, ReleaseWorkspace, WorkspaceError};

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("reload failed: {0}")]
    Reload(#[from] ReloadError),

    #[error("signature mismatch for item {id}: expected {expected}, got {actual}")]
    Signature {
        id: ContentItemId,
        expected: String,
        actual: String,
    },

    #[error("item task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("cancelled")]
    Cancelled,
}

impl ApplyError {
    /// True when the attempt stopped because its job was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            ApplyError::Cancelled
                | ApplyError::Fetch(FetchError::Cancelled)
                | ApplyError::Workspace(WorkspaceError::Cancelled)
        )
    }
}

/// Summary of a successful attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub downloaded: usize,
    pub reused: usize,
    pub elapsed: Duration,
}

/// Tuning for the apply pipeline.
#[derive(Debug, Clone)]
pub struct ApplierConfig {
    /// Items downloaded at once.
    pub item_concurrency: usize,
    pub readiness_concurrency: usize,
    pub lock_timeout: Duration,
    /// Release directories kept after a successful apply.
    pub keep_releases: usize,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ApplierConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            item_concurrency: config.download.item_concurrency,
            readiness_concurrency: config.download.readiness_concurrency,
            lock_timeout: config.download.lock_timeout(),
            keep_releases: config.keep_releases,
        }
    }
}

/// Applies releases into one application's workspace.
pub struct ReleaseApplier {
    workspace: ReleaseWorkspace,
    fetchers: Arc<FetcherTable>,
    readiness: ReadinessChecker,
    notifier: ReloadNotifier,
    config: ApplierConfig,
}

impl ReleaseApplier {
    pub fn new(
        workspace: ReleaseWorkspace,
        fetchers: Arc<FetcherTable>,
        notifier: ReloadNotifier,
        config: ApplierConfig,
    ) -> Self {
        Self {
            readiness: ReadinessChecker::new(config.readiness_concurrency),
            workspace,
            fetchers,
            notifier,
            config,
        }
    }

    pub fn workspace(&self) -> &ReleaseWorkspace {
        &self.workspace
    }

    /// Run one apply attempt for `job`.
    pub async fn apply(&self, job: &Job, correlation: &str) -> Result<ApplyOutcome, ApplyError> {
        let started = Instant::now();
        let release = job.release();
        let release_id = release.release_id;
        let cancel = job.cancel_token();

        self.workspace.ensure_release_dir(release_id).await?;
        let _lock = self
            .workspace
            .lock(release_id, self.config.lock_timeout, cancel)
            .await?;

        let content_root = self.workspace.content_root(release_id);
        let readiness = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ApplyError::Cancelled),
            checked = self.readiness.check(&content_root, &release.content_items) => checked?,
        };

        let (ready, pending): (Vec<&ContentItemMeta>, Vec<&ContentItemMeta>) = release
            .content_items
            .iter()
            .partition(|item| readiness.get(&item.id).copied().unwrap_or(false));

        for item in &ready {
            let path = self.workspace.item_path(release_id, item);
            self.workspace.apply_placement(&path, &item.placement).await?;
        }
        debug!(
            correlation = %correlation,
            ready = ready.len(),
            pending = pending.len(),
            "Readiness checked"
        );

        if !pending.is_empty() {
            let fetcher = self.fetchers.get(release.storage_mode)?;
            self.download_all(fetcher, release, pending.iter().copied(), cancel, correlation)
                .await?;
        }

        if cancel.is_cancelled() {
            return Err(ApplyError::Cancelled);
        }

        let elapsed = started.elapsed();
        self.workspace
            .write_metadata(release_id, &ReleaseMetadata::new(release, elapsed))
            .await?;
        self.notifier
            .notify_reload(correlation, release, &content_root)
            .await?;

        match self
            .workspace
            .prune(self.config.keep_releases, release_id)
            .await
        {
            Ok(removed) if !removed.is_empty() => {
                debug!(correlation = %correlation, removed = removed.len(), "Pruned old releases");
            }
            Ok(_) => {}
            Err(e) => warn!(correlation = %correlation, error = %e, "Release pruning failed"),
        }

        let outcome = ApplyOutcome {
            downloaded: pending.len(),
            reused: ready.len(),
            elapsed,
        };
        info!(
            correlation = %correlation,
            release_id = %release_id,
            downloaded = outcome.downloaded,
            reused = outcome.reused,
            duration_ms = elapsed.as_millis() as u64,
            "Release applied"
        );
        Ok(outcome)
    }

    async fn download_all<'a>(
        &self,
        fetcher: Arc<dyn ContentFetcher>,
        release: &Arc<ReleaseDescriptor>,
        items: impl Iterator<Item = &'a ContentItemMeta>,
        cancel: &CancellationToken,
        correlation: &str,
    ) -> Result<(), ApplyError> {
        let limiter = Arc::new(Semaphore::new(self.config.item_concurrency.max(1)));
        let items_cancel = cancel.child_token();
        let mut tasks = JoinSet::new();

        for item in items {
            let task = ItemDownload {
                fetcher: Arc::clone(&fetcher),
                workspace: self.workspace.clone(),
                release: Arc::clone(release),
                item: item.clone(),
                correlation: correlation.to_string(),
            };
            let limiter = Arc::clone(&limiter);
            let cancel = items_cancel.clone();

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ApplyError::Cancelled),
                    permit = limiter.acquire_owned() => permit.ok(),
                };
                task.run(&cancel).await
            });
        }

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined.map_err(ApplyError::from).and_then(|r| r) {
                items_cancel.cancel();
                if failure.is_none() {
                    failure = Some(e);
                }
            }
        }

        match failure {
            Some(_) if cancel.is_cancelled() => Err(ApplyError::Cancelled),
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Everything one item download task owns.
struct ItemDownload {
    fetcher: Arc<dyn ContentFetcher>,
    workspace: ReleaseWorkspace,
    release: Arc<ReleaseDescriptor>,
    item: ContentItemMeta,
    correlation: String,
}

impl ItemDownload {
    async fn run(self, cancel: &CancellationToken) -> Result<(), ApplyError> {
        let item = &self.item;
        let destination = self.workspace.item_path(self.release.release_id, item);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| WorkspaceError::Io {
                    op: "create directory",
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let source = self
            .fetcher
            .resolve_source(&self.release.repository, &item.repository_path);
        let request = DownloadRequest {
            correlation: &self.correlation,
            source: &source,
            expected_size: item.content.byte_size,
            destination: &destination,
            tls: self.release.repository.tls.as_ref(),
        };

        if let Err(e) = self.fetcher.download(request, cancel).await {
            if !matches!(e, FetchError::Cancelled) {
                warn!(
                    correlation = %self.correlation,
                    item_id = %item.id,
                    backend = self.fetcher.name(),
                    error = %e,
                    "Item download failed"
                );
            }
            return Err(e.into());
        }

        let actual = file_signature(&destination).await?;
        if !actual.eq_ignore_ascii_case(&item.content.signature) {
            return Err(ApplyError::Signature {
                id: item.id,
                expected: item.content.signature.clone(),
                actual,
            });
        }

        self.workspace
            .apply_placement(&destination, &item.placement)
            .await?;
        Ok(())
    }
}
