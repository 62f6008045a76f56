//! On-disk layout for an application's releases.
//!
//! ```text
//! <root>/<release_id>/configItems/<path>/<name>
//! <root>/<release_id>/file.lock
//! <root>/<release_id>/metadata.json
//! ```
//!
//! The lock file carries an advisory `flock` held for the duration of one
//! apply attempt. Other agents (or a later attempt of this one) poll for it.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use cfgsync_events::{ContentItemMeta, EventError, PlacementSpec, ReleaseDescriptor};
use cfgsync_id::ReleaseId;
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::unistd::{chown, Gid, Group, Uid, User};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Directory holding a release's materialized content.
pub const CONTENT_DIR: &str = "configItems";

/// Advisory lock file inside each release directory.
pub const LOCK_FILE: &str = "file.lock";

/// Metadata record written after a successful apply.
pub const METADATA_FILE: &str = "metadata.json";

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors from workspace operations.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to {op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {waited:?} waiting for lock {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("cancelled")]
    Cancelled,

    #[error("cannot set ownership of {}: {reason}", path.display())]
    Ownership { path: PathBuf, reason: String },

    #[error("invalid metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("invalid placement: {0}")]
    InvalidPlacement(#[from] EventError),

    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

fn io_error(op: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> WorkspaceError {
    let path = path.to_path_buf();
    move |source| WorkspaceError::Io { op, path, source }
}

/// Record describing a completed apply, stored as `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseMetadata {
    pub downloaded_at: DateTime<Utc>,
    /// Milliseconds spent on the successful attempt.
    pub cost_time: u64,
    /// The descriptor with transport secrets removed.
    pub release: ReleaseDescriptor,
}

impl ReleaseMetadata {
    pub fn new(release: &ReleaseDescriptor, cost: Duration) -> Self {
        Self {
            downloaded_at: Utc::now(),
            cost_time: cost.as_millis() as u64,
            release: release.without_secrets(),
        }
    }
}

/// Exclusive hold on a release directory. Unlocked on drop.
pub struct ReleaseLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl ReleaseLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for ReleaseLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseLock").field("path", &self.path).finish()
    }
}

/// Try once to take the lock; `Ok(None)` when someone else holds it.
fn try_lock_file(path: &Path) -> Result<Option<Flock<File>>, WorkspaceError> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(io_error("open lock file", path))?;

    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => Ok(Some(lock)),
        Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
        Err((_, errno)) => Err(WorkspaceError::Io {
            op: "lock",
            path: path.to_path_buf(),
            source: errno.into(),
        }),
    }
}

/// One application's release directories.
#[derive(Debug, Clone)]
pub struct ReleaseWorkspace {
    root: PathBuf,
}

impl ReleaseWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn release_dir(&self, release_id: ReleaseId) -> PathBuf {
        self.root.join(release_id.to_string())
    }

    /// Root under which content items are placed.
    pub fn content_root(&self, release_id: ReleaseId) -> PathBuf {
        self.release_dir(release_id).join(CONTENT_DIR)
    }

    /// Final location of one content item.
    pub fn item_path(&self, release_id: ReleaseId, item: &ContentItemMeta) -> PathBuf {
        self.content_root(release_id).join(item.relative_path())
    }

    pub fn lock_path(&self, release_id: ReleaseId) -> PathBuf {
        self.release_dir(release_id).join(LOCK_FILE)
    }

    pub fn metadata_path(&self, release_id: ReleaseId) -> PathBuf {
        self.release_dir(release_id).join(METADATA_FILE)
    }

    /// Create the release and content directories if missing.
    pub async fn ensure_release_dir(&self, release_id: ReleaseId) -> Result<PathBuf, WorkspaceError> {
        let content_root = self.content_root(release_id);
        tokio::fs::create_dir_all(&content_root)
            .await
            .map_err(io_error("create directory", &content_root))?;
        Ok(self.release_dir(release_id))
    }

    /// Acquire the release's advisory lock, polling until `timeout`.
    pub async fn lock(
        &self,
        release_id: ReleaseId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ReleaseLock, WorkspaceError> {
        let path = self.lock_path(release_id);
        let started = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Err(WorkspaceError::Cancelled);
            }
            if let Some(lock) = try_lock_file(&path)? {
                debug!(path = %path.display(), "Acquired release lock");
                return Ok(ReleaseLock { path, _lock: lock });
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(WorkspaceError::LockTimeout { path, waited });
            }

            let pause = LOCK_POLL_INTERVAL.min(timeout - waited);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(WorkspaceError::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    pub async fn write_metadata(
        &self,
        release_id: ReleaseId,
        metadata: &ReleaseMetadata,
    ) -> Result<(), WorkspaceError> {
        let path = self.metadata_path(release_id);
        let body = serde_json::to_vec_pretty(metadata)?;
        tokio::fs::write(&path, body)
            .await
            .map_err(io_error("write metadata", &path))
    }

    /// Read a release's metadata; `None` if it was never written.
    pub async fn read_metadata(
        &self,
        release_id: ReleaseId,
    ) -> Result<Option<ReleaseMetadata>, WorkspaceError> {
        let path = self.metadata_path(release_id);
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(Some(serde_json::from_slice(&body)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read metadata", &path)(e)),
        }
    }

    /// Remove the oldest release directories beyond `keep`.
    ///
    /// `protect` is never removed and does not count against `keep`'s
    /// ordering. Directories whose lock is held are skipped. Returns the
    /// releases that were removed.
    pub async fn prune(
        &self,
        keep: usize,
        protect: ReleaseId,
    ) -> Result<Vec<ReleaseId>, WorkspaceError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || prune_blocking(&root, keep, protect)).await?
    }

    /// Apply permission bits and ownership from the placement spec.
    pub async fn apply_placement(
        &self,
        path: &Path,
        placement: &PlacementSpec,
    ) -> Result<(), WorkspaceError> {
        if let Some(mode) = placement.mode()? {
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(io_error("set permissions on", path))?;
        }

        let user = placement.user.clone();
        let user_group = placement.user_group.clone();
        let target = path.to_path_buf();
        tokio::task::spawn_blocking(move || chown_blocking(&target, &user, &user_group)).await?
    }
}

/// Owner lookups read the user database and `chown` is a syscall; both block.
fn chown_blocking(path: &Path, user: &str, user_group: &str) -> Result<(), WorkspaceError> {
    let ownership = |reason: String| WorkspaceError::Ownership {
        path: path.to_path_buf(),
        reason,
    };
    let owner = resolve_owner(user).map_err(ownership)?;
    let group = resolve_group(user_group).map_err(ownership)?;

    if owner.is_some() || group.is_some() {
        chown(path, owner, group).map_err(|errno| ownership(errno.to_string()))?;
    }
    Ok(())
}

fn prune_blocking(
    root: &Path,
    keep: usize,
    protect: ReleaseId,
) -> Result<Vec<ReleaseId>, WorkspaceError> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error("list", root)(e)),
    };

    let mut releases: Vec<(ReleaseId, SystemTime, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_error("list", root))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(release_id) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse::<ReleaseId>().ok())
        else {
            continue;
        };
        if release_id == protect {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        releases.push((release_id, modified, path));
    }

    // Newest first; the protected release occupies one of the `keep` slots.
    releases.sort_by(|a, b| b.1.cmp(&a.1));
    let mut removed = Vec::new();
    for (release_id, _, path) in releases.into_iter().skip(keep.saturating_sub(1)) {
        let lock_path = path.join(LOCK_FILE);
        let guard = match try_lock_file(&lock_path) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                debug!(release_id = %release_id, "Release in use, not pruning");
                continue;
            }
            Err(e) => {
                warn!(release_id = %release_id, error = %e, "Cannot lock release for pruning");
                continue;
            }
        };

        std::fs::remove_dir_all(&path).map_err(io_error("remove", &path))?;
        drop(guard);
        info!(release_id = %release_id, "Pruned release directory");
        removed.push(release_id);
    }
    Ok(removed)
}

/// Numeric IDs are used as-is; names are looked up in the user database.
fn resolve_owner(spec: &str) -> Result<Option<Uid>, String> {
    let trimmed = spec.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if let Ok(id) = trimmed.parse::<u32>() {
        return Ok(Some(Uid::from_raw(id)));
    }
    match User::from_name(trimmed) {
        Ok(Some(user)) => Ok(Some(user.uid)),
        Ok(None) => Err(format!("user '{trimmed}' not found")),
        Err(e) => Err(format!("failed to resolve user '{trimmed}': {e}")),
    }
}

fn resolve_group(spec: &str) -> Result<Option<Gid>, String> {
    let trimmed = spec.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if let Ok(id) = trimmed.parse::<u32>() {
        return Ok(Some(Gid::from_raw(id)));
    }
    match Group::from_name(trimmed) {
        Ok(Some(group)) => Ok(Some(group.gid)),
        Ok(None) => Err(format!("group '{trimmed}' not found")),
        Err(e) => Err(format!("failed to resolve group '{trimmed}': {e}")),
    }
}
