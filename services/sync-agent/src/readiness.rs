//! Detection of content already materialized on disk.
//!
//! An item is ready when its target file exists with the expected size and
//! SHA-256 signature. Checks run in parallel under a small bound so that a
//! restarted agent can skip everything it already placed.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cfgsync_events::ContentItemMeta;
use cfgsync_id::ContentItemId;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::workspace::WorkspaceError;

/// Default number of concurrent checks.
pub const DEFAULT_READINESS_CONCURRENCY: usize = 5;

/// Hex SHA-256 of a file's contents.
pub async fn file_signature(path: &Path) -> Result<String, WorkspaceError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path).map_err(|source| WorkspaceError::Io {
            op: "open",
            path: path.clone(),
            source,
        })?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).map_err(|source| WorkspaceError::Io {
                op: "read",
                path: path.clone(),
                source,
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await?
}

/// Parallel readiness checks for one release.
#[derive(Debug, Clone)]
pub struct ReadinessChecker {
    concurrency: usize,
}

impl Default for ReadinessChecker {
    fn default() -> Self {
        Self::new(DEFAULT_READINESS_CONCURRENCY)
    }
}

impl ReadinessChecker {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Check every item under `content_root`.
    ///
    /// A missing file or wrong size means not ready. Any other I/O error
    /// aborts the whole batch.
    pub async fn check(
        &self,
        content_root: &Path,
        items: &[ContentItemMeta],
    ) -> Result<HashMap<ContentItemId, bool>, WorkspaceError> {
        let limiter = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for item in items {
            let path = content_root.join(item.relative_path());
            let id = item.id;
            let size = item.content.byte_size;
            let signature = item.content.signature.clone();
            let limiter = Arc::clone(&limiter);

            tasks.spawn(async move {
                // The semaphore is never closed while tasks run.
                let _permit = limiter.acquire_owned().await.ok();
                let ready = is_ready(path, size, &signature).await?;
                Ok::<_, WorkspaceError>((id, ready))
            });
        }

        let mut results = HashMap::with_capacity(items.len());
        while let Some(joined) = tasks.join_next().await {
            match joined? {
                Ok((id, ready)) => {
                    results.insert(id, ready);
                }
                Err(e) => {
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }
        Ok(results)
    }
}

async fn is_ready(path: PathBuf, size: u64, signature: &str) -> Result<bool, WorkspaceError> {
    let metadata = match tokio::fs::metadata(&path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(source) => {
            return Err(WorkspaceError::Io {
                op: "stat",
                path,
                source,
            })
        }
    };

    if !metadata.is_file() || metadata.len() != size {
        debug!(path = %path.display(), "Size mismatch, not ready");
        return Ok(false);
    }

    let actual = file_signature(&path).await?;
    Ok(actual.eq_ignore_ascii_case(signature))
}
