//! Reload signalling for managed applications.
//!
//! The application watches a signal file; rewriting it announces that a new
//! release is fully materialized.

use std::path::{Path, PathBuf};

use cfgsync_events::ReleaseDescriptor;
use cfgsync_id::{AppId, ReleaseId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Signal file format version.
pub const SIGNAL_VERSION: &str = "1.0";

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("failed to write reload signal {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode reload signal: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Contents of the reload signal file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadSignal {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub app_id: AppId,
    pub release_id: ReleaseId,
    /// Absolute path of the release's content root.
    pub root_directory: PathBuf,
    /// Item paths relative to `root_directory`.
    pub config_item: Vec<PathBuf>,
}

impl ReloadSignal {
    pub fn new(release: &ReleaseDescriptor, content_root: &Path) -> Self {
        let root_directory =
            std::path::absolute(content_root).unwrap_or_else(|_| content_root.to_path_buf());
        Self {
            version: SIGNAL_VERSION.to_string(),
            timestamp: Utc::now(),
            app_id: release.app_id,
            release_id: release.release_id,
            root_directory,
            config_item: release
                .content_items
                .iter()
                .map(|item| item.relative_path())
                .collect(),
        }
    }
}

/// How an application learns about a new release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadMechanism {
    /// Rewrite a JSON signal file.
    File { signal_path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct ReloadNotifier {
    mechanism: ReloadMechanism,
}

impl ReloadNotifier {
    pub fn new(mechanism: ReloadMechanism) -> Self {
        Self { mechanism }
    }

    pub fn file(signal_path: impl Into<PathBuf>) -> Self {
        Self::new(ReloadMechanism::File {
            signal_path: signal_path.into(),
        })
    }

    /// Announce that `release` is in place under `content_root`.
    pub async fn notify_reload(
        &self,
        correlation: &str,
        release: &ReleaseDescriptor,
        content_root: &Path,
    ) -> Result<(), ReloadError> {
        match &self.mechanism {
            ReloadMechanism::File { signal_path } => {
                let signal = ReloadSignal::new(release, content_root);
                let body = serde_json::to_vec_pretty(&signal)?;

                let io = |source| ReloadError::Io {
                    path: signal_path.clone(),
                    source,
                };
                if let Some(parent) = signal_path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(io)?;
                }
                tokio::fs::write(signal_path, body).await.map_err(io)?;

                info!(
                    correlation = %correlation,
                    app_id = %release.app_id,
                    release_id = %release.release_id,
                    path = %signal_path.display(),
                    "Reload signal written"
                );
                Ok(())
            }
        }
    }
}
