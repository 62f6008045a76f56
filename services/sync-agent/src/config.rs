//! Configuration for the sync agent.
//!
//! Configuration comes from an optional TOML file (`CFGSYNC_CONFIG`) with
//! environment variables layered on top. Every field has a default so a bare
//! `CFGSYNC_APPS=42` is enough to run.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use cfgsync_id::AppId;
use serde::Deserialize;

use crate::retry::RetryPolicy;

/// Limiter weights outside this range are rejected.
pub const LIMITER_WEIGHT_RANGE: std::ops::RangeInclusive<u32> = 1..=64;

/// Sync agent configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory; per-app workspaces and signal files default under it.
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Applications managed by this agent.
    pub apps: Vec<AppConfig>,

    /// Download tuning.
    pub download: DownloadConfig,

    /// Credentials for the HTTP blob repository.
    pub repository: RepositoryAuth,

    /// Object storage backend, if any release uses it.
    pub object_store: Option<ObjectStoreConfig>,

    /// Default retry budget for release jobs.
    pub retry: RetryConfig,

    /// Release directories kept per application after a successful apply.
    pub keep_releases: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/cfgsync"),
            log_level: "info".to_string(),
            apps: Vec::new(),
            download: DownloadConfig::default(),
            repository: RepositoryAuth::default(),
            object_store: None,
            retry: RetryConfig::default(),
            keep_releases: 5,
        }
    }
}

/// One managed application.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_id: AppId,

    /// Workspace root; defaults to `<data_dir>/apps/<app_id>`.
    #[serde(default)]
    pub root_dir: Option<PathBuf>,

    /// Reload signal file; defaults to `<data_dir>/signals/<app_id>.json`.
    #[serde(default)]
    pub signal_path: Option<PathBuf>,

    /// Pending job capacity (at least 2).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    5
}

impl AppConfig {
    /// Creates an app entry with default paths and capacity.
    pub fn new(app_id: AppId) -> Self {
        Self {
            app_id,
            root_dir: None,
            signal_path: None,
            queue_capacity: default_queue_capacity(),
        }
    }

    /// Resolved workspace root.
    pub fn root_dir(&self, data_dir: &Path) -> PathBuf {
        self.root_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("apps").join(self.app_id.to_string()))
    }

    /// Resolved reload signal path.
    pub fn signal_path(&self, data_dir: &Path) -> PathBuf {
        self.signal_path.clone().unwrap_or_else(|| {
            data_dir
                .join("signals")
                .join(format!("{}.json", self.app_id))
        })
    }
}

/// Download tuning shared by all backends.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Items smaller than this are fetched with a single request.
    pub direct_threshold_bytes: u64,

    /// Size of each range part for larger items.
    pub part_size_bytes: u64,

    /// Permits in the fetcher-wide transfer limiter.
    pub limiter_weight: u32,

    /// Content items downloaded at once within one release.
    pub item_concurrency: usize,

    /// Readiness checks run at once.
    pub readiness_concurrency: usize,

    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,

    /// How long an attempt waits for the release's advisory lock.
    pub lock_timeout_ms: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        let threshold = 5 * 1024 * 1024;
        Self {
            direct_threshold_bytes: threshold,
            part_size_bytes: 4 * threshold,
            limiter_weight: 10,
            item_concurrency: 5,
            readiness_concurrency: 5,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 300_000,
            lock_timeout_ms: 15_000,
        }
    }
}

impl DownloadConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Basic-auth credentials for the HTTP blob repository.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct RepositoryAuth {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for RepositoryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryAuth")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Object storage endpoint and credential.
#[derive(Clone, Deserialize)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_token: String,
}

impl std::fmt::Debug for ObjectStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreConfig")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Default retry budget.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            min_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Builds a fresh policy from these bounds.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.min_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

impl Config {
    /// Load configuration from `CFGSYNC_CONFIG` (if set) and environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("CFGSYNC_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };

        if let Ok(dir) = std::env::var("CFGSYNC_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Ok(level) = std::env::var("CFGSYNC_LOG_LEVEL") {
            config.log_level = level;
        }

        if let Ok(apps) = std::env::var("CFGSYNC_APPS") {
            for raw in apps.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let app_id: AppId = raw
                    .parse()
                    .with_context(|| format!("invalid app id '{raw}' in CFGSYNC_APPS"))?;
                if !config.apps.iter().any(|a| a.app_id == app_id) {
                    config.apps.push(AppConfig::new(app_id));
                }
            }
        }

        if let Ok(user) = std::env::var("CFGSYNC_REPO_USERNAME") {
            config.repository.username = Some(user);
        }
        if let Ok(password) = std::env::var("CFGSYNC_REPO_PASSWORD") {
            config.repository.password = Some(password);
        }

        if let Some(weight) = std::env::var("CFGSYNC_DOWNLOAD_WEIGHT")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            config.download.limiter_weight = weight;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents).context("invalid config TOML")?;
        Ok(config)
    }

    /// Reject combinations the agent cannot run with.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for app in &self.apps {
            ensure!(seen.insert(app.app_id), "duplicate app id {}", app.app_id);
            ensure!(
                app.queue_capacity >= 2,
                "app {} queue capacity must be at least 2",
                app.app_id
            );
        }

        let download = &self.download;
        if !LIMITER_WEIGHT_RANGE.contains(&download.limiter_weight) {
            bail!(
                "download limiter weight {} outside {:?}",
                download.limiter_weight,
                LIMITER_WEIGHT_RANGE
            );
        }
        ensure!(
            download.direct_threshold_bytes > 0,
            "direct threshold must be positive"
        );
        ensure!(
            download.part_size_bytes >= download.direct_threshold_bytes,
            "part size must not be smaller than the direct threshold"
        );
        ensure!(
            download.item_concurrency > 0 && download.readiness_concurrency > 0,
            "concurrency limits must be positive"
        );
        ensure!(
            download.connect_timeout_ms > 0
                && download.request_timeout_ms > 0
                && download.lock_timeout_ms > 0,
            "timeouts must be positive"
        );

        ensure!(self.retry.max_attempts > 0, "retry max_attempts must be positive");
        ensure!(self.retry.min_backoff_ms > 0, "retry min backoff must be positive");
        ensure!(
            self.retry.min_backoff_ms <= self.retry.max_backoff_ms,
            "retry min backoff exceeds max backoff"
        );
        ensure!(self.keep_releases > 0, "keep_releases must be positive");

        Ok(())
    }
}
