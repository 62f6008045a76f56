//! Content fetching from remote stores.
//!
//! This module handles:
//! - Direct single-request transfers for small items
//! - Range-parallel transfers for large items against range-capable sources
//! - A whole-object backend for object storage
//!
//! Backends are resolved once at startup into a `FetcherTable` keyed by the
//! release's declared `StorageMode`.

mod http;
mod object;
mod range;

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use cfgsync_events::{RepositoryLocation, StorageMode, TlsMaterial};
use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

pub use http::{HttpFetcher, HttpFetcherConfig};
pub use object::ObjectStoreFetcher;
pub use range::{split_ranges, ByteRange};

use crate::config::Config;

/// Errors from fetch operations.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected status {status} from {url}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
    },

    #[error("size mismatch for {url}: expected {expected} bytes, source advertises {advertised}")]
    SizeMismatch {
        url: String,
        expected: u64,
        advertised: u64,
    },

    #[error("byte count mismatch: expected {expected} bytes, received {received}")]
    ByteCount { expected: u64, received: u64 },

    #[error("invalid TLS material: {0}")]
    Tls(String),

    #[error("invalid fetcher configuration: {0}")]
    InvalidConfig(String),

    #[error("no backend configured for storage mode {0}")]
    NoBackend(StorageMode),

    #[error("transfer task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("download limiter closed")]
    LimiterClosed,

    #[error("download cancelled")]
    Cancelled,
}

/// One transfer: where to read from and where to write.
#[derive(Debug, Clone, Copy)]
pub struct DownloadRequest<'a> {
    /// Per-attempt correlation identifier, for logs only.
    pub correlation: &'a str,
    /// Backend-specific source address (URL or object key).
    pub source: &'a str,
    pub expected_size: u64,
    pub destination: &'a Path,
    pub tls: Option<&'a TlsMaterial>,
}

/// A storage backend able to materialize one content item.
///
/// On success the destination holds exactly `expected_size` bytes as streamed
/// from the source. On failure its contents are unspecified.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Resolve an item's repository path into this backend's source address.
    fn resolve_source(&self, repository: &RepositoryLocation, repository_path: &str) -> String;

    /// Download the source into the destination file, creating or truncating it.
    async fn download(
        &self,
        request: DownloadRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError>;
}

/// Backends by storage mode.
#[derive(Clone, Default)]
pub struct FetcherTable {
    backends: HashMap<StorageMode, Arc<dyn ContentFetcher>>,
}

impl FetcherTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the table from agent configuration.
    ///
    /// The HTTP repository backend is always present; object storage only
    /// when configured.
    pub fn from_config(config: &Config) -> Result<Self, FetchError> {
        let mut table = Self::new();

        let http = HttpFetcher::new(HttpFetcherConfig::from_config(config))?;
        table.insert(StorageMode::Repository, Arc::new(http));

        if let Some(object_store) = &config.object_store {
            let fetcher = ObjectStoreFetcher::new(
                object_store.clone(),
                config.download.limiter_weight,
                config.download.connect_timeout(),
                config.download.request_timeout(),
            )?;
            table.insert(StorageMode::ObjectStore, Arc::new(fetcher));
        }

        Ok(table)
    }

    pub fn insert(&mut self, mode: StorageMode, fetcher: Arc<dyn ContentFetcher>) {
        self.backends.insert(mode, fetcher);
    }

    pub fn get(&self, mode: StorageMode) -> Result<Arc<dyn ContentFetcher>, FetchError> {
        self.backends
            .get(&mode)
            .cloned()
            .ok_or(FetchError::NoBackend(mode))
    }
}

/// Race a fetch future against cancellation.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, FetchError>
where
    F: Future<Output = Result<T, FetchError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(FetchError::Cancelled),
        result = fut => result,
    }
}

/// Stream a response body into `file` at its current position.
///
/// Fails as soon as more than `expected` bytes arrive, and at the end if fewer
/// did.
pub(crate) async fn stream_body(
    response: reqwest::Response,
    file: &mut tokio::fs::File,
    expected: u64,
) -> Result<u64, FetchError> {
    let mut stream = response.bytes_stream();
    let mut received = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        received += chunk.len() as u64;
        if received > expected {
            return Err(FetchError::ByteCount { expected, received });
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    if received != expected {
        return Err(FetchError::ByteCount { expected, received });
    }
    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_reports_missing_backend() {
        let table = FetcherTable::new();
        let err = table.get(StorageMode::ObjectStore).err().unwrap();
        assert!(matches!(err, FetchError::NoBackend(StorageMode::ObjectStore)));
    }

    #[test]
    fn test_table_from_default_config() {
        let table = FetcherTable::from_config(&Config::default()).unwrap();
        assert_eq!(table.get(StorageMode::Repository).unwrap().name(), "http");
        assert!(table.get(StorageMode::ObjectStore).is_err());
    }

    #[tokio::test]
    async fn test_cancellable_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), FetchError> =
            cancellable(&cancel, std::future::pending()).await;
        assert!(matches!(result, Err(FetchError::Cancelled)));
    }
}
