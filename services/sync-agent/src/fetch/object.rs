//! Object storage backend.
//!
//! Objects are read whole with one authenticated GET against
//! `{endpoint}/{bucket}/{key}`. There is no range support.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cfgsync_events::RepositoryLocation;
use reqwest::{Client, StatusCode};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::http::acquire_permit;
use super::{cancellable, stream_body, ContentFetcher, DownloadRequest, FetchError};
use crate::config::{ObjectStoreConfig, LIMITER_WEIGHT_RANGE};

pub struct ObjectStoreFetcher {
    config: ObjectStoreConfig,
    client: Client,
    limiter: Arc<Semaphore>,
}

impl ObjectStoreFetcher {
    pub fn new(
        config: ObjectStoreConfig,
        limiter_weight: u32,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, FetchError> {
        if !LIMITER_WEIGHT_RANGE.contains(&limiter_weight) {
            return Err(FetchError::InvalidConfig(format!(
                "limiter weight {limiter_weight} outside {LIMITER_WEIGHT_RANGE:?}"
            )));
        }
        if config.endpoint.trim().is_empty() || config.bucket.trim().is_empty() {
            return Err(FetchError::InvalidConfig(
                "object store endpoint and bucket are required".to_string(),
            ));
        }

        let client = Client::builder()
            .use_rustls_tls()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            config,
            client,
            limiter: Arc::new(Semaphore::new(limiter_weight as usize)),
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.bucket.trim_matches('/'),
            key.trim_start_matches('/')
        )
    }

    async fn fetch(&self, request: DownloadRequest<'_>) -> Result<(), FetchError> {
        let url = self.object_url(request.source);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.access_token)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(FetchError::Status {
                status: response.status(),
                url,
            });
        }

        let mut file = tokio::fs::File::create(request.destination).await?;
        stream_body(response, &mut file, request.expected_size).await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl ContentFetcher for ObjectStoreFetcher {
    fn name(&self) -> &str {
        "object_store"
    }

    /// The repository path is the object key; the release's repository root
    /// does not apply.
    fn resolve_source(&self, _repository: &RepositoryLocation, repository_path: &str) -> String {
        repository_path.to_string()
    }

    async fn download(
        &self,
        request: DownloadRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        let started = Instant::now();
        let _permit = acquire_permit(&self.limiter, cancel).await?;
        cancellable(cancel, self.fetch(request)).await?;

        info!(
            correlation = %request.correlation,
            bucket = %self.config.bucket,
            key = %request.source,
            size = request.expected_size,
            duration_ms = started.elapsed().as_millis() as u64,
            "Object downloaded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ObjectStoreConfig {
        ObjectStoreConfig {
            endpoint: "https://objects.example.com/".to_string(),
            bucket: "/releases/".to_string(),
            access_token: "token".to_string(),
        }
    }

    #[test]
    fn test_object_url() {
        let fetcher =
            ObjectStoreFetcher::new(config(), 2, Duration::from_secs(1), Duration::from_secs(1))
                .unwrap();
        assert_eq!(
            fetcher.object_url("/app/42/blob"),
            "https://objects.example.com/releases/app/42/blob"
        );
    }

    #[test]
    fn test_rejects_empty_bucket() {
        let mut cfg = config();
        cfg.bucket = String::new();
        assert!(
            ObjectStoreFetcher::new(cfg, 2, Duration::from_secs(1), Duration::from_secs(1))
                .is_err()
        );
    }
}
