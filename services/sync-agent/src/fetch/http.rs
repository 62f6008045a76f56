//! HTTP blob repository backend.
//!
//! Small items are fetched with one GET. Larger items are probed with HEAD;
//! when the source advertises `Accept-Ranges: bytes` the file is split into
//! parts fetched concurrently, each written at its own offset.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cfgsync_events::{RepositoryLocation, TlsMaterial};
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use reqwest::{Certificate, Client, Identity, RequestBuilder, StatusCode};
use sha2::{Digest, Sha256};
use tokio::io::AsyncSeekExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::range::{split_ranges, ByteRange};
use super::{cancellable, stream_body, ContentFetcher, DownloadRequest, FetchError};
use crate::config::{Config, LIMITER_WEIGHT_RANGE};

/// Configuration for the HTTP backend.
#[derive(Clone)]
pub struct HttpFetcherConfig {
    /// Items below this size skip the range probe.
    pub direct_threshold: u64,
    pub part_size: u64,
    /// Permits in the limiter shared by every transfer of this fetcher.
    pub limiter_weight: u32,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl std::fmt::Debug for HttpFetcherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcherConfig")
            .field("direct_threshold", &self.direct_threshold)
            .field("part_size", &self.part_size)
            .field("limiter_weight", &self.limiter_weight)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl HttpFetcherConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            direct_threshold: config.download.direct_threshold_bytes,
            part_size: config.download.part_size_bytes,
            limiter_weight: config.download.limiter_weight,
            connect_timeout: config.download.connect_timeout(),
            request_timeout: config.download.request_timeout(),
            username: config.repository.username.clone(),
            password: config.repository.password.clone(),
        }
    }
}

/// What a HEAD probe learned about a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Probe {
    accepts_ranges: bool,
    content_length: Option<u64>,
}

/// HTTP repository fetcher.
pub struct HttpFetcher {
    config: HttpFetcherConfig,
    limiter: Arc<Semaphore>,
    /// Client used when a release carries no TLS material.
    client: Client,
    /// Clients keyed by a digest of the release's TLS material.
    tls_clients: Mutex<HashMap<String, Client>>,
}

impl HttpFetcher {
    /// Create a new HTTP fetcher.
    pub fn new(config: HttpFetcherConfig) -> Result<Self, FetchError> {
        if !LIMITER_WEIGHT_RANGE.contains(&config.limiter_weight) {
            return Err(FetchError::InvalidConfig(format!(
                "limiter weight {} outside {:?}",
                config.limiter_weight, LIMITER_WEIGHT_RANGE
            )));
        }
        if config.direct_threshold == 0 || config.part_size == 0 {
            return Err(FetchError::InvalidConfig(
                "threshold and part size must be positive".to_string(),
            ));
        }

        let client = build_client(&config, None)?;
        let limiter = Arc::new(Semaphore::new(config.limiter_weight as usize));

        Ok(Self {
            config,
            limiter,
            client,
            tls_clients: Mutex::new(HashMap::new()),
        })
    }

    /// Permits currently free in the shared limiter.
    pub fn available_permits(&self) -> usize {
        self.limiter.available_permits()
    }

    fn client_for(&self, tls: Option<&TlsMaterial>) -> Result<Client, FetchError> {
        let Some(tls) = tls else {
            return Ok(self.client.clone());
        };

        let key = tls_key(tls);
        let mut clients = self
            .tls_clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        let client = build_client(&self.config, Some(tls))?;
        cache_client(&mut clients, key, client.clone());
        Ok(client)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.username {
            Some(user) => request.basic_auth(user, self.config.password.as_deref()),
            None => request,
        }
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit, FetchError> {
        acquire_permit(&self.limiter, cancel).await
    }

    async fn probe(&self, client: &Client, url: &str) -> Result<Probe, FetchError> {
        let response = self.authorize(client.head(url)).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                status: response.status(),
                url: url.to_string(),
            });
        }

        let headers = response.headers();
        let accepts_ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.split(',').any(|unit| unit.trim() == "bytes"));
        // Read the header directly; a HEAD body is always empty.
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());

        Ok(Probe {
            accepts_ranges,
            content_length,
        })
    }

    async fn download_direct(
        &self,
        client: &Client,
        url: &str,
        expected: u64,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        let _permit = self.acquire(cancel).await?;

        let response = self.authorize(client.get(url)).send().await?;
        if response.status() != StatusCode::OK {
            return Err(FetchError::Status {
                status: response.status(),
                url: url.to_string(),
            });
        }

        let mut file = tokio::fs::File::create(destination).await?;
        stream_body(response, &mut file, expected).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn download_ranged(
        &self,
        client: &Client,
        url: &str,
        expected: u64,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        {
            let file = tokio::fs::File::create(destination).await?;
            file.set_len(expected).await?;
        }

        let parts = split_ranges(expected, self.config.part_size);
        let parts_cancel = cancel.child_token();
        let mut tasks = JoinSet::new();

        for part in parts.iter().copied() {
            let request = self.authorize(client.get(url)).header(RANGE, part.header_value());
            let limiter = Arc::clone(&self.limiter);
            let destination = destination.to_path_buf();
            let url = url.to_string();
            let cancel = parts_cancel.clone();

            tasks.spawn(async move {
                let _permit = acquire_permit(&limiter, &cancel).await?;
                cancellable(&cancel, fetch_part(request, &url, part, &destination)).await
            });
        }

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(FetchError::from).and_then(|r| r);
            if let Err(e) = result {
                // Stop the remaining parts; the first error wins.
                parts_cancel.cancel();
                if failure.is_none() {
                    failure = Some(e);
                }
            }
        }

        if let Some(e) = failure {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            return Err(e);
        }

        tokio::fs::File::open(destination).await?.sync_all().await?;
        debug!(url = %url, parts = parts.len(), "Ranged download assembled");
        Ok(())
    }
}

#[async_trait]
impl ContentFetcher for HttpFetcher {
    fn name(&self) -> &str {
        "http"
    }

    fn resolve_source(&self, repository: &RepositoryLocation, repository_path: &str) -> String {
        repository.url_for(repository_path)
    }

    async fn download(
        &self,
        request: DownloadRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        let started = Instant::now();
        let client = self.client_for(request.tls)?;
        let url = request.source;
        let expected = request.expected_size;

        let ranged = if expected < self.config.direct_threshold {
            false
        } else {
            let probe = cancellable(cancel, self.probe(&client, url)).await?;
            if let Some(advertised) = probe.content_length {
                if advertised != expected {
                    return Err(FetchError::SizeMismatch {
                        url: url.to_string(),
                        expected,
                        advertised,
                    });
                }
            }
            probe.accepts_ranges && probe.content_length.is_some()
        };

        debug!(
            correlation = %request.correlation,
            url = %url,
            expected_bytes = expected,
            ranged,
            "Starting download"
        );

        if ranged {
            self.download_ranged(&client, url, expected, request.destination, cancel)
                .await?;
        } else {
            cancellable(
                cancel,
                self.download_direct(&client, url, expected, request.destination, cancel),
            )
            .await?;
        }

        info!(
            correlation = %request.correlation,
            url = %url,
            size = expected,
            ranged,
            duration_ms = started.elapsed().as_millis() as u64,
            "Download completed"
        );
        Ok(())
    }
}

/// Fetch one range part and write it at its offset.
async fn fetch_part(
    request: RequestBuilder,
    url: &str,
    part: ByteRange,
    destination: &Path,
) -> Result<(), FetchError> {
    let response = request.send().await?;
    if response.status() != StatusCode::PARTIAL_CONTENT {
        return Err(FetchError::Status {
            status: response.status(),
            url: url.to_string(),
        });
    }

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(destination)
        .await?;
    file.seek(std::io::SeekFrom::Start(part.start)).await?;
    stream_body(response, &mut file, part.len()).await?;
    Ok(())
}

/// Wait for one limiter permit, giving up on cancellation.
pub(super) async fn acquire_permit(
    limiter: &Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Result<OwnedSemaphorePermit, FetchError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(FetchError::Cancelled),
        permit = Arc::clone(limiter).acquire_owned() => {
            permit.map_err(|_| FetchError::LimiterClosed)
        }
    }
}

/// Upper bound on cached mutual-TLS clients.
const MAX_TLS_CLIENTS: usize = 16;

/// Insert `client`, clearing the cache first once it is full.
fn cache_client(clients: &mut HashMap<String, Client>, key: String, client: Client) {
    if clients.len() >= MAX_TLS_CLIENTS && !clients.contains_key(&key) {
        debug!(cached = clients.len(), "TLS client cache full, clearing");
        clients.clear();
    }
    clients.insert(key, client);
}

fn tls_key(tls: &TlsMaterial) -> String {
    let mut hasher = Sha256::new();
    hasher.update([u8::from(tls.insecure_skip_verify)]);
    for part in [&tls.ca_pem, &tls.cert_pem, &tls.key_pem] {
        let bytes = part.as_deref().unwrap_or_default().as_bytes();
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    hex::encode(hasher.finalize())
}

fn build_client(config: &HttpFetcherConfig, tls: Option<&TlsMaterial>) -> Result<Client, FetchError> {
    let mut builder = Client::builder()
        .use_rustls_tls()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout);

    if let Some(tls) = tls {
        if let Some(ca) = &tls.ca_pem {
            let cert = Certificate::from_pem(ca.as_bytes())
                .map_err(|e| FetchError::Tls(format!("bad CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        if let (Some(cert), Some(key)) = (&tls.cert_pem, &tls.key_pem) {
            let pem = format!("{cert}\n{key}");
            let identity = Identity::from_pem(pem.as_bytes())
                .map_err(|e| FetchError::Tls(format!("bad client identity: {e}")))?;
            builder = builder.identity(identity);
        }
        if tls.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
    }

    Ok(builder.build()?)
}
