//! Shared helpers for sync agent integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use cfgsync_agent::config::{AppConfig, Config};
use cfgsync_id::AppId;
use sha2::{Digest, Sha256};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Deterministic test content of `len` bytes.
pub fn blob(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Serves a body, honouring `Range: bytes=a-b` when enabled.
pub struct RangeResponder {
    body: Vec<u8>,
    ranges: bool,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>, ranges: bool) -> Self {
        Self { body, ranges }
    }
}

fn parse_range(value: &str) -> Option<(usize, usize)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);

        match range {
            Some((start, end)) if self.ranges && end < self.body.len() && start <= end => {
                ResponseTemplate::new(206)
                    .insert_header(
                        "content-range",
                        format!("bytes {start}-{end}/{}", self.body.len()).as_str(),
                    )
                    .set_body_bytes(self.body[start..=end].to_vec())
            }
            _ => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
        }
    }
}

/// Mount HEAD and GET handlers for `body` at `blob_path`.
pub async fn mount_blob(server: &MockServer, blob_path: &str, body: &[u8], ranges: bool) {
    let mut head = ResponseTemplate::new(200)
        .insert_header("content-length", body.len().to_string().as_str())
        .set_body_bytes(body.to_vec());
    if ranges {
        head = head.insert_header("accept-ranges", "bytes");
    }
    Mock::given(method("HEAD"))
        .and(path(blob_path))
        .respond_with(head)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(blob_path))
        .respond_with(RangeResponder::new(body.to_vec(), ranges))
        .mount(server)
        .await;
}

/// Requests received for `blob_path` with the given method.
pub async fn request_count(server: &MockServer, http_method: &str, blob_path: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == http_method && r.url.path() == blob_path)
        .count()
}

/// Agent configuration rooted in `data_dir` with fast retries.
pub fn test_config(data_dir: &Path, apps: &[u32]) -> Config {
    let mut config = Config::default();
    config.data_dir = data_dir.to_path_buf();
    config.apps = apps
        .iter()
        .map(|id| AppConfig::new(AppId::new(*id).unwrap()))
        .collect();
    config.download.lock_timeout_ms = 2_000;
    config.retry.max_attempts = 3;
    config.retry.min_backoff_ms = 10;
    config.retry.max_backoff_ms = 20;
    config
}

/// One content item as JSON.
pub fn item_json(id: u32, dir: &str, name: &str, repository_path: &str, body: &[u8]) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "content": {
            "byte_size": body.len(),
            "signature": sha256_hex(body),
        },
        "placement": {
            "path": dir,
            "name": name,
            "file_type": "yaml",
            "privilege": "640",
        },
        "repository_path": repository_path,
    })
}

/// An encoded release-change envelope.
pub fn release_event(
    app_id: u32,
    release_id: u32,
    cursor: u64,
    repository_root: &str,
    items: Vec<serde_json::Value>,
) -> Vec<u8> {
    serde_json::json!({
        "event_id": format!("evt-{release_id}-{cursor}"),
        "cursor": cursor,
        "occurred_at": "2026-03-01T12:00:00Z",
        "event_type": "release.changed",
        "event_version": 1,
        "payload": {
            "app_id": app_id,
            "release_id": release_id,
            "repository": { "root": repository_root },
            "content_items": items,
        }
    })
    .to_string()
    .into_bytes()
}

/// Poll `condition` until it holds, failing the test after ten seconds.
pub async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
