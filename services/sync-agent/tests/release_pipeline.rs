//! End-to-end tests for release scheduling and application.
//!
//! Each test runs real app runtimes against a mock repository and a
//! temporary data directory.

mod common;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cfgsync_agent::fetch::{ContentFetcher, DownloadRequest, FetchError, FetcherTable};
use cfgsync_agent::job::JobContext;
use cfgsync_agent::reload::ReloadSignal;
use cfgsync_agent::workspace::{ReleaseMetadata, ReleaseWorkspace};
use cfgsync_agent::{AppRegistry, Scheduler};
use cfgsync_events::{ReleaseChangeEvent, RepositoryLocation, StorageMode};
use cfgsync_id::{AppId, Cursor, JobId, ReleaseId};
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{blob, eventually, item_json, mount_blob, release_event, request_count, test_config};

fn app(id: u32) -> AppId {
    AppId::new(id).unwrap()
}

fn rel(id: u32) -> ReleaseId {
    ReleaseId::new(id).unwrap()
}

/// Running agent pieces for one test.
struct Harness {
    _dir: TempDir,
    data_dir: PathBuf,
    registry: Arc<AppRegistry>,
    scheduler: Scheduler,
    shutdown: watch::Sender<bool>,
    runtimes: Vec<JoinHandle<()>>,
}

impl Harness {
    fn start(apps: &[u32], fetchers: Option<FetcherTable>) -> Self {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().to_path_buf();
        let config = test_config(&data_dir, apps);

        let fetchers = match fetchers {
            Some(table) => table,
            None => FetcherTable::from_config(&config).unwrap(),
        };
        let registry = Arc::new(AppRegistry::new(&config, Arc::new(fetchers)).unwrap());
        let scheduler = Scheduler::new(Arc::clone(&registry), config.retry.policy());

        let (shutdown, shutdown_rx) = watch::channel(false);
        let runtimes = registry.start(shutdown_rx);

        Self {
            _dir: dir,
            data_dir,
            registry,
            scheduler,
            shutdown,
            runtimes,
        }
    }

    fn release_dir(&self, app_id: u32, release_id: u32) -> PathBuf {
        self.data_dir
            .join("apps")
            .join(app_id.to_string())
            .join(release_id.to_string())
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.runtimes {
            tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .expect("runtime did not stop")
                .unwrap();
        }
    }
}

#[tokio::test]
async fn test_release_applied_then_duplicate_ignored() {
    let server = MockServer::start().await;
    let body = blob(1021, 42);
    mount_blob(&server, "/blobs/server-yaml", &body, true).await;

    let harness = Harness::start(&[42], None);
    let items = vec![item_json(1, "/etc", "server.yaml", "blobs/server-yaml", &body)];

    let job = harness
        .scheduler
        .on_release_change(&release_event(42, 7, 1, &server.uri(), items.clone()));
    assert!(job.is_some());

    let h = &harness;
    eventually("release 7 applied", move || async move {
        h.scheduler.current_release(app(42)).await == Some((rel(7), Cursor::new(1)))
    })
    .await;

    let release_dir = harness.release_dir(42, 7);
    let placed = release_dir.join("configItems/etc/server.yaml");
    assert_eq!(std::fs::read(&placed).unwrap(), body);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&placed).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    let metadata: ReleaseMetadata =
        serde_json::from_slice(&std::fs::read(release_dir.join("metadata.json")).unwrap()).unwrap();
    assert_eq!(metadata.release.release_id, rel(7));
    assert_eq!(metadata.release.content_items.len(), 1);

    let signal_path = harness.data_dir.join("signals/42.json");
    let signal: ReloadSignal = serde_json::from_slice(&std::fs::read(&signal_path).unwrap()).unwrap();
    assert_eq!(signal.release_id, rel(7));
    assert_eq!(signal.config_item, vec![PathBuf::from("etc/server.yaml")]);
    assert_eq!(signal.root_directory, release_dir.join("configItems"));

    // Same release again with a newer cursor: nothing is downloaded.
    harness
        .scheduler
        .on_release_change(&release_event(42, 7, 2, &server.uri(), items));

    let h = &harness;
    eventually("duplicate job skipped", move || async move {
        h.registry.stats(app(42)).unwrap().skipped == 1
    })
    .await;

    assert_eq!(request_count(&server, "GET", "/blobs/server-yaml").await, 1);
    assert_eq!(
        harness.scheduler.current_release(app(42)).await,
        Some((rel(7), Cursor::new(1)))
    );
    let stats = harness.registry.stats(app(42)).unwrap();
    assert_eq!(stats.applied, 1);
    assert_eq!(stats.failed_attempts, 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_newer_release_supersedes_running_job() {
    let server = MockServer::start().await;
    let slow = blob(64, 1);
    let fast = blob(64, 2);
    Mock::given(method("GET"))
        .and(path("/blobs/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(slow.clone())
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;
    mount_blob(&server, "/blobs/fast", &fast, false).await;

    let harness = Harness::start(&[42], None);

    // Push A directly so the test keeps a handle on its token.
    let event_a = ReleaseChangeEvent::decode(&release_event(
        42,
        1,
        1,
        &server.uri(),
        vec![item_json(1, "/etc", "app.conf", "blobs/slow", &slow)],
    ))
    .unwrap();
    let context_a = JobContext::release_change(
        JobId::new(1_000).unwrap(),
        event_a.event_id.clone(),
        event_a.cursor,
        Arc::new(event_a.payload),
    );
    let token_a = context_a.cancel.clone().unwrap();
    harness.registry.push_job(app(42), context_a).unwrap();

    let s = &server;
    eventually("A's download to start", move || async move {
        request_count(s, "GET", "/blobs/slow").await == 1
    })
    .await;

    harness.scheduler.on_release_change(&release_event(
        42,
        2,
        2,
        &server.uri(),
        vec![item_json(1, "/etc", "app.conf", "blobs/fast", &fast)],
    ));

    let h = &harness;
    eventually("release B applied", move || async move {
        h.scheduler.current_release(app(42)).await == Some((rel(2), Cursor::new(2)))
    })
    .await;

    assert!(token_a.is_cancelled());
    assert!(!harness.release_dir(42, 1).join("metadata.json").exists());
    assert_eq!(
        std::fs::read(harness.release_dir(42, 2).join("configItems/etc/app.conf")).unwrap(),
        fast
    );

    // Cancellation is not a failed attempt.
    let stats = harness.registry.stats(app(42)).unwrap();
    assert_eq!(stats.superseded, 1);
    assert_eq!(stats.applied, 1);
    assert_eq!(stats.failed_attempts, 0);
    assert_eq!(stats.abandoned, 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_shutdown_interrupts_in_flight_download() {
    let server = MockServer::start().await;
    let body = blob(128, 4);
    Mock::given(method("GET"))
        .and(path("/blobs/stuck"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(body.clone())
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let mut harness = Harness::start(&[42], None);
    harness.scheduler.on_release_change(&release_event(
        42,
        9,
        1,
        &server.uri(),
        vec![item_json(1, "/etc", "stuck.conf", "blobs/stuck", &body)],
    ));

    let s = &server;
    eventually("download to start", move || async move {
        request_count(s, "GET", "/blobs/stuck").await == 1
    })
    .await;

    let _ = harness.shutdown.send(true);
    let started = Instant::now();
    for handle in harness.runtimes.drain(..) {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("runtime did not stop")
            .unwrap();
    }
    assert!(started.elapsed() < Duration::from_secs(2));

    // The attempt's lock went away with it.
    let workspace = ReleaseWorkspace::new(harness.data_dir.join("apps/42"));
    let lock = workspace
        .lock(rel(9), Duration::from_millis(200), &CancellationToken::new())
        .await;
    assert!(lock.is_ok());

    assert_eq!(harness.registry.current_release(app(42)).await, None);
    assert!(!harness.release_dir(42, 9).join("metadata.json").exists());
    assert_eq!(harness.registry.stats(app(42)).unwrap().failed_attempts, 0);

    drop(lock);
    harness.stop().await;
}

/// Writes fixed content and counts calls.
struct CountingFetcher {
    body: Vec<u8>,
    calls: AtomicUsize,
}

#[async_trait]
impl ContentFetcher for CountingFetcher {
    fn name(&self) -> &str {
        "counting"
    }

    fn resolve_source(&self, _repository: &RepositoryLocation, repository_path: &str) -> String {
        repository_path.to_string()
    }

    async fn download(
        &self,
        request: DownloadRequest<'_>,
        _cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(request.destination, &self.body).await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_ready_items_are_not_downloaded() {
    let on_disk = blob(300, 9);
    let fresh = blob(200, 10);
    let fetcher = Arc::new(CountingFetcher {
        body: fresh.clone(),
        calls: AtomicUsize::new(0),
    });
    let mut table = FetcherTable::new();
    table.insert(StorageMode::Repository, fetcher.clone());

    let harness = Harness::start(&[42], Some(table));

    // Content left behind by an earlier run.
    let existing = harness.release_dir(42, 5).join("configItems/etc/present.conf");
    std::fs::create_dir_all(existing.parent().unwrap()).unwrap();
    std::fs::write(&existing, &on_disk).unwrap();

    harness.scheduler.on_release_change(&release_event(
        42,
        5,
        1,
        "https://repo.invalid",
        vec![
            item_json(1, "/etc", "present.conf", "blobs/present", &on_disk),
            item_json(2, "/etc", "fresh.conf", "blobs/fresh", &fresh),
        ],
    ));

    let h = &harness;
    eventually("release 5 applied", move || async move {
        h.scheduler.current_release(app(42)).await.is_some()
    })
    .await;

    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(std::fs::read(&existing).unwrap(), on_disk);
    assert_eq!(
        std::fs::read(harness.release_dir(42, 5).join("configItems/etc/fresh.conf")).unwrap(),
        fresh
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_failing_release_abandoned_after_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/blobs/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let harness = Harness::start(&[42], None);
    harness.scheduler.on_release_change(&release_event(
        42,
        3,
        1,
        &server.uri(),
        vec![item_json(1, "/etc", "a.conf", "blobs/broken", b"0123456789")],
    ));

    let h = &harness;
    eventually("job abandoned", move || async move {
        h.registry.stats(app(42)).unwrap().abandoned == 1
    })
    .await;

    let stats = harness.registry.stats(app(42)).unwrap();
    assert_eq!(stats.failed_attempts, 3);
    assert_eq!(stats.applied, 0);
    assert_eq!(request_count(&server, "GET", "/blobs/broken").await, 3);
    assert!(harness.scheduler.current_release(app(42)).await.is_none());

    harness.stop().await;
}

#[tokio::test]
async fn test_signature_mismatch_is_retried() {
    let server = MockServer::start().await;
    let expected = blob(128, 1);
    let served = blob(128, 2);
    mount_blob(&server, "/blobs/tampered", &served, false).await;

    let harness = Harness::start(&[42], None);
    harness.scheduler.on_release_change(&release_event(
        42,
        4,
        1,
        &server.uri(),
        vec![item_json(1, "/etc", "a.conf", "blobs/tampered", &expected)],
    ));

    let h = &harness;
    eventually("job abandoned", move || async move {
        h.registry.stats(app(42)).unwrap().abandoned == 1
    })
    .await;

    assert_eq!(request_count(&server, "GET", "/blobs/tampered").await, 3);
    assert!(harness.scheduler.current_release(app(42)).await.is_none());
    assert!(!harness.release_dir(42, 4).join("metadata.json").exists());

    harness.stop().await;
}

#[tokio::test]
async fn test_apps_are_independent() {
    let server = MockServer::start().await;
    let body = blob(50, 5);
    mount_blob(&server, "/blobs/shared", &body, false).await;

    let harness = Harness::start(&[1, 2], None);
    for app_id in [1, 2] {
        harness.scheduler.on_release_change(&release_event(
            app_id,
            10 + app_id,
            1,
            &server.uri(),
            vec![item_json(1, "/", "shared.conf", "blobs/shared", &body)],
        ));
    }

    let h = &harness;
    eventually("both apps applied", move || async move {
        h.scheduler.current_release(app(1)).await == Some((rel(11), Cursor::new(1)))
            && h.scheduler.current_release(app(2)).await == Some((rel(12), Cursor::new(1)))
    })
    .await;

    assert!(harness.data_dir.join("signals/1.json").exists());
    assert!(harness.data_dir.join("signals/2.json").exists());
    assert!(harness
        .release_dir(2, 12)
        .join("configItems/shared.conf")
        .exists());

    harness.stop().await;
}
