//! Shared fixtures: an in-memory database and a scripted extractor.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;

use vidq::config::AppConfig;
use vidq::database::{DbPool, init_pool, run_migrations};
use vidq::domain::{DownloadRecord, ItemOptions};
use vidq::downloader::{
    DownloadCommand, DownloadPaths, Extraction, LiveStatus, MediaExtractor, MediaInfo,
    PlaylistEntry, PlaylistInfo,
};
use vidq::services::ServiceContainer;
use vidq::{Error, Result};

pub const MOCK_PREFIX: &str = "https://mock.test/";

/// Writes `$DIR/$ID.mp4` and reports it as moved.
pub const SUCCESS_SCRIPT: &str = r#"
mkdir -p "$DIR"
printf '{"status":"downloading","downloaded_bytes":1,"total_bytes":2}\n'
printf x > "$DIR/$ID.mp4"
printf '{"status":"moved","filename":"%s"}\n' "$DIR/$ID.mp4"
"#;

pub const HANG_SCRIPT: &str = "exec sleep 30";

pub fn mock_url(id: &str) -> String {
    format!("{MOCK_PREFIX}{id}")
}

/// Extractor serving canned metadata and running shell scripts as downloads.
#[derive(Default)]
pub struct MockExtractor {
    extractions: Mutex<HashMap<String, Extraction>>,
    scripts: Mutex<HashMap<String, String>>,
    delays: Mutex<HashMap<String, Duration>>,
    pub extract_calls: AtomicUsize,
    pub download_calls: AtomicUsize,
}

impl MockExtractor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn info(id: &str) -> MediaInfo {
        MediaInfo {
            id: id.to_string(),
            title: format!("Video {id}"),
            url: mock_url(id),
            extractor_key: Some("Mock".to_string()),
            live_status: None,
            release_timestamp: None,
            duration: None,
            has_formats: true,
            raw: json!({ "id": id, "title": format!("Video {id}") }),
        }
    }

    /// Register a regular video at `mock_url(id)`.
    pub fn item(&self, id: &str) -> String {
        self.item_with(id, |_| {})
    }

    pub fn item_with(&self, id: &str, f: impl FnOnce(&mut MediaInfo)) -> String {
        let mut info = Self::info(id);
        f(&mut info);
        let url = mock_url(id);
        self.extractions
            .lock()
            .insert(url.clone(), Extraction::Item(Box::new(info)));
        url
    }

    pub fn duration(&self, id: &str, seconds: f64) -> String {
        self.item_with(id, |info| {
            info.duration = Some(seconds);
            info.raw["duration"] = json!(seconds);
        })
    }

    /// A stream that is live now.
    pub fn live(&self, id: &str) -> String {
        self.item_with(id, |info| info.live_status = Some(LiveStatus::IsLive))
    }

    /// A premiere scheduled at `release_timestamp` running for `seconds`.
    pub fn premiere(&self, id: &str, release_timestamp: i64, seconds: f64) -> String {
        self.item_with(id, |info| {
            info.live_status = Some(LiveStatus::IsUpcoming);
            info.release_timestamp = Some(release_timestamp);
            info.duration = Some(seconds);
            info.has_formats = false;
            info.raw["is_premiere"] = json!(true);
        })
    }

    pub fn upcoming(&self, id: &str, release_timestamp: i64) -> String {
        self.item_with(id, |info| {
            info.live_status = Some(LiveStatus::IsUpcoming);
            info.release_timestamp = Some(release_timestamp);
            info.has_formats = false;
        })
    }

    pub fn playlist(&self, id: &str, title: &str, entries: &[String]) -> String {
        let url = mock_url(id);
        let playlist = PlaylistInfo {
            id: Some(id.to_string()),
            title: Some(title.to_string()),
            uploader: Some("uploader".to_string()),
            entries: entries
                .iter()
                .map(|u| PlaylistEntry {
                    url: u.clone(),
                    id: None,
                    title: None,
                })
                .collect(),
        };
        self.extractions
            .lock()
            .insert(url.clone(), Extraction::Playlist(playlist));
        url
    }

    /// Make extraction of `url` take `delay`.
    pub fn delay(&self, url: &str, delay: Duration) {
        self.delays.lock().insert(url.to_string(), delay);
    }

    pub fn script(&self, url: &str, script: &str) {
        self.scripts.lock().insert(url.to_string(), script.to_string());
    }

    pub fn extracts(&self) -> usize {
        self.extract_calls.load(Ordering::SeqCst)
    }

    pub fn downloads(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaExtractor for MockExtractor {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn extract(&self, url: &str, _options: &ItemOptions) -> Result<Extraction> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays.lock().get(url).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.extractions
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::extraction(format!("Unsupported URL: {url}")))
    }

    fn download_command(
        &self,
        record: &DownloadRecord,
        paths: &DownloadPaths,
    ) -> Result<DownloadCommand> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .get(&record.url)
            .cloned()
            .unwrap_or_else(|| SUCCESS_SCRIPT.to_string());
        Ok(DownloadCommand::new("sh")
            .args(["-c", script.as_str()])
            .env("DIR", paths.download_dir.to_string_lossy())
            .env("ID", record.source_id.as_str())
            .cwd(&paths.temp_dir))
    }

    fn archive_id(&self, url: &str) -> Option<String> {
        url.strip_prefix(MOCK_PREFIX).map(|id| format!("mock {id}"))
    }
}

pub async fn setup_test_db() -> DbPool {
    let pool = init_pool("sqlite::memory:")
        .await
        .expect("Failed to create test pool");
    run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

pub struct TestQueue {
    pub container: ServiceContainer,
    pub engine: Arc<MockExtractor>,
    pub dir: TempDir,
}

impl TestQueue {
    pub fn download_dir(&self) -> PathBuf {
        self.dir.path().join("downloads")
    }
}

/// A started container over an in-memory database with one worker.
pub async fn setup_queue(configure: impl FnOnce(&mut AppConfig)) -> TestQueue {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig {
        database_url: "sqlite::memory:".to_string(),
        download_path: dir.path().join("downloads"),
        temp_path: dir.path().join("tmp"),
        archive_file: Some(dir.path().join("archive.txt")),
        workers: 1,
        dispatch_delay_ms: 10,
        maintenance_interval_secs: 3600,
        ..AppConfig::default()
    };
    configure(&mut config);

    let engine = MockExtractor::new();
    let pool = setup_test_db().await;
    let container = ServiceContainer::with_engine(config, pool, engine.clone())
        .await
        .expect("Failed to build container");
    container.initialize().await.expect("Failed to start queue");

    TestQueue {
        container,
        engine,
        dir,
    }
}

/// Poll `condition` until it holds, failing after 10 seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
