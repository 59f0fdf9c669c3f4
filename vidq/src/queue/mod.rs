//! Download queue orchestrator.
//!
//! [`DownloadQueue`] owns the pending and history stores and drives every item through
//! admission, dispatch onto the worker pool, download, and completion. Background tasks:
//!
//! - the dispatch loop, woken by a shared [`Notify`] and gated by the pause flag
//! - the periodic maintenance pass (staleness reaper, live rescheduler, retention)

mod admission;
mod control;
mod dispatcher;
mod events;
mod maintenance;

pub use admission::AdmissionContext;
pub use control::ItemResult;
pub use events::{QueueEvent, QueueEventBroadcaster};
pub use maintenance::MaintenanceReport;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::config::{AppConfig, ConditionProvider, OptionsBuilder, PresetProvider, UserOptions};
use crate::domain::{DownloadRecord, DownloadStatus};
use crate::downloader::{DownloadArchive, DownloadLifecycle, LifecycleConfig, MediaExtractor};
use crate::pool::WorkerPool;
use crate::store::{ItemStore, Page, SortOrder, StatusFilter};

/// Default maximum nesting of playlists and requeues in one `add` call.
pub const DEFAULT_MAX_ADMISSION_DEPTH: usize = 4;

/// Queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub lifecycle: LifecycleConfig,
    pub extract_concurrency: usize,
    /// Absolute bound on one extraction.
    pub extract_timeout: Duration,
    /// Bound on waiting for an extraction slot.
    pub extract_acquire_timeout: Duration,
    /// 0 is unlimited.
    pub playlist_items_limit: usize,
    pub max_admission_depth: usize,
    pub live_buffer: Duration,
    pub stale_after: Duration,
    pub maintenance_interval: Duration,
    /// 0 disables retention.
    pub history_retention_days: u64,
    pub dispatch_delay: Duration,
    /// Allow `clear` to delete output files.
    pub remove_files: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleConfig::default(),
            extract_concurrency: 4,
            extract_timeout: Duration::from_secs(120),
            extract_acquire_timeout: Duration::from_secs(60),
            playlist_items_limit: 0,
            max_admission_depth: DEFAULT_MAX_ADMISSION_DEPTH,
            live_buffer: Duration::from_secs(300),
            stale_after: Duration::from_secs(600),
            maintenance_interval: Duration::from_secs(60),
            history_retention_days: 0,
            dispatch_delay: Duration::from_millis(100),
            remove_files: false,
        }
    }
}

impl QueueConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            lifecycle: LifecycleConfig {
                temp_root: config.temp_path.clone(),
                download_root: config.download_path.clone(),
                keep_temp: config.keep_temp,
                ..LifecycleConfig::default()
            },
            extract_concurrency: config.extract_concurrency,
            extract_timeout: config.extract_timeout(),
            extract_acquire_timeout: config.extract_acquire_timeout(),
            playlist_items_limit: config.playlist_items_limit,
            live_buffer: config.live_buffer(),
            stale_after: config.stale_after(),
            maintenance_interval: config.maintenance_interval(),
            history_retention_days: config.history_retention_days,
            dispatch_delay: config.dispatch_delay(),
            remove_files: config.remove_files,
            ..Self::default()
        }
    }
}

/// Collaborators of the queue, built by the service container.
pub struct QueueComponents {
    pub pending: Arc<ItemStore>,
    pub history: Arc<ItemStore>,
    pub engine: Arc<dyn MediaExtractor>,
    pub archive: Arc<DownloadArchive>,
    pub presets: Arc<dyn PresetProvider>,
    pub conditions: Arc<dyn ConditionProvider>,
    pub options: OptionsBuilder,
    pub pool: Arc<WorkerPool>,
    pub events: QueueEventBroadcaster,
}

/// A request to add a URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddRequest {
    #[serde(flatten)]
    pub options: UserOptions,
    /// Dispatch as soon as a worker is free.
    pub auto_start: bool,
}

impl Default for AddRequest {
    fn default() -> Self {
        Self {
            options: UserOptions::default(),
            auto_start: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Outcome of an `add` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddResponse {
    pub status: ResponseStatus,
    pub msg: Option<String>,
    /// Expected no-ops (duplicates) that front-ends may choose not to surface.
    pub hidden: bool,
}

impl AddResponse {
    pub fn ok(msg: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Ok,
            msg: Some(msg.into()),
            hidden: false,
        }
    }

    pub fn error(error: &crate::Error) -> Self {
        Self {
            status: ResponseStatus::Error,
            msg: Some(error.to_string()),
            hidden: error.is_hidden(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

/// Which partitions `get` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GetMode {
    #[default]
    All,
    Pending,
    History,
}

/// Snapshot of the queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueSnapshot {
    pub pending: Vec<DownloadRecord>,
    pub history: Vec<DownloadRecord>,
}

/// The download queue.
pub struct DownloadQueue {
    config: QueueConfig,
    pending: Arc<ItemStore>,
    history: Arc<ItemStore>,
    engine: Arc<dyn MediaExtractor>,
    archive: Arc<DownloadArchive>,
    presets: Arc<dyn PresetProvider>,
    conditions: Arc<dyn ConditionProvider>,
    options: OptionsBuilder,
    pool: Arc<WorkerPool>,
    events: QueueEventBroadcaster,
    /// Lifecycles of dispatched items, keyed by record id.
    active: DashMap<String, Arc<DownloadLifecycle>>,
    /// Held for the whole of completion handling so a losing caller returns only after the
    /// record has moved.
    completing: tokio::sync::Mutex<()>,
    extract_slots: Arc<Semaphore>,
    dispatch: Notify,
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl DownloadQueue {
    pub fn new(config: QueueConfig, components: QueueComponents) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            extract_slots: Arc::new(Semaphore::new(config.extract_concurrency.max(1))),
            config,
            pending: components.pending,
            history: components.history,
            engine: components.engine,
            archive: components.archive,
            presets: components.presets,
            conditions: components.conditions,
            options: components.options,
            pool: components.pool,
            events: components.events,
            active: DashMap::new(),
            completing: tokio::sync::Mutex::new(()),
            dispatch: Notify::new(),
            paused,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn pending(&self) -> &ItemStore {
        &self.pending
    }

    pub fn history(&self) -> &ItemStore {
        &self.history
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Number of dispatched items that have not completed.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Load both stores, start the pool and the background tasks. No-op if already started.
    ///
    /// Pending records left in an active status by a previous process go back to `idle`.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let pending = self.pending.load().await?;
        let history = self.history.load().await?;
        info!(pending, history, "Download queue loaded");

        for record in self.pending.items() {
            if record.status.is_active() {
                debug!(id = %record.id, status = %record.status, "Resetting interrupted download");
                self.pending
                    .update(&record.id, |r| r.status = DownloadStatus::Idle, true)
                    .await;
            }
        }

        self.pool.start();

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(self.clone().dispatch_loop()));
        tasks.push(tokio::spawn(self.clone().maintenance_loop()));
        drop(tasks);

        self.dispatch.notify_one();
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Stop dispatching new items. In-flight downloads keep running.
    pub fn pause(&self) {
        if !self.paused.send_replace(true) {
            info!("Download queue paused");
            self.events.publish(QueueEvent::Paused);
        }
    }

    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            info!("Download queue resumed");
            self.events.publish(QueueEvent::Resumed);
            self.dispatch.notify_one();
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Snapshot of the stores selected by `mode`.
    pub fn get(&self, mode: GetMode) -> QueueSnapshot {
        let mut snapshot = QueueSnapshot::default();
        if matches!(mode, GetMode::All | GetMode::Pending) {
            snapshot.pending = self.pending.items();
        }
        if matches!(mode, GetMode::All | GetMode::History) {
            snapshot.history = self.history.items();
        }
        snapshot
    }

    /// One page of history.
    pub async fn paginate(
        &self,
        page: usize,
        per_page: usize,
        order: SortOrder,
        status_filter: Option<StatusFilter>,
    ) -> Result<Page<DownloadRecord>> {
        self.history
            .paginate(page, per_page, order, status_filter)
            .await
    }

    /// Stop the background tasks, cancel every running download and drain the pool.
    ///
    /// Interrupted records stay in pending as `idle` so the next start resumes them.
    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!("Shutting down download queue");
        self.cancel.cancel();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await
                && e.is_panic()
            {
                warn!(error = %e, "Queue task panicked");
            }
        }

        let lifecycles: Vec<Arc<DownloadLifecycle>> =
            self.active.iter().map(|e| e.value().clone()).collect();
        for lifecycle in &lifecycles {
            lifecycle.cancel().await;
        }
        for lifecycle in lifecycles {
            lifecycle.close().await;
            self.complete(lifecycle.item_id()).await;
        }

        self.pool.shutdown().await;
        info!("Download queue stopped");
    }
}
