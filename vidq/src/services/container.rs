//! Service container.
//!
//! Builds every service once at startup and wires them explicitly. Front-ends and the
//! binary hold the container (or clones of its `Arc`s); nothing is global.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::config::{AppConfig, ConditionList, OptionsBuilder, PresetRegistry};
use crate::database::DbPool;
use crate::database::models::Partition;
use crate::database::repositories::{DownloadRepository, SqlxDownloadRepository};
use crate::downloader::{DownloadArchive, MediaExtractor, YtDlpConfig, YtDlpEngine};
use crate::pool::{WorkerPool, WorkerPoolConfig};
use crate::queue::{DownloadQueue, QueueComponents, QueueConfig, QueueEventBroadcaster};
use crate::store::ItemStore;

/// Service container holding all application services.
pub struct ServiceContainer {
    pub config: AppConfig,
    pub pool: DbPool,
    pub presets: Arc<PresetRegistry>,
    pub conditions: Arc<ConditionList>,
    pub archive: Arc<DownloadArchive>,
    pub engine: Arc<dyn MediaExtractor>,
    pub worker_pool: Arc<WorkerPool>,
    pub queue: Arc<DownloadQueue>,
    pub events: QueueEventBroadcaster,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Build the container around the yt-dlp engine.
    pub async fn new(config: AppConfig, pool: DbPool) -> Result<Self> {
        let mut engine_config = YtDlpConfig {
            binary_path: config.ytdlp_path.clone(),
            ..YtDlpConfig::default()
        };
        if let Some(template) = &config.output_template {
            engine_config.output_template = template.clone();
        }
        let engine = YtDlpEngine::detect(engine_config).await;
        match engine.version() {
            Some(version) => info!(version, "Found yt-dlp"),
            None => warn!(path = %config.ytdlp_path, "yt-dlp not found, downloads will fail"),
        }
        Self::with_engine(config, pool, Arc::new(engine)).await
    }

    /// Build the container around an arbitrary extractor.
    pub async fn with_engine(
        config: AppConfig,
        pool: DbPool,
        engine: Arc<dyn MediaExtractor>,
    ) -> Result<Self> {
        config.validate()?;
        info!("Initializing service container");

        let repo: Arc<dyn DownloadRepository> = Arc::new(SqlxDownloadRepository::new(pool.clone()));
        let pending = Arc::new(ItemStore::new(Partition::Pending, repo.clone()));
        let history = Arc::new(ItemStore::new(Partition::History, repo));

        let archive = Arc::new(match &config.archive_file {
            Some(path) => DownloadArchive::open(path).await?,
            None => DownloadArchive::disabled(),
        });

        let presets = Arc::new(PresetRegistry::new());
        let conditions = Arc::new(ConditionList::default());
        let worker_pool = Arc::new(WorkerPool::new(WorkerPoolConfig {
            workers: config.workers,
            load_factor: config.load_factor,
        }));
        let events = QueueEventBroadcaster::new();

        let queue = Arc::new(DownloadQueue::new(
            QueueConfig::from_app(&config),
            QueueComponents {
                pending,
                history,
                engine: engine.clone(),
                archive: archive.clone(),
                presets: presets.clone(),
                conditions: conditions.clone(),
                options: OptionsBuilder::new(),
                pool: worker_pool.clone(),
                events: events.clone(),
            },
        ));

        info!("Service container initialized");
        Ok(Self {
            config,
            pool,
            presets,
            conditions,
            archive,
            engine,
            worker_pool,
            queue,
            events,
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Start the queue and the background subscriptions.
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing services");
        self.queue.start().await?;
        self.setup_error_subscription();
        info!("Services initialized");
        Ok(())
    }

    /// Log every record that lands in history with status `error`.
    fn setup_error_subscription(&self) {
        let mut receiver = self.queue.history().subscribe_errors();
        let cancellation_token = self.cancellation_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    result = receiver.recv() => match result {
                        Ok(record) => warn!(
                            id = %record.id,
                            title = %record.title,
                            error = record.error.as_deref().unwrap_or("unknown"),
                            "Download failed"
                        ),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "Error subscription lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Stop every service and close the database.
    pub async fn shutdown(&self) {
        info!("Shutting down services");
        self.cancellation_token.cancel();
        self.queue.shutdown().await;
        self.pool.close().await;
        info!("All services stopped");
    }
}
