//! Dispatch loop and completion handling.

use std::path::Path;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DownloadQueue, QueueEvent};
use crate::Result;
use crate::domain::{DownloadRecord, DownloadStatus};
use crate::downloader::{DownloadLifecycle, LifecycleSnapshot, ProgressEvent, ProgressSink};
use crate::pool::Job;

/// Mirrors lifecycle progress into the pending store.
struct QueueSink {
    queue: Weak<DownloadQueue>,
}

fn apply_snapshot(record: &mut DownloadRecord, snapshot: &LifecycleSnapshot) {
    record.progress = snapshot.progress.clone();
    if snapshot.filename.is_some() {
        record.filename.clone_from(&snapshot.filename);
    }
    if snapshot.temp_filename.is_some() {
        record.temp_filename.clone_from(&snapshot.temp_filename);
    }
    if snapshot.msg.is_some() {
        record.msg.clone_from(&snapshot.msg);
    }
}

#[async_trait]
impl ProgressSink for QueueSink {
    async fn on_progress(&self, snapshot: &LifecycleSnapshot, _event: &ProgressEvent) {
        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        // Terminal statuses are written by completion handling.
        if snapshot.status.is_terminal() {
            return;
        }
        let status_changed = queue
            .pending
            .get(&snapshot.item_id)
            .is_some_and(|r| r.status != snapshot.status);
        queue
            .pending
            .update(
                &snapshot.item_id,
                |record| {
                    record.status = snapshot.status;
                    apply_snapshot(record, snapshot);
                },
                status_changed,
            )
            .await;
        queue.events.publish(QueueEvent::Progress {
            snapshot: Box::new(snapshot.clone()),
        });
    }

    async fn on_terminal(&self, snapshot: &LifecycleSnapshot) {
        debug!(id = %snapshot.item_id, status = %snapshot.status, "Download reached terminal status");
    }
}

impl DownloadQueue {
    /// First eligible pending record without a lifecycle, in insertion order.
    ///
    /// With no idle persistent worker only live records qualify, since they run on
    /// temporary workers.
    fn next_eligible(&self) -> Option<DownloadRecord> {
        let live_only = !self.pool.has_open_workers();
        self.pending.find(|r| {
            r.is_eligible() && (!live_only || r.is_live) && !self.active.contains_key(&r.id)
        })
    }

    pub(super) async fn dispatch_loop(self: Arc<Self>) {
        debug!("Dispatch loop started");
        let mut paused = self.paused.subscribe();
        loop {
            if self.next_eligible().is_none() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = self.dispatch.notified() => {}
                    _ = self.pool.wait_for_idle_worker(), if !self.pool.has_open_workers() => {}
                }
                continue;
            }

            if *paused.borrow_and_update() {
                debug!("Dispatch paused");
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = async { paused.wait_for(|p| !*p).await.is_ok() } => {}
                }
            }

            // Items may have been cancelled or paused while we waited.
            if let Some(record) = self.next_eligible() {
                self.dispatch_item(record).await;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.dispatch_delay) => {}
            }
        }
        debug!("Dispatch loop stopped");
    }

    async fn dispatch_item(self: &Arc<Self>, record: DownloadRecord) {
        let id = record.id.clone();
        let temporary = record.is_live;
        let description = format!("download {}", record.title);

        let sink = Arc::new(QueueSink {
            queue: Arc::downgrade(self),
        });
        let lifecycle = Arc::new(DownloadLifecycle::new(
            record,
            self.engine.clone(),
            sink,
            self.config.lifecycle.clone(),
        ));
        self.active.insert(id.clone(), lifecycle.clone());

        let queue = self.clone();
        let job = Job::new(description, move |token| async move {
            queue.run_download(lifecycle, token).await
        });

        info!(id = %id, temporary, "Dispatching download");
        if let Err(e) = self.pool.push(job, temporary).await {
            warn!(id = %id, error = %e, "Failed to dispatch download");
            self.active.remove(&id);
        }
    }

    /// Body of a pool job: run the lifecycle to a terminal status, then complete it.
    async fn run_download(
        self: Arc<Self>,
        lifecycle: Arc<DownloadLifecycle>,
        token: CancellationToken,
    ) -> Result<()> {
        if !lifecycle.is_cancelled()
            && let Err(e) = lifecycle.start().await
        {
            warn!(id = %lifecycle.item_id(), error = %e, "Download failed to start");
        }

        tokio::select! {
            _ = lifecycle.wait() => {}
            _ = token.cancelled() => {
                lifecycle.cancel().await;
                lifecycle.wait().await;
            }
        }

        self.complete(lifecycle.item_id()).await;
        Ok(())
    }

    /// Move a dispatched item to history. Runs once per dispatch; later calls wait for the
    /// first to finish and then return.
    ///
    /// A download cancelled by shutdown stays in pending as `idle` instead.
    pub(super) async fn complete(&self, id: &str) {
        let _completing = self.completing.lock().await;
        let Some(lifecycle) = self.active.get(id).map(|entry| entry.value().clone()) else {
            return;
        };

        let snapshot = lifecycle.snapshot();
        if snapshot.status == DownloadStatus::Finished {
            if let Some(archive_id) = lifecycle.record().archive_id.as_deref()
                && let Err(e) = self.archive.add(archive_id).await
            {
                warn!(id, error = %e, "Failed to record archive id");
            }
        } else {
            remove_partial(lifecycle.temp_dir(), snapshot.temp_filename.as_deref()).await;
        }

        lifecycle.close().await;
        let status = lifecycle.status();
        let snapshot = lifecycle.snapshot();

        if self.cancel.is_cancelled() && status == DownloadStatus::Cancelled {
            self.pending
                .update(
                    id,
                    |record| {
                        record.status = DownloadStatus::Idle;
                        apply_snapshot(record, &snapshot);
                    },
                    true,
                )
                .await;
            self.active.remove(id);
            return;
        }

        let mut record = self
            .pending
            .get(id)
            .unwrap_or_else(|| lifecycle.record().clone());
        apply_snapshot(&mut record, &snapshot);
        match status {
            DownloadStatus::Finished => {
                record.status = DownloadStatus::Finished;
                record.error = None;
                record.progress.complete();
            }
            DownloadStatus::Cancelled => record.status = DownloadStatus::Cancelled,
            other => {
                let message = snapshot
                    .error
                    .clone()
                    .or_else(|| snapshot.msg.clone())
                    .unwrap_or_else(|| format!("Download ended with status {other}"));
                record.fail(message);
                if other == DownloadStatus::NotLive {
                    // Let the live rescheduler pick it up.
                    record.is_live = true;
                    record.scheduled_live_at.get_or_insert_with(Utc::now);
                }
            }
        }

        info!(id, title = %record.title, status = %record.status, "Download completed");
        self.history.put(record.clone()).await;
        self.pending.delete(id).await;
        self.active.remove(id);
        self.events.publish(QueueEvent::Completed {
            record: Box::new(record),
        });
        self.dispatch.notify_one();
    }
}

/// Best-effort removal of a partial download.
async fn remove_partial(temp_dir: &Path, temp_filename: Option<&str>) {
    let Some(name) = temp_filename else {
        return;
    };
    let path = temp_dir.join(name);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => debug!(path = %path.display(), "Removed partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!(path = %path.display(), error = %e, "Failed to remove partial file"),
    }
}
