//! Item-level control: cancel, clear, retry, start and pause.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{AdmissionContext, DownloadQueue, QueueEvent, ResponseStatus};
use crate::database::models::Partition;
use crate::domain::DownloadStatus;
use crate::{Error, Result};

/// Per-id outcome of a control operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemResult {
    pub id: String,
    pub status: ResponseStatus,
    pub msg: Option<String>,
}

impl ItemResult {
    fn from_result(id: &str, result: Result<Option<String>>) -> Self {
        match result {
            Ok(msg) => Self {
                id: id.to_string(),
                status: ResponseStatus::Ok,
                msg,
            },
            Err(e) => Self {
                id: id.to_string(),
                status: ResponseStatus::Error,
                msg: Some(e.to_string()),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

/// Whether `path` resolves inside `root`.
async fn is_within(root: &Path, path: &Path) -> bool {
    let (Ok(root), Ok(path)) = (
        tokio::fs::canonicalize(root).await,
        tokio::fs::canonicalize(path).await,
    ) else {
        return false;
    };
    path.starts_with(root)
}

impl DownloadQueue {
    /// Cancel pending items. Running downloads are killed; items that never started move to
    /// history directly.
    pub async fn cancel(&self, ids: &[String]) -> Vec<ItemResult> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let result = self.cancel_one(id).await.map(|()| None);
            results.push(ItemResult::from_result(id, result));
        }
        results
    }

    pub(super) async fn cancel_one(&self, id: &str) -> Result<()> {
        let lifecycle = self.active.get(id).map(|entry| entry.value().clone());
        if let Some(lifecycle) = lifecycle {
            info!(id, "Cancelling running download");
            lifecycle.cancel().await;
            lifecycle.close().await;
            self.complete(id).await;
            return Ok(());
        }

        let mut record = self
            .pending
            .get(id)
            .ok_or_else(|| Error::not_found("download", id))?;
        record.status = DownloadStatus::Cancelled;
        debug!(id, "Cancelling download that never started");
        self.history.put(record.clone()).await;
        self.pending.delete(id).await;
        self.events.publish(QueueEvent::Completed {
            record: Box::new(record),
        });
        Ok(())
    }

    /// Remove history records, optionally deleting finished output files.
    pub async fn clear(&self, ids: &[String], remove_file: bool) -> Vec<ItemResult> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let result = self.clear_one(id, remove_file).await;
            results.push(ItemResult::from_result(id, result));
        }
        results
    }

    async fn clear_one(&self, id: &str, remove_file: bool) -> Result<Option<String>> {
        let record = self
            .history
            .get(id)
            .ok_or_else(|| Error::not_found("download", id))?;

        let mut msg = None;
        if remove_file {
            if !self.config.remove_files {
                msg = Some("File removal is disabled".to_string());
            } else if record.status == DownloadStatus::Finished
                && let Some(path) = record.output_path(&self.config.lifecycle.download_root)
            {
                if !is_within(&self.config.lifecycle.download_root, &path).await {
                    return Err(Error::Other(format!(
                        "Refusing to delete {} outside the download directory",
                        path.display()
                    )));
                }
                tokio::fs::remove_file(&path).await?;
                info!(id, path = %path.display(), "Removed downloaded file");
                if let Some(archive_id) = record.archive_id.as_deref()
                    && let Err(e) = self.archive.delete(archive_id).await
                {
                    warn!(id, error = %e, "Failed to remove archive id");
                }
            }
        }

        self.history.delete(id).await;
        self.events.publish(QueueEvent::Removed {
            partition: Partition::History,
            id: id.to_string(),
        });
        Ok(msg)
    }

    /// Re-admit failed, cancelled or not-live history records with their original options.
    pub async fn retry(self: &Arc<Self>, ids: &[String]) -> Vec<ItemResult> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let result = self.retry_one(id).await.map(|()| None);
            results.push(ItemResult::from_result(id, result));
        }
        results
    }

    pub(super) async fn retry_one(self: &Arc<Self>, id: &str) -> Result<()> {
        let record = self
            .history
            .get(id)
            .ok_or_else(|| Error::not_found("download", id))?;
        if !record.is_retryable() {
            return Err(Error::InvalidStateTransition {
                from: record.status.to_string(),
                to: DownloadStatus::Idle.to_string(),
            });
        }

        self.history.delete(id).await;
        self.events.publish(QueueEvent::Removed {
            partition: Partition::History,
            id: id.to_string(),
        });

        let mut ctx = AdmissionContext::new(self.config.max_admission_depth);
        match self
            .admit(&record.url, record.options.clone(), record.auto_start, &mut ctx)
            .await
        {
            Ok(_) => {
                info!(id, url = %record.url, "Retried download");
                Ok(())
            }
            Err(e) => {
                // Keep the record so the failure is visible and retryable.
                self.history.put(record).await;
                Err(e)
            }
        }
    }

    /// Allow pending items to be dispatched.
    pub async fn start_items(&self, ids: &[String]) -> Vec<ItemResult> {
        let results = self.set_auto_start(ids, true).await;
        self.dispatch.notify_one();
        results
    }

    /// Keep pending items that have not started from being dispatched.
    pub async fn pause_items(&self, ids: &[String]) -> Vec<ItemResult> {
        self.set_auto_start(ids, false).await
    }

    async fn set_auto_start(&self, ids: &[String], auto_start: bool) -> Vec<ItemResult> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let result = self.set_auto_start_one(id, auto_start).await.map(|()| None);
            results.push(ItemResult::from_result(id, result));
        }
        results
    }

    async fn set_auto_start_one(&self, id: &str, auto_start: bool) -> Result<()> {
        let record = self
            .pending
            .get(id)
            .ok_or_else(|| Error::not_found("download", id))?;
        if self.active.contains_key(id) || record.status != DownloadStatus::Idle {
            return Err(Error::Other(format!("Download {id} has already started")));
        }
        if record.auto_start == auto_start {
            return Ok(());
        }
        if let Some(updated) = self
            .pending
            .update(id, |r| r.auto_start = auto_start, true)
            .await
        {
            self.events.publish(QueueEvent::Updated {
                record: Box::new(updated),
            });
        }
        Ok(())
    }
}
