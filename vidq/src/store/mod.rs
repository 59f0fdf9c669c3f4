//! Persistent, insertion-ordered item store.
//!
//! Each [`ItemStore`] owns one partition (pending or history) of the `downloads` table and
//! keeps an in-memory index that is authoritative for lookups. Durable writes mirror every
//! mutation; a failed durable write is logged and the in-memory state is kept. Both sides
//! order records the same way: a record goes last when it enters the partition and keeps
//! its place while it is updated, so a reload reproduces the in-memory order.

mod page;

pub use page::{MAX_PER_PAGE, Page, PageWindow, SortOrder, StatusFilter};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::Result;
use crate::database::models::{DownloadDbModel, Partition};
use crate::database::repositories::DownloadRepository;
use crate::database::time::datetime_to_ms;
use crate::domain::{DownloadRecord, DownloadStatus};

/// Capacity of the error side channel.
const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Keyed, ordered collection of download records backed by one table partition.
pub struct ItemStore {
    partition: Partition,
    items: RwLock<IndexMap<String, DownloadRecord>>,
    repo: Arc<dyn DownloadRepository>,
    errors: broadcast::Sender<DownloadRecord>,
}

impl ItemStore {
    pub fn new(partition: Partition, repo: Arc<dyn DownloadRepository>) -> Self {
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            partition,
            items: RwLock::new(IndexMap::new()),
            repo,
            errors,
        }
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    /// Subscribe to records stored with status `error`.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<DownloadRecord> {
        self.errors.subscribe()
    }

    /// Hydrate the in-memory index from durable storage, in listing order.
    ///
    /// Rows that fail to decode are skipped. Returns the number of loaded records.
    pub async fn load(&self) -> Result<usize> {
        let rows = self.repo.list_by_partition(self.partition).await?;
        let mut loaded = IndexMap::with_capacity(rows.len());
        for row in rows {
            match row.to_record() {
                Ok(record) => {
                    loaded.insert(record.id.clone(), record);
                }
                Err(e) => {
                    warn!(id = %row.id, partition = %self.partition, error = %e, "Skipping undecodable download row");
                }
            }
        }

        let count = loaded.len();
        *self.items.write() = loaded;
        debug!(partition = %self.partition, count, "Loaded download records");
        Ok(count)
    }

    pub fn get(&self, key: &str) -> Option<DownloadRecord> {
        self.items.read().get(key).cloned()
    }

    pub fn get_by_source_id(&self, source_id: &str) -> Option<DownloadRecord> {
        self.find(|r| r.source_id == source_id)
    }

    pub fn get_by_url(&self, url: &str) -> Option<DownloadRecord> {
        self.find(|r| r.url == url)
    }

    /// First record in insertion order matching `predicate`.
    pub fn find<F>(&self, predicate: F) -> Option<DownloadRecord>
    where
        F: Fn(&DownloadRecord) -> bool,
    {
        self.items.read().values().find(|r| predicate(r)).cloned()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.items.read().contains_key(key)
    }

    /// Insert or replace a record. A replaced record keeps its position.
    pub async fn put(&self, record: DownloadRecord) {
        self.items
            .write()
            .insert(record.id.clone(), record.clone());
        self.persist(&record).await;
    }

    /// Mutate a record in place, optionally mirroring the result to durable storage.
    ///
    /// Returns the updated record, or `None` if the key is unknown.
    pub async fn update<F>(&self, key: &str, f: F, persist: bool) -> Option<DownloadRecord>
    where
        F: FnOnce(&mut DownloadRecord),
    {
        let updated = {
            let mut items = self.items.write();
            let record = items.get_mut(key)?;
            f(record);
            record.clone()
        };
        if persist {
            self.persist(&updated).await;
        }
        Some(updated)
    }

    /// Remove a record from this partition, in memory and durably.
    pub async fn delete(&self, key: &str) -> Option<DownloadRecord> {
        let removed = self.items.write().shift_remove(key);
        if let Err(e) = self.repo.delete(self.partition, key).await {
            warn!(id = %key, partition = %self.partition, error = %e, "Failed to delete download row");
        }
        removed
    }

    /// Delete records with `status` created before `cutoff`.
    pub async fn purge_before(
        &self,
        status: DownloadStatus,
        cutoff: DateTime<Utc>,
    ) -> Vec<DownloadRecord> {
        let removed: Vec<DownloadRecord> = {
            let mut items = self.items.write();
            let expired: Vec<String> = items
                .values()
                .filter(|r| r.status == status && r.created_at < cutoff)
                .map(|r| r.id.clone())
                .collect();
            expired
                .iter()
                .filter_map(|id| items.shift_remove(id))
                .collect()
        };

        // Rows can exist durably without a memory entry if an earlier delete failed.
        match self
            .repo
            .delete_by_status_before(self.partition, status.as_str(), datetime_to_ms(cutoff))
            .await
        {
            Ok(rows) => debug!(partition = %self.partition, rows, "Purged expired rows"),
            Err(e) => warn!(partition = %self.partition, error = %e, "Failed to purge expired rows"),
        }

        removed
    }

    /// Ordered snapshot of all records.
    pub fn items(&self) -> Vec<DownloadRecord> {
        self.items.read().values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.items.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// One page of records, filtered by status, read from durable storage.
    pub async fn paginate(
        &self,
        page: usize,
        per_page: usize,
        order: SortOrder,
        status_filter: Option<StatusFilter>,
    ) -> Result<Page<DownloadRecord>> {
        let clause = status_filter.map(|f| f.clause());
        let total = self.repo.count(self.partition, clause).await?;
        let window = PageWindow::new(page, per_page, total as usize);

        let rows = self
            .repo
            .list_page(
                self.partition,
                clause,
                order == SortOrder::Desc,
                window.per_page as u32,
                window.offset() as u32,
            )
            .await?;
        let items = rows
            .into_iter()
            .filter_map(|row| match row.to_record() {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(id = %row.id, partition = %self.partition, error = %e, "Skipping undecodable download row");
                    None
                }
            })
            .collect();
        Ok(Page::new(items, window))
    }

    async fn persist(&self, record: &DownloadRecord) {
        if record.status == DownloadStatus::Error {
            let _ = self.errors.send(record.clone());
        }

        let model = match DownloadDbModel::from_record(record, self.partition) {
            Ok(model) => model,
            Err(e) => {
                warn!(id = %record.id, error = %e, "Failed to serialize download record");
                return;
            }
        };
        if let Err(e) = self.repo.upsert(&model).await {
            warn!(id = %record.id, partition = %self.partition, error = %e, "Failed to persist download record");
        }
    }
}
