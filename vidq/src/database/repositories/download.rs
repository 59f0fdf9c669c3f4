//! Download repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::{DownloadDbModel, Partition, StatusClause};
use crate::database::retry::retry_on_sqlite_busy;

const SELECT_COLUMNS: &str = "SELECT id, partition, url, data, created_at FROM downloads";

/// Download repository trait.
#[async_trait]
pub trait DownloadRepository: Send + Sync {
    /// All rows of a partition in listing order.
    async fn list_by_partition(&self, partition: Partition) -> Result<Vec<DownloadDbModel>>;
    /// One window of a partition in listing order, optionally filtered by status.
    async fn list_page(
        &self,
        partition: Partition,
        status: Option<StatusClause<'_>>,
        descending: bool,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<DownloadDbModel>>;
    /// Count rows of a partition, optionally filtered by status.
    async fn count(&self, partition: Partition, status: Option<StatusClause<'_>>) -> Result<u64>;
    /// Insert or replace a row by id. A new row, or one that changes partition, is placed
    /// last in its partition; an in-place update keeps its position.
    async fn upsert(&self, model: &DownloadDbModel) -> Result<()>;
    /// Delete a row from a partition. Returns whether a row was removed.
    async fn delete(&self, partition: Partition, id: &str) -> Result<bool>;
    /// Delete rows of a partition with the given status created before `cutoff_ms`.
    async fn delete_by_status_before(
        &self,
        partition: Partition,
        status: &str,
        cutoff_ms: i64,
    ) -> Result<u64>;
}

/// SQLx implementation of DownloadRepository.
pub struct SqlxDownloadRepository {
    pool: SqlitePool,
}

impl SqlxDownloadRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn where_clause(status: Option<StatusClause<'_>>) -> &'static str {
    match status {
        None => "WHERE partition = ?",
        Some(StatusClause { negated: false, .. }) => {
            "WHERE partition = ? AND json_extract(data, '$.status') = ?"
        }
        Some(StatusClause { negated: true, .. }) => {
            "WHERE partition = ? AND json_extract(data, '$.status') IS NOT ?"
        }
    }
}

#[async_trait]
impl DownloadRepository for SqlxDownloadRepository {
    async fn list_by_partition(&self, partition: Partition) -> Result<Vec<DownloadDbModel>> {
        let sql = format!("{SELECT_COLUMNS} WHERE partition = ? ORDER BY position, rowid");
        let rows = sqlx::query_as::<_, DownloadDbModel>(&sql)
            .bind(partition.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn list_page(
        &self,
        partition: Partition,
        status: Option<StatusClause<'_>>,
        descending: bool,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<DownloadDbModel>> {
        let order = if descending {
            "ORDER BY position DESC, rowid DESC"
        } else {
            "ORDER BY position, rowid"
        };
        let sql = format!(
            "{SELECT_COLUMNS} {} {order} LIMIT ? OFFSET ?",
            where_clause(status)
        );

        let mut query = sqlx::query_as::<_, DownloadDbModel>(&sql).bind(partition.as_str());
        if let Some(clause) = status {
            query = query.bind(clause.status);
        }
        let rows = query.bind(limit).bind(offset).fetch_all(&self.pool).await?;
        Ok(rows)
    }

    async fn count(&self, partition: Partition, status: Option<StatusClause<'_>>) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM downloads {}", where_clause(status));
        let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(partition.as_str());
        if let Some(clause) = status {
            query = query.bind(clause.status);
        }
        let count = query.fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    async fn upsert(&self, model: &DownloadDbModel) -> Result<()> {
        retry_on_sqlite_busy("download_upsert", || async {
            sqlx::query(
                r#"
                INSERT INTO downloads (id, partition, url, data, created_at, position)
                VALUES (?, ?, ?, ?, ?, (SELECT COALESCE(MAX(position), 0) + 1 FROM downloads))
                ON CONFLICT(id) DO UPDATE SET
                    position = CASE
                        WHEN downloads.partition = excluded.partition THEN downloads.position
                        ELSE excluded.position
                    END,
                    partition = excluded.partition,
                    url = excluded.url,
                    data = excluded.data
                "#,
            )
            .bind(&model.id)
            .bind(&model.partition)
            .bind(&model.url)
            .bind(&model.data)
            .bind(model.created_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, partition: Partition, id: &str) -> Result<bool> {
        retry_on_sqlite_busy("download_delete", || async {
            let result = sqlx::query("DELETE FROM downloads WHERE id = ? AND partition = ?")
                .bind(id)
                .bind(partition.as_str())
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn delete_by_status_before(
        &self,
        partition: Partition,
        status: &str,
        cutoff_ms: i64,
    ) -> Result<u64> {
        retry_on_sqlite_busy("download_delete_expired", || async {
            let result = sqlx::query(
                r#"
                DELETE FROM downloads
                WHERE partition = ?
                  AND json_extract(data, '$.status') = ?
                  AND created_at < ?
                "#,
            )
            .bind(partition.as_str())
            .bind(status)
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}
