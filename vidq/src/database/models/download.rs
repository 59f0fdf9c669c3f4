//! Download row model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::Result;
use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::domain::DownloadRecord;

/// Logical partition of the `downloads` table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Pending,
    History,
}

impl Partition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::History => "history",
        }
    }
}

/// Status predicate of a partition listing, matched against `data.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusClause<'a> {
    pub status: &'a str,
    /// Keep rows whose status differs instead.
    pub negated: bool,
}

/// Download database model.
///
/// The full record lives in `data` as JSON; `url` and `created_at` are denormalized for
/// lookups and ordering.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DownloadDbModel {
    pub id: String,
    pub partition: String,
    pub url: String,
    /// JSON-serialized [`DownloadRecord`].
    pub data: String,
    /// Unix epoch milliseconds.
    pub created_at: i64,
}

impl DownloadDbModel {
    pub fn from_record(record: &DownloadRecord, partition: Partition) -> Result<Self> {
        Ok(Self {
            id: record.id.clone(),
            partition: partition.as_str().to_string(),
            url: record.url.clone(),
            data: serde_json::to_string(record)?,
            created_at: datetime_to_ms(record.created_at),
        })
    }

    pub fn to_record(&self) -> Result<DownloadRecord> {
        let mut record: DownloadRecord = serde_json::from_str(&self.data)?;
        // Columns are authoritative for the key fields.
        record.id.clone_from(&self.id);
        record.created_at = ms_to_datetime(self.created_at);
        Ok(record)
    }
}
