//! Database row models.

pub mod download;

pub use download::{DownloadDbModel, Partition, StatusClause};
