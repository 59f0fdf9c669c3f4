//! Download record domain module.

mod entity;
mod state;

pub use entity::{DownloadRecord, TransferProgress};
pub use state::DownloadStatus;
