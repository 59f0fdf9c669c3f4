//! Domain layer for vidq.
//!
//! This module contains the download record, its status state machine, per-item options and
//! the condition rules evaluated at admission.

pub mod condition;
pub mod download;
pub mod options;

pub use condition::{ConditionAction, ConditionRule, MatchFilter};
pub use download::{DownloadRecord, DownloadStatus, TransferProgress};
pub use options::ItemOptions;
