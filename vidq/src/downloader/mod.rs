//! Download execution.
//!
//! - [`engine`]: the media extractor seam and its yt-dlp implementation
//! - [`lifecycle`]: one supervised child process per item
//! - [`progress`]: the progress wire format spoken by the child
//! - [`archive`]: the on-disk list of completed archive ids

pub mod archive;
pub mod engine;
pub mod lifecycle;
pub mod progress;

pub use archive::DownloadArchive;
pub use engine::{
    DownloadCommand, DownloadPaths, Extraction, LiveStatus, MediaExtractor, MediaInfo,
    PlaylistEntry, PlaylistInfo, YtDlpConfig, YtDlpEngine,
};
pub use lifecycle::{
    DownloadLifecycle, LifecycleConfig, LifecycleSnapshot, NullSink, ProgressSink, temp_dir_for,
};
pub use progress::{ProgressEvent, ProgressMessage};
