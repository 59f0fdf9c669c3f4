//! Media extraction engine abstraction.
//!
//! This module defines the `MediaExtractor` trait and the yt-dlp backed implementation.

mod traits;
mod ytdlp;

pub use traits::{
    DownloadCommand, DownloadPaths, Extraction, LiveStatus, MediaExtractor, MediaInfo,
    PlaylistEntry, PlaylistInfo,
};
pub use ytdlp::{
    ArchiveIdPattern, DEFAULT_OUTPUT_TEMPLATE, YtDlpConfig, YtDlpEngine, expand_template_extras,
    parse_extraction,
};
