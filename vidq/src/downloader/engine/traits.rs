//! Media extractor trait and related types.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;
use crate::domain::{DownloadRecord, ItemOptions};
use crate::downloader::progress::ProgressEvent;

/// Live status reported by the extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveStatus {
    NotLive,
    IsLive,
    IsUpcoming,
    WasLive,
    PostLive,
}

impl LiveStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_live" => Some(Self::NotLive),
            "is_live" => Some(Self::IsLive),
            "is_upcoming" => Some(Self::IsUpcoming),
            "was_live" => Some(Self::WasLive),
            "post_live" => Some(Self::PostLive),
            _ => None,
        }
    }
}

/// Metadata of a single downloadable item.
#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub id: String,
    pub title: String,
    /// Canonical page URL.
    pub url: String,
    pub extractor_key: Option<String>,
    pub live_status: Option<LiveStatus>,
    /// Scheduled start of an upcoming stream or premiere, Unix seconds.
    pub release_timestamp: Option<i64>,
    pub duration: Option<f64>,
    /// Whether the extractor returned any downloadable format.
    pub has_formats: bool,
    /// Full info object, used for condition rules.
    pub raw: Value,
}

impl MediaInfo {
    /// Archive id in yt-dlp's `"<extractor> <id>"` format.
    pub fn archive_id(&self) -> Option<String> {
        let extractor = self.extractor_key.as_deref()?;
        Some(format!("{} {}", extractor.to_lowercase(), self.id))
    }

    /// Whether the info describes a premiere rather than a regular live stream.
    pub fn is_premiere(&self) -> bool {
        if let Some(flag) = self.raw.get("is_premiere").and_then(Value::as_bool) {
            return flag;
        }
        self.live_status == Some(LiveStatus::IsUpcoming)
            && self.duration.is_some_and(|d| d > 0.0)
    }
}

/// One entry of a flat playlist.
#[derive(Debug, Clone)]
pub struct PlaylistEntry {
    pub url: String,
    pub id: Option<String>,
    pub title: Option<String>,
}

/// Metadata of a playlist.
#[derive(Debug, Clone)]
pub struct PlaylistInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub entries: Vec<PlaylistEntry>,
}

/// Result of metadata extraction.
#[derive(Debug, Clone)]
pub enum Extraction {
    Item(Box<MediaInfo>),
    Playlist(PlaylistInfo),
}

/// Filesystem locations for one download.
#[derive(Debug, Clone)]
pub struct DownloadPaths {
    /// Private per-item temp directory.
    pub temp_dir: PathBuf,
    /// Final output directory (download root plus the item's folder).
    pub download_dir: PathBuf,
}

/// A child process invocation that downloads one item.
#[derive(Debug, Clone, Default)]
pub struct DownloadCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl DownloadCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Trait for media extraction collaborators.
#[async_trait]
pub trait MediaExtractor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Resolve a URL into an item or a playlist.
    async fn extract(&self, url: &str, options: &ItemOptions) -> Result<Extraction>;

    /// Build the child process invocation that downloads `record`.
    fn download_command(&self, record: &DownloadRecord, paths: &DownloadPaths)
    -> Result<DownloadCommand>;

    /// Archive id derivable from the URL alone, before extraction.
    fn archive_id(&self, url: &str) -> Option<String>;

    /// Interpret a non-JSON output line of the download process.
    fn classify_output(&self, _line: &str) -> Option<ProgressEvent> {
        None
    }
}
