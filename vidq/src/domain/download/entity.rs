//! Download record entity.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::DownloadStatus;
use crate::domain::ItemOptions;

/// Byte-level progress of a running download.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    /// Bytes per second.
    pub speed: Option<f64>,
    /// Seconds remaining.
    pub eta: Option<u64>,
    pub percent: Option<f64>,
}

impl TransferProgress {
    /// Record a new sample, recomputing the percentage when the total is known.
    pub fn record(
        &mut self,
        downloaded: Option<u64>,
        total: Option<u64>,
        speed: Option<f64>,
        eta: Option<u64>,
    ) {
        if downloaded.is_some() {
            self.downloaded_bytes = downloaded;
        }
        if total.is_some() {
            self.total_bytes = total;
        }
        self.speed = speed;
        self.eta = eta;

        self.percent = match (self.downloaded_bytes, self.total_bytes) {
            (Some(done), Some(total)) if total > 0 => {
                Some((done as f64 / total as f64 * 100.0).min(100.0))
            }
            _ => self.percent,
        };
    }

    /// Mark the transfer complete.
    pub fn complete(&mut self) {
        if let Some(total) = self.total_bytes.or(self.downloaded_bytes) {
            self.downloaded_bytes = Some(total);
            self.total_bytes = Some(total);
        }
        self.percent = Some(100.0);
        self.speed = None;
        self.eta = Some(0);
    }
}

/// A single downloadable item, pending or in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    /// Store key.
    pub id: String,
    /// Media id reported by the extractor.
    pub source_id: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub status: DownloadStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_live_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub options: ItemOptions,
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
    #[serde(default)]
    pub progress: TransferProgress,
    #[serde(default)]
    pub archive_id: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub temp_filename: Option<String>,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub is_live: bool,
    #[serde(default)]
    pub is_premiere: bool,
    /// Duration in seconds, when the extractor knows it.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub extractor: Option<String>,
}

fn default_auto_start() -> bool {
    true
}

impl DownloadRecord {
    /// Create a new idle record.
    pub fn new(
        url: impl Into<String>,
        source_id: impl Into<String>,
        title: impl Into<String>,
        options: ItemOptions,
    ) -> Self {
        let folder = options.folder.clone();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_id: source_id.into(),
            title: title.into(),
            url: url.into(),
            status: DownloadStatus::Idle,
            error: None,
            msg: None,
            created_at: Utc::now(),
            scheduled_live_at: None,
            options,
            auto_start: true,
            progress: TransferProgress::default(),
            archive_id: None,
            filename: None,
            temp_filename: None,
            folder,
            is_live: false,
            is_premiere: false,
            duration: None,
            extractor: None,
        }
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn with_archive_id(mut self, archive_id: Option<String>) -> Self {
        self.archive_id = archive_id;
        self
    }

    pub fn with_extractor(mut self, extractor: Option<String>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Whether the dispatch loop may pick this record up.
    pub fn is_eligible(&self) -> bool {
        self.auto_start && self.status == DownloadStatus::Idle
    }

    /// Whether the record is retryable from history.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.status,
            DownloadStatus::Error | DownloadStatus::Cancelled | DownloadStatus::NotLive
        )
    }

    /// Mark a terminal failure.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = DownloadStatus::Error;
        self.error = Some(message.into());
    }

    /// Whether a live or premiere record waiting in history is due to be re-admitted.
    ///
    /// Records without a scheduled time are never due, and neither are records whose due
    /// time falls outside the representable range.
    pub fn is_live_due(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        let waiting = match self.status {
            DownloadStatus::NotLive => true,
            DownloadStatus::Error => self.is_live,
            _ => false,
        };
        if !waiting {
            return false;
        }

        let Some(scheduled) = self.scheduled_live_at else {
            return false;
        };

        let Some(mut due) = scheduled.checked_add_signed(buffer) else {
            return false;
        };
        if self.is_premiere
            && let Some(length) = self.premiere_length()
        {
            match due.checked_add_signed(length) {
                Some(extended) => due = extended,
                None => return false,
            }
        }
        due <= now
    }

    /// Reported running time of a premiere. Negative or non-finite durations are ignored.
    fn premiere_length(&self) -> Option<Duration> {
        let secs = self.duration.filter(|d| d.is_finite() && *d > 0.0)?;
        // f64 to i64 casts saturate, so an oversized duration becomes i64::MAX here.
        Duration::try_milliseconds((secs * 1000.0) as i64).or(Some(Duration::MAX))
    }

    /// Absolute path of the final output file, if known.
    pub fn output_path(&self, download_root: &Path) -> Option<PathBuf> {
        let filename = self.filename.as_deref()?;
        let path = Path::new(filename);
        if path.is_absolute() {
            return Some(path.to_path_buf());
        }
        let mut base = download_root.to_path_buf();
        if let Some(folder) = self.folder.as_deref() {
            base.push(folder);
        }
        Some(base.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DownloadRecord {
        DownloadRecord::new(
            "https://example.com/watch?v=abc",
            "abc",
            "A video",
            ItemOptions::default(),
        )
    }

    #[test]
    fn test_new_record_is_eligible() {
        let r = record();
        assert_eq!(r.status, DownloadStatus::Idle);
        assert!(r.is_eligible());
        assert!(!r.clone().with_auto_start(false).is_eligible());
    }

    #[test]
    fn test_progress_percent() {
        let mut p = TransferProgress::default();
        p.record(Some(50), Some(200), Some(10.0), Some(15));
        assert_eq!(p.percent, Some(25.0));

        // Missing total keeps the previous total.
        p.record(Some(100), None, None, None);
        assert_eq!(p.percent, Some(50.0));

        p.complete();
        assert_eq!(p.downloaded_bytes, Some(200));
        assert_eq!(p.percent, Some(100.0));
    }

    #[test]
    fn test_live_due() {
        let now = Utc::now();
        let mut r = record();
        r.status = DownloadStatus::NotLive;
        assert!(!r.is_live_due(now, Duration::zero()));

        r.scheduled_live_at = Some(now - Duration::minutes(10));
        assert!(r.is_live_due(now, Duration::minutes(5)));
        assert!(!r.is_live_due(now, Duration::minutes(15)));

        r.is_premiere = true;
        r.duration = Some(600.0);
        assert!(!r.is_live_due(now, Duration::minutes(5)));

        r.status = DownloadStatus::Error;
        r.is_premiere = false;
        assert!(!r.is_live_due(now, Duration::zero()));
        r.is_live = true;
        assert!(r.is_live_due(now, Duration::zero()));

        r.status = DownloadStatus::Finished;
        assert!(!r.is_live_due(now, Duration::zero()));
    }

    #[test]
    fn test_live_due_out_of_range() {
        let now = Utc::now();
        let mut r = record();
        r.status = DownloadStatus::NotLive;
        r.scheduled_live_at = Some(now - Duration::minutes(10));

        assert!(!r.is_live_due(now, Duration::MAX));

        r.is_premiere = true;
        r.duration = Some(1e300);
        assert!(!r.is_live_due(now, Duration::zero()));
        r.duration = Some(f64::INFINITY);
        assert!(r.is_live_due(now, Duration::zero()));

        // Negative and NaN lengths do not shift the due time.
        r.duration = Some(-1e300);
        assert!(r.is_live_due(now, Duration::minutes(5)));
        r.duration = Some(f64::NAN);
        assert!(r.is_live_due(now, Duration::minutes(5)));
    }

    #[test]
    fn test_output_path() {
        let root = Path::new("/downloads");
        let mut r = record();
        assert!(r.output_path(root).is_none());

        r.filename = Some("video.mp4".into());
        assert_eq!(r.output_path(root), Some(PathBuf::from("/downloads/video.mp4")));

        r.folder = Some("music".into());
        assert_eq!(
            r.output_path(root),
            Some(PathBuf::from("/downloads/music/video.mp4"))
        );
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let json = r#"{
            "id": "1", "source_id": "abc", "title": "t",
            "url": "https://example.com", "created_at": "2024-01-01T00:00:00Z"
        }"#;
        let r: DownloadRecord = serde_json::from_str(json).unwrap();
        assert_eq!(r.status, DownloadStatus::Idle);
        assert!(r.auto_start);
        assert!(r.options.cli_args.is_empty());
    }
}
