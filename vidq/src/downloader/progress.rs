//! Progress channel between a download process and its lifecycle.
//!
//! The child writes newline-delimited JSON objects whose field names match yt-dlp's progress
//! dict, so `--progress-template "download:%(progress)j"` can be passed straight through:
//!
//! ```json
//! {"status": "downloading", "downloaded_bytes": 1024, "total_bytes": 4096, "speed": 512.0, "eta": 6}
//! ```
//!
//! Each line decodes into a [`ProgressEvent`]. Lines that are not JSON objects, or carry an
//! unknown status, are dropped.

use serde::{Deserialize, Serialize};

/// Raw progress message as written by the child.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProgressMessage {
    pub status: String,
    #[serde(default)]
    pub downloaded_bytes: Option<f64>,
    #[serde(default)]
    pub total_bytes: Option<f64>,
    #[serde(default)]
    pub total_bytes_estimate: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub eta: Option<f64>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub tmpfilename: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Decoded progress event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// The process is setting up.
    Preparing { msg: Option<String> },
    /// Bytes are flowing.
    Downloading {
        downloaded_bytes: Option<u64>,
        total_bytes: Option<u64>,
        speed: Option<f64>,
        eta: Option<u64>,
        filename: Option<String>,
        tmpfilename: Option<String>,
    },
    /// One file finished downloading; post-processing may follow.
    FileFinished {
        filename: Option<String>,
        total_bytes: Option<u64>,
    },
    /// The output was moved to its final location.
    Moved { filename: String },
    /// The child reported a failure.
    Error { error: String },
    /// The child decided not to download the item.
    Skip { msg: Option<String> },
    /// The item is a live stream or premiere that has not started.
    NotLive { msg: Option<String> },
    /// Informational message.
    Message { msg: String },
}

fn to_u64(value: Option<f64>) -> Option<u64> {
    value.filter(|v| v.is_finite() && *v >= 0.0).map(|v| v as u64)
}

impl ProgressMessage {
    /// Convert into a typed event. Unknown statuses yield `None`.
    pub fn into_event(self) -> Option<ProgressEvent> {
        let event = match self.status.as_str() {
            "preparing" => ProgressEvent::Preparing { msg: self.msg },
            "downloading" => ProgressEvent::Downloading {
                downloaded_bytes: to_u64(self.downloaded_bytes),
                total_bytes: to_u64(self.total_bytes.or(self.total_bytes_estimate)),
                speed: self.speed.filter(|s| s.is_finite()),
                eta: to_u64(self.eta),
                filename: self.filename,
                tmpfilename: self.tmpfilename,
            },
            "finished" => ProgressEvent::FileFinished {
                total_bytes: to_u64(
                    self.total_bytes
                        .or(self.downloaded_bytes)
                        .or(self.total_bytes_estimate),
                ),
                filename: self.filename,
            },
            "moved" => ProgressEvent::Moved {
                filename: self.filename?,
            },
            "error" => ProgressEvent::Error {
                error: self
                    .error
                    .or(self.msg)
                    .unwrap_or_else(|| "Download failed".to_string()),
            },
            "skip" => ProgressEvent::Skip { msg: self.msg },
            "not_live" => ProgressEvent::NotLive { msg: self.msg },
            "message" => ProgressEvent::Message { msg: self.msg? },
            _ => return None,
        };
        Some(event)
    }
}

impl ProgressEvent {
    /// Decode one line of child output.
    pub fn decode(line: &str) -> Option<Self> {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        serde_json::from_str::<ProgressMessage>(line)
            .ok()
            .and_then(ProgressMessage::into_event)
    }

    /// Whether this event carries a terminal decision made by the child.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Skip { .. } | Self::NotLive { .. })
    }
}
