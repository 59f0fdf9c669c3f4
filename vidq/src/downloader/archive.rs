//! yt-dlp compatible download archive.
//!
//! One `"<extractor> <id>"` entry per line. The file is read once when opened; additions are
//! appended and deletions rewrite the file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::Result;

/// Download archive backed by an optional file. Without a file every query misses.
pub struct DownloadArchive {
    path: Option<PathBuf>,
    entries: Mutex<HashSet<String>>,
}

impl DownloadArchive {
    /// An archive that never records anything.
    pub fn disabled() -> Self {
        Self {
            path: None,
            entries: Mutex::new(HashSet::new()),
        }
    }

    /// Open (or lazily create) the archive at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match fs::read_to_string(&path).await {
            Ok(content) => content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), count = entries.len(), "Opened download archive");

        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn is_archived(&self, archive_id: &str) -> bool {
        self.is_enabled() && self.entries.lock().await.contains(archive_id.trim())
    }

    /// Record an id. Returns `false` if it was already present or the archive is disabled.
    pub async fn add(&self, archive_id: &str) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let id = archive_id.trim();

        let mut entries = self.entries.lock().await;
        if !entries.insert(id.to_string()) {
            return Ok(false);
        }

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(format!("{id}\n").as_bytes()).await?;
        file.flush().await?;
        Ok(true)
    }

    /// Remove an id. Returns whether it was present.
    pub async fn delete(&self, archive_id: &str) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };

        let mut entries = self.entries.lock().await;
        if !entries.remove(archive_id.trim()) {
            return Ok(false);
        }

        // Preserve the on-disk order of the remaining lines.
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                // Never rewrite the file from a partial view.
                entries.insert(archive_id.trim().to_string());
                return Err(e.into());
            }
        };
        let mut kept: String = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && *l != archive_id.trim())
            .collect::<Vec<_>>()
            .join("\n");
        if !kept.is_empty() {
            kept.push('\n');
        }
        fs::write(path, kept).await?;
        Ok(true)
    }
}
