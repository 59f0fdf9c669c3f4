//! yt-dlp extraction engine.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::traits::{
    DownloadCommand, DownloadPaths, Extraction, LiveStatus, MediaExtractor, MediaInfo,
    PlaylistEntry, PlaylistInfo,
};
use crate::domain::{DownloadRecord, ItemOptions};
use crate::downloader::progress::ProgressEvent;
use crate::{Error, Result};

/// Default yt-dlp output template.
pub const DEFAULT_OUTPUT_TEMPLATE: &str = "%(title)s [%(id)s].%(ext)s";

/// Reports the final path after post-processing as a progress message.
const MOVED_PRINT_TEMPLATE: &str = r#"after_move:{"status":"moved","filename":%(filepath)j}"#;

/// URL pattern mapping to an archive id before extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveIdPattern {
    /// Extractor key, lowercased in the archive id.
    pub extractor: String,
    /// Regex with an `id` capture group.
    pub pattern: String,
}

/// yt-dlp engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YtDlpConfig {
    /// Path to the yt-dlp executable.
    pub binary_path: String,
    /// Output template used when an item has none.
    pub output_template: String,
    /// Extra arguments for metadata extraction.
    pub extract_args: Vec<String>,
    /// Extra arguments for every download.
    pub download_args: Vec<String>,
    /// Patterns for pre-extraction archive ids.
    pub archive_patterns: Vec<ArchiveIdPattern>,
}

impl Default for YtDlpConfig {
    fn default() -> Self {
        Self {
            binary_path: "yt-dlp".to_string(),
            output_template: DEFAULT_OUTPUT_TEMPLATE.to_string(),
            extract_args: Vec::new(),
            download_args: Vec::new(),
            archive_patterns: vec![ArchiveIdPattern {
                extractor: "youtube".to_string(),
                pattern: r"(?:youtube\.com/(?:watch\?(?:.*&)?v=|shorts/|live/|embed/)|youtu\.be/)(?P<id>[0-9A-Za-z_-]{11})".to_string(),
            }],
        }
    }
}

/// yt-dlp based [`MediaExtractor`].
pub struct YtDlpEngine {
    config: YtDlpConfig,
    archive_patterns: Vec<(String, Regex)>,
    version: Option<String>,
}

impl YtDlpEngine {
    /// Build the engine without checking the binary; `version()` stays `None`.
    pub fn with_config(config: YtDlpConfig) -> Self {
        let archive_patterns = config
            .archive_patterns
            .iter()
            .filter_map(|p| match Regex::new(&p.pattern) {
                Ok(re) => Some((p.extractor.to_lowercase(), re)),
                Err(e) => {
                    warn!(extractor = %p.extractor, error = %e, "Ignoring invalid archive id pattern");
                    None
                }
            })
            .collect();

        Self {
            config,
            archive_patterns,
            version: None,
        }
    }

    /// Build the engine and record the version reported by `binary_path --version`.
    pub async fn detect(config: YtDlpConfig) -> Self {
        let mut engine = Self::with_config(config);
        engine.version = Self::detect_version(&engine.config.binary_path).await;
        engine
    }

    async fn detect_version(path: &str) -> Option<String> {
        let output = process_utils::tokio_command(path)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .ok()
            .filter(|output| output.status.success())?;
        String::from_utf8(output.stdout)
            .ok()?
            .lines()
            .next()
            .map(|line| line.trim().to_string())
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn is_available(&self) -> bool {
        self.version.is_some()
    }
}

#[async_trait]
impl MediaExtractor for YtDlpEngine {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn extract(&self, url: &str, options: &ItemOptions) -> Result<Extraction> {
        let mut cmd = process_utils::tokio_command(&self.config.binary_path);
        cmd.args([
            "--dump-single-json",
            "--flat-playlist",
            "--no-warnings",
            "--no-progress",
        ])
        .args(&self.config.extract_args)
        .args(&options.cli_args)
        .arg("--")
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        debug!(url = %url, "Extracting metadata");
        let output = cmd
            .output()
            .await
            .map_err(|e| Error::extraction(format!("Failed to run yt-dlp: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::extraction(last_error_line(&stderr).unwrap_or_else(|| {
                format!("yt-dlp exited with {}", output.status)
            })));
        }

        let value: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::extraction(format!("Invalid yt-dlp output: {e}")))?;
        parse_extraction(value, url)
    }

    fn download_command(
        &self,
        record: &DownloadRecord,
        paths: &DownloadPaths,
    ) -> Result<DownloadCommand> {
        let template = record
            .options
            .template
            .as_deref()
            .unwrap_or(&self.config.output_template);
        let template = expand_template_extras(template, &record.options.extras);

        Ok(DownloadCommand::new(&self.config.binary_path)
            .args([
                "--newline",
                "--progress",
                "--no-simulate",
                "--progress-template",
                "download:%(progress)j",
                "--print",
                MOVED_PRINT_TEMPLATE,
            ])
            .arg("-P")
            .arg(format!("temp:{}", paths.temp_dir.display()))
            .arg("-P")
            .arg(format!("home:{}", paths.download_dir.display()))
            .arg("-o")
            .arg(template)
            .args(self.config.download_args.iter().cloned())
            .args(record.options.cli_args.iter().cloned())
            .arg("--")
            .arg(&record.url)
            .env("PYTHONUNBUFFERED", "1")
            .cwd(&paths.temp_dir))
    }

    fn archive_id(&self, url: &str) -> Option<String> {
        self.archive_patterns.iter().find_map(|(extractor, re)| {
            re.captures(url)
                .and_then(|caps| caps.name("id"))
                .map(|id| format!("{} {}", extractor, id.as_str()))
        })
    }

    fn classify_output(&self, line: &str) -> Option<ProgressEvent> {
        let line = line.trim();
        let lower = line.to_ascii_lowercase();

        if lower.contains("live event will begin")
            || lower.contains("premieres in")
            || lower.contains("waiting for scheduled stream")
        {
            return Some(ProgressEvent::NotLive {
                msg: Some(strip_error_prefix(line).to_string()),
            });
        }
        if lower.contains("has already been recorded in the archive") {
            return Some(ProgressEvent::Skip {
                msg: Some(line.to_string()),
            });
        }
        if line.starts_with("ERROR:") {
            return Some(ProgressEvent::Error {
                error: strip_error_prefix(line).to_string(),
            });
        }
        None
    }
}

fn strip_error_prefix(line: &str) -> &str {
    line.strip_prefix("ERROR:").map(str::trim).unwrap_or(line)
}

fn last_error_line(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .rev()
        .find(|l| l.starts_with("ERROR:"))
        .map(|l| strip_error_prefix(l).to_string())
        .or_else(|| {
            stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .map(|l| l.trim().to_string())
        })
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Turn yt-dlp's `--dump-single-json` output into an [`Extraction`].
pub fn parse_extraction(value: Value, requested_url: &str) -> Result<Extraction> {
    let kind = value.get("_type").and_then(Value::as_str).unwrap_or("video");

    if matches!(kind, "playlist" | "multi_video") {
        let entries = value
            .get("entries")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let url = string_field(entry, "url")
                            .or_else(|| string_field(entry, "webpage_url"))
                            .or_else(|| string_field(entry, "original_url"))?;
                        Some(PlaylistEntry {
                            url,
                            id: string_field(entry, "id"),
                            title: string_field(entry, "title"),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        return Ok(Extraction::Playlist(PlaylistInfo {
            id: string_field(&value, "id"),
            title: string_field(&value, "title"),
            uploader: string_field(&value, "uploader"),
            entries,
        }));
    }

    let id = string_field(&value, "id")
        .ok_or_else(|| Error::extraction("Extractor returned no media id"))?;
    let has_formats = value
        .get("formats")
        .and_then(Value::as_array)
        .is_some_and(|formats| !formats.is_empty())
        || value.get("url").and_then(Value::as_str).is_some();

    Ok(Extraction::Item(Box::new(MediaInfo {
        title: string_field(&value, "title").unwrap_or_else(|| id.clone()),
        url: string_field(&value, "webpage_url")
            .or_else(|| string_field(&value, "original_url"))
            .unwrap_or_else(|| requested_url.to_string()),
        extractor_key: string_field(&value, "extractor_key")
            .or_else(|| string_field(&value, "ie_key")),
        live_status: value
            .get("live_status")
            .and_then(Value::as_str)
            .and_then(LiveStatus::parse),
        release_timestamp: value.get("release_timestamp").and_then(Value::as_i64),
        duration: value.get("duration").and_then(Value::as_f64),
        has_formats,
        id,
        raw: value,
    })))
}

fn template_field_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"%\((?P<key>[A-Za-z0-9_]+)\)(?P<width>0?\d*)(?P<conv>[sd])").unwrap())
}

/// Substitute known template variables (e.g. playlist metadata) before handing the template
/// to yt-dlp. Unknown fields are left for yt-dlp to fill in.
pub fn expand_template_extras(template: &str, extras: &BTreeMap<String, String>) -> String {
    if extras.is_empty() {
        return template.to_string();
    }

    template_field_regex()
        .replace_all(template, |caps: &Captures| {
            let Some(value) = extras.get(&caps["key"]) else {
                return caps[0].to_string();
            };
            let width = &caps["width"];
            let rendered = match (&caps["conv"], value.parse::<i64>()) {
                ("d", Ok(n)) if width.starts_with('0') => {
                    let w = width.parse::<usize>().unwrap_or(0);
                    format!("{n:0w$}")
                }
                ("d", Ok(n)) => {
                    let w = width.parse::<usize>().unwrap_or(0);
                    format!("{n:w$}")
                }
                _ => value.clone(),
            };
            // yt-dlp would re-interpret a literal '%'.
            rendered.replace('%', "%%")
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn engine() -> YtDlpEngine {
        YtDlpEngine::with_config(YtDlpConfig {
            binary_path: "/nonexistent/yt-dlp".into(),
            ..Default::default()
        })
    }

    #[test]
    fn test_parse_single_item() {
        let value = json!({
            "id": "dQw4w9WgXcQ",
            "title": "Never Gonna",
            "webpage_url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "extractor_key": "Youtube",
            "live_status": "is_upcoming",
            "release_timestamp": 1_700_000_000,
            "duration": 212.0,
            "formats": []
        });
        let Extraction::Item(info) = parse_extraction(value, "https://youtu.be/dQw4w9WgXcQ").unwrap()
        else {
            panic!("expected item");
        };
        assert_eq!(info.archive_id().as_deref(), Some("youtube dQw4w9WgXcQ"));
        assert_eq!(info.live_status, Some(LiveStatus::IsUpcoming));
        assert_eq!(info.release_timestamp, Some(1_700_000_000));
        assert!(!info.has_formats);
        assert!(info.is_premiere());
    }

    #[test]
    fn test_parse_playlist() {
        let value = json!({
            "_type": "playlist",
            "id": "PL1",
            "title": "Mix",
            "uploader": "Someone",
            "entries": [
                { "url": "https://example.com/1", "id": "1", "title": "One" },
                null,
                { "id": "no-url" },
                { "webpage_url": "https://example.com/2" }
            ]
        });
        let Extraction::Playlist(playlist) = parse_extraction(value, "https://example.com/pl").unwrap()
        else {
            panic!("expected playlist");
        };
        assert_eq!(playlist.title.as_deref(), Some("Mix"));
        assert_eq!(playlist.entries.len(), 2);
        assert_eq!(playlist.entries[1].url, "https://example.com/2");
    }

    #[test]
    fn test_parse_requires_id() {
        assert!(parse_extraction(json!({ "title": "x" }), "u").is_err());
    }

    #[test]
    fn test_expand_template_extras() {
        let mut extras = BTreeMap::new();
        extras.insert("playlist_index".to_string(), "7".to_string());
        extras.insert("playlist_title".to_string(), "100% Hits".to_string());

        let out = expand_template_extras(
            "%(playlist_title)s/%(playlist_index)03d - %(title)s.%(ext)s",
            &extras,
        );
        assert_eq!(out, "100%% Hits/007 - %(title)s.%(ext)s");
        assert_eq!(expand_template_extras("%(title)s", &BTreeMap::new()), "%(title)s");
    }

    #[test]
    fn test_pre_extraction_archive_id() {
        let engine = engine();
        assert_eq!(
            engine.archive_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=1").as_deref(),
            Some("youtube dQw4w9WgXcQ")
        );
        assert_eq!(
            engine.archive_id("https://youtu.be/dQw4w9WgXcQ").as_deref(),
            Some("youtube dQw4w9WgXcQ")
        );
        assert_eq!(engine.archive_id("https://example.com/video/1"), None);
        assert!(!engine.is_available());
    }

    #[test]
    fn test_classify_output() {
        let engine = engine();
        assert!(matches!(
            engine.classify_output("ERROR: [youtube] abc: This live event will begin in 3 hours."),
            Some(ProgressEvent::NotLive { .. })
        ));
        assert_eq!(
            engine.classify_output("ERROR: unable to download video data: HTTP Error 403"),
            Some(ProgressEvent::Error {
                error: "unable to download video data: HTTP Error 403".into()
            })
        );
        assert!(matches!(
            engine.classify_output("[download] abc has already been recorded in the archive"),
            Some(ProgressEvent::Skip { .. })
        ));
        assert_eq!(engine.classify_output("[info] Downloading 1 format(s)"), None);
    }

    #[test]
    fn test_download_command() {
        let engine = engine();
        let mut record = DownloadRecord::new(
            "https://example.com/v",
            "v",
            "Video",
            ItemOptions {
                cli_args: vec!["-f".into(), "best".into()],
                ..Default::default()
            }
            .with_extra("playlist_index", "2"),
        );
        record.options.template = Some("%(playlist_index)s-%(title)s.%(ext)s".into());

        let paths = DownloadPaths {
            temp_dir: PathBuf::from("/tmp/vidq/abc"),
            download_dir: PathBuf::from("/downloads"),
        };
        let cmd = engine.download_command(&record, &paths).unwrap();
        assert_eq!(cmd.program, "/nonexistent/yt-dlp");
        assert!(cmd.args.contains(&"temp:/tmp/vidq/abc".to_string()));
        assert!(cmd.args.contains(&"home:/downloads".to_string()));
        assert!(cmd.args.contains(&"2-%(title)s.%(ext)s".to_string()));
        assert_eq!(&cmd.args[cmd.args.len() - 4..], ["-f", "best", "--", "https://example.com/v"]);
        assert_eq!(cmd.cwd, Some(PathBuf::from("/tmp/vidq/abc")));
    }

    #[tokio::test]
    async fn test_detect_missing_binary() {
        let engine = YtDlpEngine::detect(YtDlpConfig {
            binary_path: "/nonexistent/yt-dlp".into(),
            ..Default::default()
        })
        .await;
        assert_eq!(engine.version(), None);
        assert!(!engine.is_available());
    }

    #[cfg(unix)]
    fn fake_binary(dir: &tempfile::TempDir, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("yt-dlp");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_detect_does_not_block_the_runtime() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let binary = fake_binary(&dir, "sleep 0.3\necho 2025.01.15\necho extra");

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = tokio::spawn({
            let ticks = ticks.clone();
            async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        let engine = YtDlpEngine::detect(YtDlpConfig {
            binary_path: binary,
            ..Default::default()
        })
        .await;
        ticker.abort();

        assert_eq!(engine.version(), Some("2025.01.15"));
        // The single-threaded runtime kept running while the version check waited.
        assert!(ticks.load(Ordering::SeqCst) >= 5);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_detect_failing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_binary(&dir, "echo broken\nexit 1");
        let engine = YtDlpEngine::detect(YtDlpConfig {
            binary_path: binary,
            ..Default::default()
        })
        .await;
        assert_eq!(engine.version(), None);
    }
}
