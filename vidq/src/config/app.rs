//! Process-wide configuration loaded from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const DEFAULT_DATABASE_URL: &str = "sqlite:vidq.db?mode=rwc";

/// Upper bound for every `*_secs` window: one hundred years.
pub const MAX_WINDOW_SECS: u64 = 100 * 365 * 24 * 60 * 60;
/// Upper bound for `history_retention_days`.
pub const MAX_RETENTION_DAYS: u64 = 100 * 365;

/// Application configuration.
///
/// Every field has a default; [`AppConfig::from_env`] overlays `VIDQ_*` variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub download_path: PathBuf,
    pub temp_path: PathBuf,
    /// Persistent download workers.
    pub workers: usize,
    /// Queue slots per worker.
    pub load_factor: usize,
    /// Concurrent extractions.
    pub extract_concurrency: usize,
    pub extract_timeout_secs: u64,
    /// Bound on waiting for an extraction slot.
    pub extract_acquire_timeout_secs: u64,
    pub keep_temp: bool,
    /// Allow `clear` to delete output files.
    pub remove_files: bool,
    pub archive_file: Option<PathBuf>,
    /// 0 is unlimited.
    pub playlist_items_limit: usize,
    pub live_buffer_secs: u64,
    pub stale_after_secs: u64,
    pub maintenance_interval_secs: u64,
    /// 0 disables retention.
    pub history_retention_days: u64,
    pub dispatch_delay_ms: u64,
    pub ytdlp_path: String,
    pub output_template: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub log_filter: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            download_path: PathBuf::from("downloads"),
            temp_path: std::env::temp_dir().join("vidq"),
            workers: 2,
            load_factor: 2,
            extract_concurrency: 4,
            extract_timeout_secs: 120,
            extract_acquire_timeout_secs: 60,
            keep_temp: false,
            remove_files: false,
            archive_file: None,
            playlist_items_limit: 0,
            live_buffer_secs: 300,
            stale_after_secs: 600,
            maintenance_interval_secs: 60,
            history_retention_days: 0,
            dispatch_delay_ms: 100,
            ytdlp_path: "yt-dlp".to_string(),
            output_template: None,
            log_dir: None,
            log_filter: None,
        }
    }
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| Error::config(format!("Invalid value for {key}: {raw:?} ({e})")))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::config(format!(
            "Invalid value for {key}: {raw:?} (expected a boolean)"
        ))),
    }
}

fn non_empty(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl AppConfig {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv()
            && !e.not_found()
        {
            return Err(Error::config(format!("Failed to load .env: {e}")));
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).and_then(non_empty);

        if let Some(v) = get("VIDQ_DATABASE_URL").or_else(|| get("DATABASE_URL")) {
            config.database_url = v;
        }
        if let Some(v) = get("VIDQ_DOWNLOAD_PATH") {
            config.download_path = PathBuf::from(v);
        }
        if let Some(v) = get("VIDQ_TEMP_PATH") {
            config.temp_path = PathBuf::from(v);
        }
        if let Some(v) = get("VIDQ_WORKERS") {
            config.workers = parse_var("VIDQ_WORKERS", &v)?;
        }
        if let Some(v) = get("VIDQ_LOAD_FACTOR") {
            config.load_factor = parse_var("VIDQ_LOAD_FACTOR", &v)?;
        }
        if let Some(v) = get("VIDQ_EXTRACT_CONCURRENCY") {
            config.extract_concurrency = parse_var("VIDQ_EXTRACT_CONCURRENCY", &v)?;
        }
        if let Some(v) = get("VIDQ_EXTRACT_TIMEOUT_SECS") {
            config.extract_timeout_secs = parse_var("VIDQ_EXTRACT_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("VIDQ_EXTRACT_ACQUIRE_TIMEOUT_SECS") {
            config.extract_acquire_timeout_secs =
                parse_var("VIDQ_EXTRACT_ACQUIRE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("VIDQ_KEEP_TEMP") {
            config.keep_temp = parse_bool("VIDQ_KEEP_TEMP", &v)?;
        }
        if let Some(v) = get("VIDQ_REMOVE_FILES") {
            config.remove_files = parse_bool("VIDQ_REMOVE_FILES", &v)?;
        }
        if let Some(v) = get("VIDQ_ARCHIVE_FILE") {
            config.archive_file = Some(PathBuf::from(v));
        }
        if let Some(v) = get("VIDQ_PLAYLIST_ITEMS_LIMIT") {
            config.playlist_items_limit = parse_var("VIDQ_PLAYLIST_ITEMS_LIMIT", &v)?;
        }
        if let Some(v) = get("VIDQ_LIVE_BUFFER_SECS") {
            config.live_buffer_secs = parse_var("VIDQ_LIVE_BUFFER_SECS", &v)?;
        }
        if let Some(v) = get("VIDQ_STALE_AFTER_SECS") {
            config.stale_after_secs = parse_var("VIDQ_STALE_AFTER_SECS", &v)?;
        }
        if let Some(v) = get("VIDQ_MAINTENANCE_INTERVAL_SECS") {
            config.maintenance_interval_secs = parse_var("VIDQ_MAINTENANCE_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("VIDQ_HISTORY_RETENTION_DAYS") {
            config.history_retention_days = parse_var("VIDQ_HISTORY_RETENTION_DAYS", &v)?;
        }
        if let Some(v) = get("VIDQ_DISPATCH_DELAY_MS") {
            config.dispatch_delay_ms = parse_var("VIDQ_DISPATCH_DELAY_MS", &v)?;
        }
        if let Some(v) = get("VIDQ_YTDLP_PATH") {
            config.ytdlp_path = v;
        }
        config.output_template = get("VIDQ_OUTPUT_TEMPLATE");
        config.log_dir = get("VIDQ_LOG_DIR").map(PathBuf::from);
        config.log_filter = get("VIDQ_LOG_FILTER");

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the queue cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.load_factor == 0 {
            return Err(Error::config("load_factor must be at least 1"));
        }
        if self.extract_concurrency == 0 {
            return Err(Error::config("extract_concurrency must be at least 1"));
        }
        if self.database_url.is_empty() {
            return Err(Error::config("database_url must not be empty"));
        }
        for (name, secs) in [
            ("extract_timeout_secs", self.extract_timeout_secs),
            ("extract_acquire_timeout_secs", self.extract_acquire_timeout_secs),
            ("live_buffer_secs", self.live_buffer_secs),
            ("stale_after_secs", self.stale_after_secs),
            ("maintenance_interval_secs", self.maintenance_interval_secs),
        ] {
            if secs > MAX_WINDOW_SECS {
                return Err(Error::config(format!(
                    "{name} must be at most {MAX_WINDOW_SECS}"
                )));
            }
        }
        if self.history_retention_days > MAX_RETENTION_DAYS {
            return Err(Error::config(format!(
                "history_retention_days must be at most {MAX_RETENTION_DAYS}"
            )));
        }
        Ok(())
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }

    pub fn extract_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_acquire_timeout_secs)
    }

    pub fn live_buffer(&self) -> Duration {
        Duration::from_secs(self.live_buffer_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }

    pub fn dispatch_delay(&self) -> Duration {
        Duration::from_millis(self.dispatch_delay_ms)
    }
}
