//! Logging setup with a reloadable filter and optional daily-rolling log files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "vidq=info,process_utils=info,sqlx=warn";

/// Prefix of rolled log files: `vidq.log.YYYY-MM-DD`.
const LOG_FILE_PREFIX: &str = "vidq.log";

/// Log retention period in days.
const LOG_RETENTION_DAYS: i64 = 7;

/// Timestamps in the server's local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Handle to the installed subscriber.
///
/// Holds the file writer guard; dropping the last reference flushes and stops file logging.
pub struct LoggingConfig {
    handle: FilterHandle,
    log_dir: Option<PathBuf>,
    _guard: Option<WorkerGuard>,
}

impl LoggingConfig {
    /// Current filter directive.
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the filter directive at runtime.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let filter = EnvFilter::try_new(directive)
            .map_err(|e| Error::config(format!("Invalid filter directive: {e}")))?;
        self.handle
            .reload(filter)
            .map_err(|e| Error::Other(format!("Failed to reload filter: {e}")))?;
        info!(directive = %directive, "Log filter updated");
        Ok(())
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    /// Delete rolled log files older than 7 days, once a day, until cancelled.
    pub fn start_retention_cleanup(self: &Arc<Self>, cancel_token: CancellationToken) {
        let Some(log_dir) = self.log_dir.clone() else {
            return;
        };

        tokio::spawn(async move {
            let cleanup_interval = Duration::from_secs(24 * 60 * 60);
            loop {
                if let Err(e) = cleanup_old_logs(&log_dir, LOG_RETENTION_DAYS).await {
                    warn!(error = %e, "Failed to clean up old logs");
                }
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Log retention cleanup task shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(cleanup_interval) => {}
                }
            }
        });
    }
}

/// Date of a rolled log file, if `name` is one.
fn rolled_log_date(name: &str) -> Option<NaiveDate> {
    let date = name.strip_prefix(LOG_FILE_PREFIX)?.strip_prefix('.')?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Delete rolled log files older than `retention_days`. Returns the number deleted.
async fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> std::io::Result<usize> {
    let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).date_naive();

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(rolled_log_date)
        else {
            continue;
        };
        if date >= cutoff {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                deleted += 1;
                debug!(path = %path.display(), "Deleted old log file");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete old log file"),
        }
    }

    if deleted > 0 {
        info!(count = deleted, "Cleaned up old log files");
    }
    Ok(deleted)
}

/// Install the global subscriber.
///
/// The filter is `directive` if given, else `RUST_LOG`, else [`DEFAULT_LOG_FILTER`]. With a
/// `log_dir`, a daily-rolling plain-text file layer is added next to the console.
pub fn init_logging(log_dir: Option<&Path>, directive: Option<&str>) -> Result<Arc<LoggingConfig>> {
    let initial_filter = match directive {
        Some(directive) => EnvFilter::try_new(directive)
            .map_err(|e| Error::config(format!("Invalid filter directive: {e}")))?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };
    let (filter_layer, handle) = reload::Layer::new(initial_filter);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_timer(LocalTimer))
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to set global default subscriber: {e}")))?;

    Ok(Arc::new(LoggingConfig {
        handle,
        log_dir: log_dir.map(Path::to_path_buf),
        _guard: guard,
    }))
}
