//! Per-item download lifecycle.
//!
//! A [`DownloadLifecycle`] owns one child process. Line readers on the child's stdout and
//! stderr decode progress messages into an in-process channel; a pump task applies them to
//! the lifecycle state and forwards them to a [`ProgressSink`]; a supervisor task waits for
//! the child (or kills it on cancel) and resolves the terminal status.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{DownloadPaths, MediaExtractor};
use super::progress::ProgressEvent;
use crate::domain::{DownloadRecord, DownloadStatus, TransferProgress};
use crate::{Error, Result};

/// Buffered progress lines per item.
const CHANNEL_CAPACITY: usize = 256;

/// Lines of stderr kept for error messages.
const STDERR_TAIL_LINES: usize = 10;

/// How long the supervisor waits for buffered progress after the child exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle settings shared by every item.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Parent of the per-item temp directories.
    pub temp_root: PathBuf,
    /// Root of final outputs.
    pub download_root: PathBuf,
    /// Keep temp directories after close.
    pub keep_temp: bool,
    /// Bound on waiting for a killed child to exit.
    pub kill_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            temp_root: std::env::temp_dir().join("vidq"),
            download_root: PathBuf::from("downloads"),
            keep_temp: false,
            kill_timeout: Duration::from_secs(5),
        }
    }
}

/// Private temp directory of an item: the first 16 hex chars of SHA-256 of its id.
pub fn temp_dir_for(temp_root: &Path, item_id: &str) -> PathBuf {
    let digest = hex::encode(Sha256::digest(item_id.as_bytes()));
    temp_root.join(&digest[..16])
}

/// Point-in-time view of a lifecycle.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleSnapshot {
    pub item_id: String,
    pub status: DownloadStatus,
    pub progress: TransferProgress,
    pub filename: Option<String>,
    pub temp_filename: Option<String>,
    pub error: Option<String>,
    pub msg: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,
}

/// Receiver of lifecycle updates.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Called for every applied progress event.
    async fn on_progress(&self, snapshot: &LifecycleSnapshot, event: &ProgressEvent);

    /// Called once with the terminal state.
    async fn on_terminal(&self, snapshot: &LifecycleSnapshot);
}

/// A sink that drops everything.
pub struct NullSink;

#[async_trait]
impl ProgressSink for NullSink {
    async fn on_progress(&self, _snapshot: &LifecycleSnapshot, _event: &ProgressEvent) {}
    async fn on_terminal(&self, _snapshot: &LifecycleSnapshot) {}
}

#[derive(Debug, Default)]
struct State {
    status: DownloadStatus,
    progress: TransferProgress,
    filename: Option<String>,
    temp_filename: Option<String>,
    error: Option<String>,
    msg: Option<String>,
    /// Terminal decision reported by the child.
    reported: Option<(DownloadStatus, Option<String>)>,
    started_at: Option<DateTime<Utc>>,
    last_progress_at: Option<DateTime<Utc>>,
    stderr_tail: VecDeque<String>,
}

impl State {
    fn transition(&mut self, target: DownloadStatus) {
        if self.status == target {
            return;
        }
        if self.status.can_transition_to(target) {
            self.status = target;
        } else {
            debug!(from = %self.status, to = %target, "Ignoring illegal status transition");
        }
    }

    fn apply(&mut self, event: &ProgressEvent) {
        let now = Utc::now();
        match event {
            ProgressEvent::Preparing { msg } => {
                if msg.is_some() {
                    self.msg.clone_from(msg);
                }
            }
            ProgressEvent::Downloading {
                downloaded_bytes,
                total_bytes,
                speed,
                eta,
                filename,
                tmpfilename,
            } => {
                self.transition(DownloadStatus::Downloading);
                let advanced = match (*downloaded_bytes, self.progress.downloaded_bytes) {
                    (Some(new), Some(old)) => new > old,
                    (Some(_), None) => true,
                    _ => false,
                };
                self.progress
                    .record(*downloaded_bytes, *total_bytes, *speed, *eta);
                if advanced {
                    self.last_progress_at = Some(now);
                }
                if filename.is_some() {
                    self.filename.clone_from(filename);
                }
                if tmpfilename.is_some() {
                    self.temp_filename.clone_from(tmpfilename);
                }
            }
            ProgressEvent::FileFinished {
                filename,
                total_bytes,
            } => {
                self.transition(DownloadStatus::Downloading);
                self.progress.record(*total_bytes, *total_bytes, None, Some(0));
                if filename.is_some() {
                    self.filename.clone_from(filename);
                }
                self.last_progress_at = Some(now);
            }
            ProgressEvent::Moved { filename } => {
                self.filename = Some(filename.clone());
                self.last_progress_at = Some(now);
            }
            ProgressEvent::Error { error } => {
                self.error = Some(error.clone());
                self.reported = Some((DownloadStatus::Error, Some(error.clone())));
            }
            ProgressEvent::Skip { msg } => {
                self.reported = Some((DownloadStatus::Skip, msg.clone()));
            }
            ProgressEvent::NotLive { msg } => {
                self.reported = Some((DownloadStatus::NotLive, msg.clone()));
            }
            ProgressEvent::Message { msg } => {
                self.msg = Some(msg.clone());
            }
        }
    }

    fn push_stderr(&mut self, line: String) {
        if self.stderr_tail.len() == STDERR_TAIL_LINES {
            self.stderr_tail.pop_front();
        }
        self.stderr_tail.push_back(line);
    }
}

/// How the child process ended.
#[derive(Debug)]
enum ProcessExit {
    Exited(ExitStatus),
    Killed,
    WaitFailed(String),
}

/// Terminal status and messages derived from a finished child.
#[derive(Debug, Clone, PartialEq)]
struct Resolution {
    status: DownloadStatus,
    error: Option<String>,
    msg: Option<String>,
}

/// Resolve the terminal status: cancel wins, then a status reported by the child, then the
/// exit code.
fn resolve_terminal(
    cancelled: bool,
    reported: Option<(DownloadStatus, Option<String>)>,
    exit: &ProcessExit,
    stderr_tail: &VecDeque<String>,
) -> Resolution {
    if cancelled {
        return Resolution {
            status: DownloadStatus::Cancelled,
            error: None,
            msg: None,
        };
    }

    if let Some((status, message)) = reported {
        return match status {
            DownloadStatus::Error => Resolution {
                status,
                error: message,
                msg: None,
            },
            _ => Resolution {
                status,
                error: None,
                msg: message,
            },
        };
    }

    let failure = match exit {
        ProcessExit::Exited(status) if status.success() => {
            return Resolution {
                status: DownloadStatus::Finished,
                error: None,
                msg: None,
            };
        }
        ProcessExit::Exited(status) => format!("Download process exited with {status}"),
        ProcessExit::Killed => "Download process was killed".to_string(),
        ProcessExit::WaitFailed(e) => format!("Failed to wait for download process: {e}"),
    };

    let tail = stderr_tail
        .iter()
        .rev()
        .find(|l| !l.trim().is_empty())
        .cloned();
    Resolution {
        status: DownloadStatus::Error,
        error: Some(tail.unwrap_or(failure)),
        msg: None,
    }
}

enum OutputLine {
    Event(ProgressEvent),
    Stderr(String),
}

/// Supervises the download process of one item.
pub struct DownloadLifecycle {
    record: DownloadRecord,
    engine: Arc<dyn MediaExtractor>,
    sink: Arc<dyn ProgressSink>,
    config: LifecycleConfig,
    temp_dir: PathBuf,
    state: Mutex<State>,
    started: AtomicBool,
    cancelled: AtomicBool,
    closed: AtomicBool,
    kill: CancellationToken,
    stop_pump: CancellationToken,
    done: watch::Sender<Option<DownloadStatus>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl DownloadLifecycle {
    pub fn new(
        record: DownloadRecord,
        engine: Arc<dyn MediaExtractor>,
        sink: Arc<dyn ProgressSink>,
        config: LifecycleConfig,
    ) -> Self {
        let temp_dir = temp_dir_for(&config.temp_root, &record.id);
        let (done, _) = watch::channel(None);
        Self {
            record,
            engine,
            sink,
            config,
            temp_dir,
            state: Mutex::new(State::default()),
            started: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            kill: CancellationToken::new(),
            stop_pump: CancellationToken::new(),
            done,
            supervisor: Mutex::new(None),
            readers: Mutex::new(Vec::new()),
        }
    }

    pub fn item_id(&self) -> &str {
        &self.record.id
    }

    pub fn record(&self) -> &DownloadRecord {
        &self.record
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn status(&self) -> DownloadStatus {
        self.state.lock().status
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether the child may still be running.
    pub fn is_running(&self) -> bool {
        self.is_started() && !self.is_closed() && self.done.borrow().is_none()
    }

    /// Time of the last forward progress; the start time until the first bytes arrive.
    pub fn last_progress_at(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock();
        state.last_progress_at.or(state.started_at)
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        let state = self.state.lock();
        LifecycleSnapshot {
            item_id: self.record.id.clone(),
            status: state.status,
            progress: state.progress.clone(),
            filename: state.filename.clone(),
            temp_filename: state.temp_filename.clone(),
            error: state.error.clone(),
            msg: state.msg.clone(),
            started_at: state.started_at,
            last_progress_at: state.last_progress_at,
        }
    }

    /// Spawn the child process. Idempotent.
    ///
    /// A failure to prepare or spawn the child resolves the lifecycle as `error` and is also
    /// returned to the caller.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        {
            let mut state = self.state.lock();
            state.started_at = Some(Utc::now());
            state.transition(DownloadStatus::Preparing);
        }
        let preparing = ProgressEvent::Preparing { msg: None };
        self.sink.on_progress(&self.snapshot(), &preparing).await;

        if let Err(e) = tokio::fs::create_dir_all(&self.temp_dir).await {
            let message = format!("Failed to create temp directory: {e}");
            self.finish_with_error(message.clone()).await;
            return Err(Error::process(message));
        }

        let paths = DownloadPaths {
            temp_dir: self.temp_dir.clone(),
            download_dir: match self.record.folder.as_deref() {
                Some(folder) => self.config.download_root.join(folder),
                None => self.config.download_root.clone(),
            },
        };
        let command = match self.engine.download_command(&self.record, &paths) {
            Ok(command) => command,
            Err(e) => {
                self.finish_with_error(e.to_string()).await;
                return Err(e);
            }
        };

        let mut cmd = process_utils::tokio_command(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("Failed to spawn {}: {e}", command.program);
                self.finish_with_error(message.clone()).await;
                return Err(Error::process(message));
            }
        };
        info!(
            id = %self.record.id,
            pid = child.id(),
            program = %command.program,
            "Download process started"
        );

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        {
            let mut readers = self.readers.lock();
            if let Some(stdout) = child.stdout.take() {
                readers.push(self.spawn_reader(stdout, tx.clone(), false));
            }
            if let Some(stderr) = child.stderr.take() {
                readers.push(self.spawn_reader(stderr, tx.clone(), true));
            }
        }
        drop(tx);

        let pump = tokio::spawn(self.clone().pump(rx));
        let supervisor = tokio::spawn(self.clone().supervise(child, pump));
        *self.supervisor.lock() = Some(supervisor);

        Ok(())
    }

    fn spawn_reader<R>(
        self: &Arc<Self>,
        stream: R,
        tx: mpsc::Sender<OutputLine>,
        is_stderr: bool,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let engine = self.engine.clone();
        let id = self.record.id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let message = match ProgressEvent::decode(&line) {
                            Some(event) => OutputLine::Event(event),
                            None => match engine.classify_output(&line) {
                                Some(event) => OutputLine::Event(event),
                                None if is_stderr => OutputLine::Stderr(line),
                                None => {
                                    debug!(id = %id, "{}", line);
                                    continue;
                                }
                            },
                        };
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(id = %id, error = %e, "Error reading process output");
                        break;
                    }
                }
            }
        })
    }

    async fn pump(self: Arc<Self>, mut rx: mpsc::Receiver<OutputLine>) {
        loop {
            let line = tokio::select! {
                biased;
                _ = self.stop_pump.cancelled() => break,
                line = rx.recv() => line,
            };
            match line {
                Some(OutputLine::Event(event)) => {
                    let snapshot = {
                        let mut state = self.state.lock();
                        state.apply(&event);
                        drop(state);
                        self.snapshot()
                    };
                    self.sink.on_progress(&snapshot, &event).await;
                }
                Some(OutputLine::Stderr(line)) => {
                    debug!(id = %self.record.id, "{}", line);
                    self.state.lock().push_stderr(line);
                }
                None => break,
            }
        }
    }

    async fn supervise(self: Arc<Self>, mut child: tokio::process::Child, pump: JoinHandle<()>) {
        let exit = tokio::select! {
            _ = self.kill.cancelled() => {
                match process_utils::kill_and_reap(&mut child, self.config.kill_timeout).await {
                    Ok(process_utils::Reaped::AlreadyExited(status)) => ProcessExit::Exited(status),
                    Ok(process_utils::Reaped::Killed(_)) => ProcessExit::Killed,
                    Ok(process_utils::Reaped::TimedOut) => {
                        warn!(id = %self.record.id, "Download process did not exit after kill");
                        ProcessExit::Killed
                    }
                    Err(e) => {
                        warn!(id = %self.record.id, error = %e, "Failed to kill download process");
                        ProcessExit::Killed
                    }
                }
            }
            status = child.wait() => match status {
                Ok(status) => ProcessExit::Exited(status),
                Err(e) => ProcessExit::WaitFailed(e.to_string()),
            },
        };

        // Apply whatever the child wrote before exiting.
        let abort = pump.abort_handle();
        if tokio::time::timeout(DRAIN_TIMEOUT, pump).await.is_err() {
            debug!(id = %self.record.id, "Progress pump did not drain in time");
            abort.abort();
        }

        let resolution = {
            let state = self.state.lock();
            resolve_terminal(
                self.is_cancelled(),
                state.reported.clone(),
                &exit,
                &state.stderr_tail,
            )
        };
        debug!(id = %self.record.id, exit = ?exit, status = %resolution.status, "Download process ended");
        self.finish(resolution).await;
    }

    async fn finish_with_error(&self, message: String) {
        self.finish(Resolution {
            status: DownloadStatus::Error,
            error: Some(message),
            msg: None,
        })
        .await;
    }

    /// Move to the terminal status, notify the sink and wake `wait()` callers. Runs once.
    async fn finish(&self, resolution: Resolution) {
        if self.done.borrow().is_some() {
            return;
        }

        let snapshot = {
            let mut state = self.state.lock();
            state.transition(resolution.status);
            if resolution.status == DownloadStatus::Finished {
                state.progress.complete();
            }
            if resolution.error.is_some() {
                state.error = resolution.error;
            }
            if resolution.msg.is_some() {
                state.msg = resolution.msg;
            }
            drop(state);
            self.snapshot()
        };

        // First writer wins; a concurrent finish may have raced us.
        let won = self.done.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(snapshot.status);
            true
        });
        if won {
            self.sink.on_terminal(&snapshot).await;
        }
    }

    /// Suspend until the lifecycle reaches a terminal status.
    pub async fn wait(&self) -> DownloadStatus {
        let mut rx = self.done.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(status) => status.unwrap_or(DownloadStatus::Error),
            Err(_) => self.status(),
        }
    }

    /// Mark the lifecycle cancelled and kill the child. `close()` is still required.
    pub async fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(id = %self.record.id, "Cancelling download");

        if !self.started.swap(true, Ordering::SeqCst) {
            // Never started: nothing to kill.
            self.finish(Resolution {
                status: DownloadStatus::Cancelled,
                error: None,
                msg: None,
            })
            .await;
            return;
        }
        self.kill.cancel();
    }

    /// Release every resource held by the lifecycle. Idempotent and infallible.
    ///
    /// A running child is killed (the lifecycle resolves as cancelled). The temp directory is
    /// removed unless `keep_temp` is set or the item is a live stream that did not finish.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.done.borrow().is_none() {
            self.cancel().await;
        }

        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            let bound = self.config.kill_timeout + DRAIN_TIMEOUT + Duration::from_secs(1);
            let abort = handle.abort_handle();
            if tokio::time::timeout(bound, handle).await.is_err() {
                warn!(id = %self.record.id, "Supervisor did not finish; abandoning process");
                abort.abort();
            }
        }
        self.stop_pump.cancel();
        for reader in self.readers.lock().drain(..) {
            reader.abort();
        }

        // Resolve if the supervisor was abandoned.
        if self.done.borrow().is_none() {
            self.finish(Resolution {
                status: DownloadStatus::Cancelled,
                error: None,
                msg: None,
            })
            .await;
        }

        let status = self.status();
        let keep_partial = self.record.is_live && status != DownloadStatus::Finished;
        if self.config.keep_temp || keep_partial {
            debug!(id = %self.record.id, path = %self.temp_dir.display(), "Keeping temp directory");
            return;
        }
        match tokio::fs::remove_dir_all(&self.temp_dir).await {
            Ok(()) => debug!(id = %self.record.id, "Removed temp directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                id = %self.record.id,
                path = %self.temp_dir.display(),
                error = %e,
                "Failed to remove temp directory"
            ),
        }
    }
}

impl std::fmt::Debug for DownloadLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadLifecycle")
            .field("id", &self.record.id)
            .field("status", &self.status())
            .field("started", &self.is_started())
            .field("cancelled", &self.is_cancelled())
            .field("closed", &self.is_closed())
            .finish()
    }
}
