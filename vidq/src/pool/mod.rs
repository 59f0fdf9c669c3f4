//! Bounded worker pool.
//!
//! N persistent workers pull jobs from a bounded channel of capacity `N × load_factor`, so
//! [`WorkerPool::push`] applies backpressure once the channel is full. Temporary workers run a
//! single job outside the channel and remove themselves when done.

mod job;

pub use job::{Job, JobOutcome};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors returned by pool operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool is not started")]
    NotStarted,

    #[error("worker pool is closed")]
    Closed,

    #[error("{0} job(s) failed")]
    JobsFailed(usize),
}

/// Configuration for a worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of persistent workers.
    pub workers: usize,
    /// Queue capacity multiplier.
    pub load_factor: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            load_factor: 2,
        }
    }
}

impl WorkerPoolConfig {
    pub fn capacity(&self) -> usize {
        (self.workers * self.load_factor).max(1)
    }
}

/// What a worker is doing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy {
        description: String,
        started_at: DateTime<Utc>,
    },
}

/// Snapshot of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: usize,
    pub status: WorkerStatus,
    pub temporary: bool,
}

enum Message {
    Job(Job, Option<oneshot::Sender<JobOutcome>>),
    Terminate,
}

struct WorkerSlot {
    status: WorkerStatus,
    generation: u64,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// State shared with worker tasks.
struct Shared {
    receiver: AsyncMutex<mpsc::Receiver<Message>>,
    workers: parking_lot::Mutex<HashMap<usize, WorkerSlot>>,
    temporary: parking_lot::Mutex<HashMap<usize, WorkerSlot>>,
    failures: AtomicUsize,
    idle: Notify,
}

impl Shared {
    fn set_status(&self, id: usize, generation: u64, status: WorkerStatus) {
        let became_idle = status == WorkerStatus::Idle;
        if let Some(slot) = self.workers.lock().get_mut(&id)
            && slot.generation == generation
        {
            slot.status = status;
        }
        if became_idle {
            self.idle.notify_waiters();
        }
    }

    fn idle_count(&self) -> usize {
        self.workers
            .lock()
            .values()
            .filter(|slot| slot.status == WorkerStatus::Idle)
            .count()
    }

    fn finish(&self, description: &str, outcome: JobOutcome, reply: Option<oneshot::Sender<JobOutcome>>) {
        if outcome.is_failure() {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }

        match reply {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => match outcome {
                JobOutcome::Failed(e) => error!(job = %description, error = %e, "Job failed"),
                JobOutcome::TimedOut => warn!(job = %description, "Job timed out"),
                JobOutcome::Cancelled => debug!(job = %description, "Job cancelled"),
                JobOutcome::Completed => {}
            },
        }
    }
}

/// Pool of persistent and temporary workers.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    sender: mpsc::Sender<Message>,
    shared: Arc<Shared>,
    started: AtomicBool,
    generations: AtomicU64,
    next_temporary_id: AtomicUsize,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity());
        let next_temporary_id = AtomicUsize::new(config.workers);
        Self {
            config,
            sender,
            shared: Arc::new(Shared {
                receiver: AsyncMutex::new(receiver),
                workers: parking_lot::Mutex::new(HashMap::new()),
                temporary: parking_lot::Mutex::new(HashMap::new()),
                failures: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
            started: AtomicBool::new(false),
            generations: AtomicU64::new(0),
            next_temporary_id,
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Spawn the persistent workers and reset the failure flag. No-op if already running.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.failures.store(0, Ordering::SeqCst);

        info!(
            workers = self.config.workers,
            capacity = self.config.capacity(),
            "Starting worker pool"
        );
        for id in 0..self.config.workers {
            self.spawn_worker(id);
        }
    }

    /// Spawn a persistent worker loop under `id`. Returns `false` if `id` is already running.
    pub fn spawn_worker(&self, id: usize) -> bool {
        let mut workers = self.shared.workers.lock();
        if workers.contains_key(&id) {
            return false;
        }
        workers.insert(id, self.new_slot(id));
        true
    }

    fn new_slot(&self, id: usize) -> WorkerSlot {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let handle = tokio::spawn(worker_loop(
            id,
            generation,
            self.shared.clone(),
            token.clone(),
        ));
        WorkerSlot {
            status: WorkerStatus::Idle,
            generation,
            token,
            handle: Some(handle),
        }
    }

    /// Enqueue a job.
    ///
    /// Non-temporary jobs wait for channel space. Temporary jobs start immediately on a
    /// dedicated worker. The receiver is returned for jobs built with [`Job::with_result`].
    pub async fn push(
        &self,
        job: Job,
        temporary: bool,
    ) -> Result<Option<oneshot::Receiver<JobOutcome>>, PoolError> {
        if !self.is_started() {
            return Err(PoolError::NotStarted);
        }

        let (reply, receiver) = if job.wants_result() {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        if temporary {
            self.spawn_temporary(job, reply);
        } else {
            self.sender
                .send(Message::Job(job, reply))
                .await
                .map_err(|_| PoolError::Closed)?;
        }
        Ok(receiver)
    }

    fn spawn_temporary(&self, job: Job, reply: Option<oneshot::Sender<JobOutcome>>) {
        let id = self.next_temporary_id.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let description = job.description().to_string();
        let shared = self.shared.clone();

        // Hold the map lock across the spawn so the task cannot remove its entry first.
        let mut temporary = self.shared.temporary.lock();
        let handle = tokio::spawn({
            let token = token.clone();
            let description = description.clone();
            async move {
                debug!(worker = id, job = %description, "Temporary worker started");
                let outcome = job.execute(token).await;
                shared.finish(&description, outcome, reply);
                shared.temporary.lock().remove(&id);
                debug!(worker = id, "Temporary worker finished");
            }
        });
        temporary.insert(
            id,
            WorkerSlot {
                status: WorkerStatus::Busy {
                    description,
                    started_at: Utc::now(),
                },
                generation: 0,
                token,
                handle: Some(handle),
            },
        );
    }

    /// Whether any persistent worker is idle.
    pub fn has_open_workers(&self) -> bool {
        self.available_workers() > 0
    }

    /// Number of idle persistent workers.
    pub fn available_workers(&self) -> usize {
        self.shared.idle_count()
    }

    /// Suspend until a persistent worker is idle.
    pub async fn wait_for_idle_worker(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.has_open_workers() {
                return;
            }
            notified.await;
        }
    }

    /// Cancel the worker's in-flight job and respawn its loop under the same id.
    ///
    /// Returns `false` for an unknown id.
    pub fn restart(&self, id: usize) -> bool {
        let mut workers = self.shared.workers.lock();
        let Some(old) = workers.remove(&id) else {
            return false;
        };
        old.token.cancel();
        workers.insert(id, self.new_slot(id));
        info!(worker = id, "Restarted worker");
        true
    }

    /// Cancel the worker's in-flight job and stop its loop. Returns `false` for an unknown id.
    pub fn stop(&self, id: usize) -> bool {
        let removed = self
            .shared
            .workers
            .lock()
            .remove(&id)
            .or_else(|| self.shared.temporary.lock().remove(&id));
        match removed {
            Some(slot) => {
                slot.token.cancel();
                info!(worker = id, "Stopped worker");
                true
            }
            None => false,
        }
    }

    /// Snapshot of every worker, persistent ones first.
    pub fn status(&self) -> Vec<WorkerInfo> {
        let mut persistent: Vec<WorkerInfo> = self
            .shared
            .workers
            .lock()
            .iter()
            .map(|(id, slot)| WorkerInfo {
                id: *id,
                status: slot.status.clone(),
                temporary: false,
            })
            .collect();
        persistent.sort_by_key(|w| w.id);

        let mut temporary: Vec<WorkerInfo> = self
            .shared
            .temporary
            .lock()
            .iter()
            .map(|(id, slot)| WorkerInfo {
                id: *id,
                status: slot.status.clone(),
                temporary: true,
            })
            .collect();
        temporary.sort_by_key(|w| w.id);

        persistent.extend(temporary);
        persistent
    }

    /// Number of jobs that failed or timed out since the last `start()`.
    pub fn failure_count(&self) -> usize {
        self.shared.failures.load(Ordering::SeqCst)
    }

    /// Drain queued jobs, then wait for every worker to exit.
    ///
    /// With `raise_on_failure`, returns [`PoolError::JobsFailed`] if any job failed during
    /// the pool's lifetime.
    pub async fn join(&self, raise_on_failure: bool) -> Result<(), PoolError> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let count = self.shared.workers.lock().len();
        for _ in 0..count {
            self.sender
                .send(Message::Terminate)
                .await
                .map_err(|_| PoolError::Closed)?;
        }

        self.await_workers().await;
        info!("Worker pool joined");

        let failures = self.failure_count();
        if raise_on_failure && failures > 0 {
            return Err(PoolError::JobsFailed(failures));
        }
        Ok(())
    }

    /// Cancel running jobs and stop every worker. Queued jobs resolve as cancelled.
    pub async fn shutdown(&self) {
        self.started.store(false, Ordering::SeqCst);

        for slot in self.shared.workers.lock().values() {
            slot.token.cancel();
        }
        for slot in self.shared.temporary.lock().values() {
            slot.token.cancel();
        }

        self.await_workers().await;

        let mut receiver = self.shared.receiver.lock().await;
        while let Ok(message) = receiver.try_recv() {
            if let Message::Job(job, reply) = message {
                let description = job.description().to_string();
                self.shared.finish(&description, JobOutcome::Cancelled, reply);
            }
        }
        info!("Worker pool shut down");
    }

    async fn await_workers(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.shared.workers.lock();
            let mut temporary = self.shared.temporary.lock();
            workers
                .values_mut()
                .chain(temporary.values_mut())
                .filter_map(|slot| slot.handle.take())
                .collect()
        };

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed");
            }
        }

        self.shared.workers.lock().clear();
    }
}

async fn worker_loop(id: usize, generation: u64, shared: Arc<Shared>, token: CancellationToken) {
    debug!(worker = id, "Worker started");

    loop {
        shared.set_status(id, generation, WorkerStatus::Idle);

        let message = {
            let mut receiver = tokio::select! {
                _ = token.cancelled() => break,
                guard = shared.receiver.lock() => guard,
            };
            tokio::select! {
                _ = token.cancelled() => break,
                message = receiver.recv() => message,
            }
        };

        let (job, reply) = match message {
            Some(Message::Job(job, reply)) => (job, reply),
            Some(Message::Terminate) | None => break,
        };

        let description = job.description().to_string();
        shared.set_status(
            id,
            generation,
            WorkerStatus::Busy {
                description: description.clone(),
                started_at: Utc::now(),
            },
        );

        let outcome = job.execute(token.clone()).await;
        shared.finish(&description, outcome, reply);

        if token.is_cancelled() {
            break;
        }
    }

    {
        let mut workers = shared.workers.lock();
        // A restarted id already belongs to a newer loop.
        if workers.get(&id).is_some_and(|slot| slot.generation == generation) {
            workers.remove(&id);
        }
    }
    debug!(worker = id, "Worker stopped");
}
