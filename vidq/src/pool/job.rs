//! Jobs executed by the worker pool.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// How long a cancelled or timed-out job may keep running after its token fires.
const CANCEL_GRACE: Duration = Duration::from_secs(10);

type JobFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;
type JobFactory = Box<dyn FnOnce(CancellationToken) -> JobFuture + Send + 'static>;

/// Final outcome of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "message", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    /// The job returned an error or panicked.
    Failed(String),
    /// The job exceeded its max duration.
    TimedOut,
    /// The worker running the job was stopped, restarted or shut down.
    Cancelled,
}

impl JobOutcome {
    /// Outcomes that flip the pool-wide failure flag.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::TimedOut)
    }
}

/// A unit of work for the pool.
///
/// The body receives a [`CancellationToken`] that fires when the job is cancelled or times
/// out; bodies that watch it get [`CANCEL_GRACE`] to wind down before they are dropped.
pub struct Job {
    description: String,
    run: JobFactory,
    max_duration: Option<Duration>,
    wants_result: bool,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("description", &self.description)
            .field("max_duration", &self.max_duration)
            .field("wants_result", &self.wants_result)
            .finish_non_exhaustive()
    }
}

impl Job {
    pub fn new<F, Fut>(description: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            description: description.into(),
            run: Box::new(move |token| Box::pin(f(token))),
            max_duration: None,
            wants_result: false,
        }
    }

    /// Cancel the job if it runs longer than `max`.
    pub fn with_max_duration(mut self, max: Duration) -> Self {
        self.max_duration = Some(max);
        self
    }

    /// Ask the pool for a receiver that resolves to the job's outcome.
    pub fn with_result(mut self) -> Self {
        self.wants_result = true;
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub(crate) fn wants_result(&self) -> bool {
        self.wants_result
    }

    /// Run the job to an outcome. Errors and panics are captured, never propagated.
    pub(crate) async fn execute(self, cancel: CancellationToken) -> JobOutcome {
        let Job {
            run, max_duration, ..
        } = self;

        let job_token = cancel.child_token();
        let fut = AssertUnwindSafe(run(job_token.clone())).catch_unwind();
        tokio::pin!(fut);

        let deadline = async move {
            match max_duration {
                Some(max) => tokio::time::sleep(max).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let interrupted = tokio::select! {
            biased;
            _ = cancel.cancelled() => JobOutcome::Cancelled,
            _ = &mut deadline => JobOutcome::TimedOut,
            result = &mut fut => return outcome_of(result),
        };

        job_token.cancel();
        let _ = tokio::time::timeout(CANCEL_GRACE, &mut fut).await;
        interrupted
    }
}

fn outcome_of(result: std::result::Result<Result<()>, Box<dyn Any + Send>>) -> JobOutcome {
    match result {
        Ok(Ok(())) => JobOutcome::Completed,
        Ok(Err(e)) => JobOutcome::Failed(e.to_string()),
        Err(panic) => JobOutcome::Failed(format!("job panicked: {}", panic_message(&*panic))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[tokio::test]
    async fn test_completed_and_failed() {
        let outcome = Job::new("ok", |_| async { Ok(()) })
            .execute(CancellationToken::new())
            .await;
        assert_eq!(outcome, JobOutcome::Completed);

        let outcome = Job::new("err", |_| async { Err(Error::Other("boom".into())) })
            .execute(CancellationToken::new())
            .await;
        assert_eq!(outcome, JobOutcome::Failed("boom".into()));
        assert!(outcome.is_failure());
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let outcome = Job::new("panics", |_| async {
            let missing: Option<()> = None;
            missing.expect("kaboom");
            Ok(())
        })
        .execute(CancellationToken::new())
        .await;
        match outcome {
            JobOutcome::Failed(msg) => assert!(msg.contains("kaboom")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_fires_job_token() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let outcome = Job::new("slow", |token| async move {
            token.cancelled().await;
            let _ = tx.send(());
            Ok(())
        })
        .with_max_duration(Duration::from_millis(20))
        .execute(CancellationToken::new())
        .await;
        assert_eq!(outcome, JobOutcome::TimedOut);
        // The body observed its token during the grace period.
        rx.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel() {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            Job::new("until-cancelled", |token| async move {
                token.cancelled().await;
                Ok(())
            })
            .execute(cancel.clone()),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        // Completing during the grace period still reports the cancellation.
        assert_eq!(handle.await.unwrap(), JobOutcome::Cancelled);
    }
}
