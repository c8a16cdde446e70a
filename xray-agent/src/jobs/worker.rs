//! Worker runtime.
//!
//! A long-running loop that blocking-pops the queue, transitions job
//! status and dispatches to the handlers. Store flaps put the loop into
//! capped exponential backoff with jitter; a successful pop resets it.
//! On shutdown the worker stops popping, finishes the job in flight
//! (bounded by a grace period) and exits.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{safe_detail, AgentError};

use super::handlers::{self, HandlerDeps};
use super::{Job, JobError, JobState};

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(5);
const BACKOFF_JITTER_MS: u64 = 250;

/// How long an in-flight job may keep running after shutdown was
/// requested before it is recorded as cancelled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Delay before the single retry of a failed final status write.
const STATUS_RETRY_DELAY: Duration = Duration::from_millis(200);

pub struct Worker {
    deps: Arc<HandlerDeps>,
    debug_errors: bool,
}

impl Worker {
    #[must_use]
    pub fn new(deps: Arc<HandlerDeps>) -> Self {
        let debug_errors = deps.settings.api.debug_errors;
        Self { deps, debug_errors }
    }

    /// Run until `shutdown` fires. Never returns early on store errors.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("worker started");
        let mut backoff = BACKOFF_BASE;

        loop {
            let job = tokio::select! {
                () = shutdown.cancelled() => break,
                popped = self.deps.jobs.dequeue() => match popped {
                    Ok(Some(job)) => {
                        backoff = BACKOFF_BASE;
                        job
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "dequeue failed, backing off");
                        let jitter =
                            Duration::from_millis(rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS));
                        tokio::time::sleep(backoff + jitter).await;
                        backoff = (backoff * 2).min(BACKOFF_CAP);
                        continue;
                    }
                },
            };

            self.process(job, &shutdown).await;
        }

        info!("worker stopped");
    }

    async fn process(&self, job: Job, shutdown: &CancellationToken) {
        info!(job_id = %job.id, kind = job.kind.as_str(), "job started");

        // Non-fatal: processing continues even if the running marker is
        // lost; the final write is the one that matters.
        if let Err(e) = self
            .deps
            .jobs
            .set_state(&job.id, JobState::Running, None, None)
            .await
        {
            warn!(job_id = %job.id, error = %e, "running status write failed");
        }

        let outcome = tokio::select! {
            result = handlers::dispatch(&self.deps, &job) => Some(result),
            () = async {
                shutdown.cancelled().await;
                tokio::time::sleep(SHUTDOWN_GRACE).await;
            } => None,
        };

        match outcome {
            Some(Ok(result)) => {
                self.finish(&job, JobState::Done, Some(result), None).await;
                info!(job_id = %job.id, "job done");
            }
            Some(Err(e)) => {
                let job_error = self.classify(&e);
                error!(job_id = %job.id, kind = job.kind.as_str(), error = %e, "job failed");
                self.finish(&job, JobState::Error, None, Some(job_error))
                    .await;
            }
            None => {
                warn!(job_id = %job.id, "job interrupted by shutdown");
                self.finish(
                    &job,
                    JobState::Error,
                    None,
                    Some(JobError {
                        kind: "Cancelled".to_string(),
                        message: "worker shut down while the job was in flight".to_string(),
                        trace: None,
                    }),
                )
                .await;
            }
        }
    }

    fn classify(&self, error: &AgentError) -> JobError {
        JobError {
            kind: error.code().to_string(),
            message: safe_detail(&error.to_string()),
            trace: self.debug_errors.then(|| format!("{error:?}")),
        }
    }

    /// Write the final state, retrying once on a transient store
    /// failure. A lost write is logged and tolerated: the proxy is
    /// authoritative and the TTL turns the document into `not_found`.
    async fn finish(
        &self,
        job: &Job,
        state: JobState,
        result: Option<serde_json::Value>,
        error: Option<JobError>,
    ) {
        let first = self
            .deps
            .jobs
            .set_state(&job.id, state, result.clone(), error.clone())
            .await;
        if first.is_ok() {
            return;
        }

        tokio::time::sleep(STATUS_RETRY_DELAY).await;
        if let Err(e) = self.deps.jobs.set_state(&job.id, state, result, error).await {
            error!(job_id = %job.id, error = %e, "final status write failed twice, giving up");
        }
    }
}
