//! Job store and queue.
//!
//! One Redis list carries the queue; producers LPUSH, workers BRPOP.
//! Enqueue writes the initial `queued` status and the list entry in one
//! pipelined transaction, so a consumer can never observe a job whose
//! status is uninitialized. Issue enqueues are made idempotent with a
//! conditional `SET NX EX` on a hash of `(telegram_id, inbound_tag)`.

use std::time::{SystemTime, UNIX_EPOCH};

use deadpool_redis::Pool;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::error::AgentError;
use crate::store::{self, keys};

use super::{IssuePayload, Job, JobError, JobKind, JobState, JobStatus};

/// Status documents live for an hour past their last transition.
pub const JOB_TTL_SEC: u64 = 3600;

/// Dedupe window for issue. Short on purpose: it collapses accidental
/// duplicate submissions, and must not outlive the human retry window or
/// a legitimate re-issue after a remove would be deduped to a stale job.
pub const IDEMPOTENCY_TTL_SEC: u64 = 90;

/// Outer bound on one blocking dequeue, so the worker survives store
/// flaps and can observe shutdown.
pub const DEQUEUE_WAIT_SEC: u64 = 3;

fn now() -> i64 {
    #[allow(clippy::cast_possible_wrap)]
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    secs
}

/// Hash of the issue identity used as the dedupe key.
#[must_use]
pub fn issue_idem_hash(telegram_id: &str, inbound_tag: &str) -> String {
    let digest = Sha256::digest(format!("{}|{}", telegram_id.trim(), inbound_tag.trim()));
    hex::encode(digest)
}

#[derive(Clone)]
pub struct JobStore {
    pool: Pool,
}

impl JobStore {
    #[must_use]
    pub const fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Enqueue a job and initialize its status atomically.
    pub async fn enqueue(&self, kind: JobKind, payload: Value) -> Result<String, AgentError> {
        let job_id = Uuid::new_v4().to_string();
        self.push_with_status(&job_id, kind, payload).await?;
        Ok(job_id)
    }

    /// Idempotent enqueue for `issue_client`: two submissions of the same
    /// `(telegram_id, inbound_tag)` within the dedupe window map to one
    /// job. Returns `(job_id, deduped)`.
    pub async fn enqueue_issue(
        &self,
        payload: &IssuePayload,
        default_tag: &str,
    ) -> Result<(String, bool), AgentError> {
        let telegram_id = payload.telegram_id.trim();
        let tag = payload
            .inbound_tag
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(default_tag);

        let idem_key = keys::idem(&issue_idem_hash(telegram_id, tag));
        let job_id = Uuid::new_v4().to_string();

        let mut conn = store::connection(&self.pool).await?;
        let claimed: Option<String> = redis::cmd("SET")
            .arg(&idem_key)
            .arg(&job_id)
            .arg("NX")
            .arg("EX")
            .arg(IDEMPOTENCY_TTL_SEC)
            .query_async(&mut *conn)
            .await
            .map_err(|e| AgentError::Redis(e.to_string()))?;

        if claimed.is_none() {
            let existing: Option<String> = redis::cmd("GET")
                .arg(&idem_key)
                .query_async(&mut *conn)
                .await
                .map_err(|e| AgentError::Redis(e.to_string()))?;
            if let Some(existing) = existing {
                return Ok((existing, true));
            }
            // The key expired between the two commands; carry on as new.
        }
        drop(conn);

        let payload = serde_json::to_value(payload).map_err(|e| AgentError::Internal(e.into()))?;
        self.push_with_status(&job_id, JobKind::IssueClient, payload)
            .await?;
        Ok((job_id, false))
    }

    async fn push_with_status(
        &self,
        job_id: &str,
        kind: JobKind,
        payload: Value,
    ) -> Result<(), AgentError> {
        let job = Job {
            id: job_id.to_string(),
            kind,
            payload,
            created_at: now(),
        };
        let status = JobStatus {
            id: job_id.to_string(),
            state: JobState::Queued,
            updated_at: now(),
            result: None,
            error: None,
        };

        let job_raw = serde_json::to_string(&job).map_err(|e| AgentError::Internal(e.into()))?;
        let status_raw =
            serde_json::to_string(&status).map_err(|e| AgentError::Internal(e.into()))?;

        let mut conn = store::connection(&self.pool).await?;
        let () = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(keys::job(job_id))
            .arg(status_raw)
            .arg("EX")
            .arg(JOB_TTL_SEC)
            .ignore()
            .cmd("LPUSH")
            .arg(keys::JOB_QUEUE)
            .arg(job_raw)
            .ignore()
            .query_async(&mut *conn)
            .await
            .map_err(|e| AgentError::Redis(e.to_string()))?;
        Ok(())
    }

    /// Read a status document; absent or expired maps to `not_found`.
    pub async fn status(&self, job_id: &str) -> Result<JobStatus, AgentError> {
        let mut conn = store::connection(&self.pool).await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(keys::job(job_id))
            .query_async(&mut *conn)
            .await
            .map_err(|e| AgentError::Redis(e.to_string()))?;

        match raw {
            None => Ok(JobStatus::not_found(job_id)),
            Some(raw) => {
                serde_json::from_str(&raw).map_err(|e| AgentError::Internal(e.into()))
            }
        }
    }

    /// Overwrite the status document for a state transition, refreshing
    /// the TTL.
    pub async fn set_state(
        &self,
        job_id: &str,
        state: JobState,
        result: Option<Value>,
        error: Option<JobError>,
    ) -> Result<(), AgentError> {
        let status = JobStatus {
            id: job_id.to_string(),
            state,
            updated_at: now(),
            result,
            error,
        };
        let raw = serde_json::to_string(&status).map_err(|e| AgentError::Internal(e.into()))?;

        let mut conn = store::connection(&self.pool).await?;
        let () = redis::cmd("SET")
            .arg(keys::job(job_id))
            .arg(raw)
            .arg("EX")
            .arg(JOB_TTL_SEC)
            .query_async(&mut *conn)
            .await
            .map_err(|e| AgentError::Redis(e.to_string()))?;
        Ok(())
    }

    /// Blocking-pop one job, waiting at most [`DEQUEUE_WAIT_SEC`].
    pub async fn dequeue(&self) -> Result<Option<Job>, AgentError> {
        let mut conn = store::connection(&self.pool).await?;
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(keys::JOB_QUEUE)
            .arg(DEQUEUE_WAIT_SEC)
            .query_async(&mut *conn)
            .await
            .map_err(|e| AgentError::Redis(e.to_string()))?;

        let Some((_, raw)) = popped else {
            return Ok(None);
        };
        match serde_json::from_str::<Job>(&raw) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                // A poison entry must not wedge the queue.
                warn!(error = %e, raw = %crate::error::truncate_chars(&raw, 200), "dropping undecodable job");
                Ok(None)
            }
        }
    }

    /// Invalidate the issue dedupe pointer for `(telegram_id, tag)`;
    /// called after a confirmed remove so a re-issue is never collapsed
    /// onto the removed job.
    pub async fn clear_issue_dedupe(
        &self,
        telegram_id: &str,
        inbound_tag: &str,
    ) -> Result<u64, AgentError> {
        let mut conn = store::connection(&self.pool).await?;
        let removed: u64 = redis::cmd("DEL")
            .arg(keys::idem(&issue_idem_hash(telegram_id, inbound_tag)))
            .query_async(&mut *conn)
            .await
            .map_err(|e| AgentError::Redis(e.to_string()))?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idem_hash_is_stable_and_trims() {
        let a = issue_idem_hash("123456", "vless-in");
        let b = issue_idem_hash(" 123456 ", "vless-in ");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, issue_idem_hash("123456", "other-in"));
    }

    #[tokio::test]
    async fn test_enqueue_surfaces_store_failure() {
        let pool = crate::store::create_pool("redis://127.0.0.1:1/0").unwrap();
        let jobs = JobStore::new(pool);
        let err = jobs
            .enqueue(JobKind::RemoveClient, serde_json::json!({"email": "u"}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "REDIS_ERROR");
    }

    #[tokio::test]
    async fn test_status_surfaces_store_failure() {
        let pool = crate::store::create_pool("redis://127.0.0.1:1/0").unwrap();
        let jobs = JobStore::new(pool);
        let err = jobs.status("nope").await.unwrap_err();
        assert_eq!(err.code(), "REDIS_ERROR");
    }
}
