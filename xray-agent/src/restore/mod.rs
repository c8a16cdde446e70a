//! Bulk restore engine.
//!
//! Re-adds many users to an inbound under one request: duplicates are
//! collapsed in memory, an optional precheck consults the live email
//! set, and the remaining items flow through a bounded
//! producer/consumer pipeline. Per-item failures never fail the run;
//! they are counted, with up to [`MAX_ERROR_SAMPLES`] samples kept for
//! the response. An overall deadline, when given, cancels the pipeline
//! and discards partial results.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::info;

use crate::error::{truncate_chars, AgentError};
use crate::xray::{AddOutcome, UserSpec, XrayApi};

/// Cap on error samples carried in the report.
pub const MAX_ERROR_SAMPLES: usize = 20;

/// Per-sample cap on the upstream error text.
const SAMPLE_DETAIL_LEN: usize = 220;

fn default_tag() -> String {
    "vless-in".to_string()
}

fn default_flow() -> String {
    "xtls-rprx-vision".to_string()
}

fn default_precheck() -> bool {
    true
}

fn default_concurrency() -> usize {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreItem {
    pub email: String,
    pub uuid: String,
    #[serde(default)]
    pub level: u32,
    #[serde(default = "default_flow")]
    pub flow: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRequest {
    #[serde(default = "default_tag")]
    pub inbound_tag: String,
    pub items: Vec<RestoreItem>,
    #[serde(default = "default_precheck")]
    pub precheck: bool,
    /// Clamped to 1..=100.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Optional pause between items per worker, to go easy on the proxy.
    #[serde(default)]
    pub delay_ms: u64,
    /// Overall deadline; elapsing cancels the run.
    #[serde(default)]
    pub timeout_sec: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreReport {
    pub inbound_tag: String,
    /// Unique items after in-memory deduplication.
    pub total: usize,
    pub before_count: Option<i64>,
    pub after_count: Option<i64>,
    pub exists: usize,
    pub added: usize,
    pub skipped: usize,
    pub errors: usize,
    pub duration_ms: f64,
    pub error_samples: Vec<String>,
}

#[derive(Default)]
struct Outcomes {
    added: usize,
    skipped: usize,
    errors: usize,
    samples: Vec<String>,
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Run one restore.
///
/// # Errors
///
/// Fails only when the precheck listing fails (silently degrading it
/// would change what the counts mean) or the overall deadline elapses.
pub async fn run(
    xray: Arc<dyn XrayApi>,
    request: RestoreRequest,
) -> Result<RestoreReport, AgentError> {
    let started = Instant::now();
    let tag = request.inbound_tag.clone();
    let concurrency = request.concurrency.clamp(1, 100);

    let before_count = xray.count_users(&tag).await.ok();

    // Collapse duplicates before any RPC leaves the process.
    let mut seen = HashSet::new();
    let mut skipped = 0usize;
    let mut items = Vec::with_capacity(request.items.len());
    for item in request.items {
        if seen.insert((normalize(&item.email), normalize(&item.uuid))) {
            items.push(item);
        } else {
            skipped += 1;
        }
    }
    let total = items.len();

    let mut exists = 0usize;
    if request.precheck && !items.is_empty() {
        let current: HashSet<String> = xray
            .list_users(&tag)
            .await?
            .into_iter()
            .map(|user| normalize(&user.email))
            .collect();
        let (already, fresh): (Vec<_>, Vec<_>) = items
            .into_iter()
            .partition(|item| current.contains(&normalize(&item.email)));
        exists = already.len();
        items = fresh;
    }

    let outcomes = Arc::new(Mutex::new(Outcomes {
        skipped,
        ..Outcomes::default()
    }));

    let (tx, rx) = mpsc::channel::<RestoreItem>((4 * concurrency).max(8));
    let rx = Arc::new(Mutex::new(rx));

    let mut tasks = JoinSet::new();
    tasks.spawn(async move {
        for item in items {
            if tx.send(item).await.is_err() {
                break;
            }
        }
        // Dropping the sender is the end-of-stream signal for workers.
    });

    for _ in 0..concurrency {
        let rx = rx.clone();
        let xray = xray.clone();
        let outcomes = outcomes.clone();
        let tag = tag.clone();
        let delay_ms = request.delay_ms;

        tasks.spawn(async move {
            loop {
                let item = { rx.lock().await.recv().await };
                let Some(item) = item else { break };

                let spec = UserSpec {
                    uuid: item.uuid.trim().to_string(),
                    email: item.email.trim().to_string(),
                    inbound_tag: tag.clone(),
                    level: item.level,
                    flow: item.flow.clone(),
                };
                match xray.add_user(spec).await {
                    Ok(AddOutcome::Added) => outcomes.lock().await.added += 1,
                    Ok(AddOutcome::AlreadyExists) => outcomes.lock().await.skipped += 1,
                    Err(e) => {
                        let mut guard = outcomes.lock().await;
                        guard.errors += 1;
                        if guard.samples.len() < MAX_ERROR_SAMPLES {
                            guard.samples.push(format!(
                                "{}: {}",
                                item.email,
                                truncate_chars(&e.to_string(), SAMPLE_DETAIL_LEN)
                            ));
                        }
                    }
                }

                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        });
    }

    let drained = async {
        while tasks.join_next().await.is_some() {}
    };
    let completed = match request.timeout_sec {
        Some(limit) => tokio::time::timeout(Duration::from_secs(limit), drained)
            .await
            .is_ok(),
        None => {
            drained.await;
            true
        }
    };
    if !completed {
        tasks.abort_all();
        return Err(AgentError::UpstreamTimeout);
    }

    let after_count = xray.count_users(&tag).await.ok();

    let outcomes = outcomes.lock().await;
    let duration_ms = (started.elapsed().as_secs_f64() * 100_000.0).round() / 100.0;
    info!(
        tag = %tag,
        total,
        exists,
        added = outcomes.added,
        skipped = outcomes.skipped,
        errors = outcomes.errors,
        duration_ms,
        "restore finished"
    );

    Ok(RestoreReport {
        inbound_tag: tag,
        total,
        before_count,
        after_count,
        exists,
        added: outcomes.added,
        skipped: outcomes.skipped,
        errors: outcomes.errors,
        duration_ms,
        error_samples: outcomes.samples.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xray::{InboundUser, RemoveOutcome, RuntimeStatus, XrayError};
    use async_trait::async_trait;
    use std::collections::HashSet as StdHashSet;

    /// Stateful stand-in for the proxy: a set of emails per run, plus
    /// failure/latency knobs.
    #[derive(Default)]
    struct FakeXray {
        users: std::sync::Mutex<StdHashSet<String>>,
        fail_listing: bool,
        fail_adds: bool,
        add_delay: Option<Duration>,
    }

    impl FakeXray {
        fn with_users(emails: &[&str]) -> Self {
            Self {
                users: std::sync::Mutex::new(
                    emails.iter().map(|e| (*e).to_string()).collect(),
                ),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl XrayApi for FakeXray {
        async fn sys_stats(&self) -> Result<serde_json::Value, XrayError> {
            Ok(serde_json::json!({}))
        }

        async fn add_user(&self, user: UserSpec) -> Result<AddOutcome, XrayError> {
            if let Some(delay) = self.add_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_adds {
                return Err(XrayError::Unavailable("injected failure".to_string()));
            }
            let mut users = self.users.lock().unwrap();
            if users.insert(user.email) {
                Ok(AddOutcome::Added)
            } else {
                Ok(AddOutcome::AlreadyExists)
            }
        }

        async fn remove_user(&self, email: &str, _tag: &str) -> Result<RemoveOutcome, XrayError> {
            if self.users.lock().unwrap().remove(email) {
                Ok(RemoveOutcome::Removed)
            } else {
                Ok(RemoveOutcome::NotFound)
            }
        }

        async fn list_users(&self, _tag: &str) -> Result<Vec<InboundUser>, XrayError> {
            if self.fail_listing {
                return Err(XrayError::Unavailable("injected failure".to_string()));
            }
            Ok(self
                .users
                .lock()
                .unwrap()
                .iter()
                .map(|email| InboundUser {
                    email: email.clone(),
                    uuid: None,
                })
                .collect())
        }

        async fn count_users(&self, _tag: &str) -> Result<i64, XrayError> {
            Ok(self.users.lock().unwrap().len() as i64)
        }

        async fn runtime_status(&self) -> RuntimeStatus {
            RuntimeStatus {
                api_addr: "127.0.0.1:0".to_string(),
                port_open: false,
                ok: false,
                sys_stats: None,
                error: None,
            }
        }
    }

    fn item(email: &str, uuid: &str) -> RestoreItem {
        RestoreItem {
            email: email.to_string(),
            uuid: uuid.to_string(),
            level: 0,
            flow: default_flow(),
        }
    }

    fn request(items: Vec<RestoreItem>, precheck: bool) -> RestoreRequest {
        RestoreRequest {
            inbound_tag: "vless-in".to_string(),
            items,
            precheck,
            concurrency: 8,
            delay_ms: 0,
            timeout_sec: None,
        }
    }

    #[tokio::test]
    async fn test_duplicates_and_precheck() {
        let xray = Arc::new(FakeXray::with_users(&["u1"]));
        let report = run(
            xray,
            request(
                vec![
                    item("u1", "A"),
                    item("u1", "A"),
                    item("u2", "B"),
                    item("u3", "C"),
                ],
                true,
            ),
        )
        .await
        .unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.exists, 1);
        assert_eq!(report.added, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errors, 0);
        assert_eq!(report.before_count, Some(1));
        assert_eq!(report.after_count, Some(3));
    }

    #[tokio::test]
    async fn test_already_exists_reclassified_without_precheck() {
        let xray = Arc::new(FakeXray::with_users(&["u1"]));
        let report = run(xray, request(vec![item("u1", "A")], false))
            .await
            .unwrap();

        assert_eq!(report.added, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errors, 0);
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let xray = Arc::new(FakeXray::default());
        let items = vec![item("u1", "A"), item("u2", "B"), item("u3", "C")];

        let first = run(xray.clone(), request(items.clone(), true))
            .await
            .unwrap();
        assert_eq!(first.added, 3);
        assert_eq!(first.exists, 0);

        let second = run(xray, request(items, true)).await.unwrap();
        assert_eq!(second.added, 0);
        assert_eq!(second.exists, 3);
        assert_eq!(second.errors, 0);
    }

    #[tokio::test]
    async fn test_per_item_errors_are_sampled_not_fatal() {
        let xray = Arc::new(FakeXray {
            fail_adds: true,
            ..FakeXray::default()
        });
        let report = run(xray, request(vec![item("u1", "A"), item("u2", "B")], false))
            .await
            .unwrap();

        assert_eq!(report.errors, 2);
        assert_eq!(report.added, 0);
        assert_eq!(report.error_samples.len(), 2);
        assert!(report
            .error_samples
            .iter()
            .any(|sample| sample.starts_with("u1: ") || sample.starts_with("u2: ")));
    }

    #[tokio::test]
    async fn test_precheck_failure_is_fatal() {
        let xray = Arc::new(FakeXray {
            fail_listing: true,
            ..FakeXray::default()
        });
        let err = run(xray, request(vec![item("u1", "A")], true))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UPSTREAM_ERROR");
    }

    #[tokio::test]
    async fn test_overall_timeout_cancels_workers() {
        let xray = Arc::new(FakeXray {
            add_delay: Some(Duration::from_secs(30)),
            ..FakeXray::default()
        });
        let mut req = request(vec![item("u1", "A")], false);
        req.timeout_sec = Some(0);

        let err = run(xray, req).await.unwrap_err();
        assert!(matches!(err, AgentError::UpstreamTimeout));
    }

    #[tokio::test]
    async fn test_concurrency_clamped_and_empty_input_ok() {
        let xray = Arc::new(FakeXray::default());
        let mut req = request(vec![], true);
        req.concurrency = 100_000;
        let report = run(xray, req).await.unwrap();
        assert_eq!(report.total, 0);
        assert_eq!(report.added, 0);
    }
}
