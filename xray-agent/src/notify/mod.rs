//! Best-effort outbound notifications.
//!
//! The agent never rolls anything back because the downstream system is
//! unreachable: every delivery returns a [`NotifyOutcome`] describing
//! what happened, and callers record it instead of failing.

use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::NotifySettings;
use crate::error::truncate_chars;

/// Backoff ceiling between delivery attempts.
const BACKOFF_CAP: Duration = Duration::from_secs(8);
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// What a delivery attempt amounted to. Serialized into job results.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NotifyOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl NotifyOutcome {
    fn skipped(reason: &str) -> Self {
        Self {
            skipped: Some(true),
            status_code: None,
            reason: Some(reason.to_string()),
        }
    }
}

/// Guard policy events forwarded to the notification backend, which owns
/// the user-facing wording.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardEventKind {
    Warn,
    Ban,
    Thanks,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardEvent {
    pub event: GuardEventKind,
    pub email: String,
    pub inbound_tag: String,
    pub devices: usize,
    pub limit: usize,
    pub grace_sec: u64,
}

/// JSON POST sender with bounded retries.
pub struct Notifier {
    client: reqwest::Client,
    settings: NotifySettings,
}

impl Notifier {
    pub fn new(settings: NotifySettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_sec))
            .build()?;
        Ok(Self { client, settings })
    }

    /// Notify the backend about an issued client.
    pub async fn notify_issued(
        &self,
        uuid: &str,
        email: &str,
        inbound_tag: &str,
        link: &str,
    ) -> NotifyOutcome {
        self.deliver(json!({
            "uuid": uuid,
            "email": email,
            "inbound_tag": inbound_tag,
            "link": link,
        }))
        .await
    }

    /// Forward a guard policy event.
    pub async fn notify_guard(&self, event: &GuardEvent) -> NotifyOutcome {
        match serde_json::to_value(event) {
            Ok(payload) => self.deliver(payload).await,
            Err(e) => NotifyOutcome {
                skipped: Some(true),
                status_code: None,
                reason: Some(e.to_string()),
            },
        }
    }

    /// POST `payload`, retrying transport errors and 5xx responses with
    /// capped exponential backoff, the whole delivery bounded by the
    /// configured total timeout.
    async fn deliver(&self, payload: serde_json::Value) -> NotifyOutcome {
        let Some(url) = self.settings.url.clone() else {
            return NotifyOutcome::skipped("notify url not configured");
        };

        let total = Duration::from_secs(self.settings.total_timeout_sec);
        match tokio::time::timeout(total, self.attempt_loop(&url, &payload)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(url = %url, "notify total timeout exceeded");
                NotifyOutcome {
                    skipped: None,
                    status_code: None,
                    reason: Some("notify total timeout exceeded".to_string()),
                }
            }
        }
    }

    async fn attempt_loop(&self, url: &str, payload: &serde_json::Value) -> NotifyOutcome {
        let attempts = self.settings.retries.max(1);
        let mut last_reason = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                let backoff = BACKOFF_BASE
                    .saturating_mul(2u32.saturating_pow(attempt - 1))
                    .min(BACKOFF_CAP);
                tokio::time::sleep(backoff).await;
            }

            let mut request = self.client.post(url).json(payload);
            if let Some(api_key) = &self.settings.api_key {
                request = request.header("X-API-Key", api_key);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        debug!(url = %url, status = status.as_u16(), "notify delivered");
                        return NotifyOutcome {
                            skipped: None,
                            status_code: Some(status.as_u16()),
                            reason: None,
                        };
                    }
                    if status.is_client_error() {
                        // The backend understood us and said no; retrying
                        // the same payload cannot change that.
                        return NotifyOutcome {
                            skipped: None,
                            status_code: Some(status.as_u16()),
                            reason: Some("rejected by notify backend".to_string()),
                        };
                    }
                    last_reason = format!("http {}", status.as_u16());
                }
                Err(e) => {
                    last_reason = truncate_chars(&e.to_string(), 200);
                }
            }
            warn!(url = %url, attempt, reason = %last_reason, "notify attempt failed");
        }

        NotifyOutcome {
            skipped: None,
            status_code: None,
            reason: Some(last_reason),
        }
    }
}
