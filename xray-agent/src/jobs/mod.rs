//! Background jobs: envelopes, status documents and payloads.
//!
//! A job is an opaque unit of work created by enqueue, mutated only by
//! the worker and destroyed by TTL expiry in the state store. Status
//! advances `queued → running → done|error` and never regresses; a
//! document that outlives its TTL is observed as `not_found`.

pub mod handlers;
pub mod store;
pub mod worker;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use handlers::HandlerDeps;
pub use store::JobStore;
pub use worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    IssueClient,
    AddClient,
    RemoveClient,
    BulkRestore,
}

impl JobKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IssueClient => "issue_client",
            Self::AddClient => "add_client",
            Self::RemoveClient => "remove_client",
            Self::BulkRestore => "bulk_restore",
        }
    }
}

/// Queue envelope. The payload stays untyped here; the worker parses it
/// by kind at dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub payload: Value,
    /// Wall-clock seconds.
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Error,
    NotFound,
}

impl JobState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// Classified error carried in a failed job's status document. The full
/// trace is included only when debug mode is enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

/// Status document, overwritten on every state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: String,
    pub state: JobState,
    /// Wall-clock seconds of the last transition.
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl JobStatus {
    #[must_use]
    pub fn not_found(job_id: &str) -> Self {
        Self {
            id: job_id.to_string(),
            state: JobState::NotFound,
            updated_at: 0,
            result: None,
            error: None,
        }
    }
}

/// `issue_client` payload: the worker generates the UUID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuePayload {
    /// Telegram user id as a digit string; becomes the proxy email.
    pub telegram_id: String,
    #[serde(default)]
    pub inbound_tag: Option<String>,
    #[serde(default)]
    pub level: u32,
    /// Unset means the configured default flow.
    #[serde(default)]
    pub flow: Option<String>,
}

fn default_add_flow() -> String {
    "xtls-rprx-vision".to_string()
}

fn default_true() -> bool {
    true
}

/// `add_client` payload: caller supplies the UUID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddPayload {
    pub uuid: String,
    pub email: String,
    #[serde(default)]
    pub inbound_tag: Option<String>,
    #[serde(default)]
    pub level: u32,
    #[serde(default = "default_add_flow")]
    pub flow: String,
    #[serde(default = "default_true")]
    pub precheck: bool,
}

/// `remove_client` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemovePayload {
    pub email: String,
    #[serde(default)]
    pub inbound_tag: Option<String>,
}
