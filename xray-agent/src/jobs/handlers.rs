//! Job handlers: the actual work behind each job kind. Shared by the
//! worker runtime and by the synchronous HTTP paths, so a sync remove
//! and a queued remove behave identically.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::AgentError;
use crate::jobs::{AddPayload, IssuePayload, Job, JobKind, JobStore, RemovePayload};
use crate::limits::CapacityLimiter;
use crate::links::build_vless_link;
use crate::notify::Notifier;
use crate::restore;
use crate::xray::{AddOutcome, RemoveOutcome, UserSpec, XrayApi};

/// Everything a handler needs; built once per process.
pub struct HandlerDeps {
    pub settings: Arc<Settings>,
    pub xray: Arc<dyn XrayApi>,
    pub jobs: JobStore,
    pub capacity: CapacityLimiter,
    pub notifier: Arc<Notifier>,
}

impl HandlerDeps {
    fn tag_or_default(&self, tag: Option<&str>) -> String {
        tag.map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(&self.settings.xray.inbound_tag)
            .to_string()
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(job: &Job) -> Result<T, AgentError> {
    serde_json::from_value(job.payload.clone()).map_err(|e| {
        AgentError::BadRequest(format!("invalid {} payload: {e}", job.kind.as_str()))
    })
}

/// Dispatch one dequeued job to its handler.
pub async fn dispatch(deps: &HandlerDeps, job: &Job) -> Result<Value, AgentError> {
    match job.kind {
        JobKind::IssueClient => handle_issue(deps, parse_payload(job)?).await,
        JobKind::AddClient => handle_add(deps, parse_payload(job)?).await,
        JobKind::RemoveClient => handle_remove(deps, parse_payload(job)?).await,
        JobKind::BulkRestore => {
            let request: restore::RestoreRequest = parse_payload(job)?;
            let report = restore::run(deps.xray.clone(), request).await?;
            serde_json::to_value(report).map_err(|e| AgentError::Internal(e.into()))
        }
    }
}

/// The "new user" flow: fresh UUID, capacity slot, add, link, notify.
pub async fn handle_issue(deps: &HandlerDeps, payload: IssuePayload) -> Result<Value, AgentError> {
    let email = payload.telegram_id.trim().to_string();
    let tag = deps.tag_or_default(payload.inbound_tag.as_deref());
    let flow = payload
        .flow
        .clone()
        .unwrap_or_else(|| deps.settings.link.default_flow());
    let uuid = Uuid::new_v4().to_string();

    let reservation = deps.capacity.reserve(&tag).await;
    if !reservation.allowed {
        return Err(AgentError::CapacityExceeded { tag });
    }

    let spec = UserSpec {
        uuid: uuid.clone(),
        email: email.clone(),
        inbound_tag: tag.clone(),
        level: payload.level,
        flow: flow.clone(),
    };
    if let Err(e) = deps.xray.add_user(spec).await {
        // The user was not created; give the slot back.
        deps.capacity.release(&tag).await;
        return Err(e.into());
    }
    // AlreadyExists lands here too: the outcome the caller asked for holds.

    let link = build_vless_link(&uuid, &email, &flow, &deps.settings.link)?;

    // Best-effort: a created user is never rolled back over a notify
    // failure, the outcome is recorded in the result instead.
    let notify = deps.notifier.notify_issued(&uuid, &email, &tag, &link).await;

    Ok(json!({
        "issued": {
            "uuid": uuid,
            "email": email,
            "inbound_tag": tag,
            "link": link,
        },
        "notify": notify,
    }))
}

/// Direct add with a caller-supplied UUID; idempotent on "exists".
pub async fn handle_add(deps: &HandlerDeps, payload: AddPayload) -> Result<Value, AgentError> {
    let tag = deps.tag_or_default(payload.inbound_tag.as_deref());

    let response = |detail: &str| {
        json!({
            "ok": true,
            "inbound_tag": tag,
            "email": payload.email,
            "uuid": payload.uuid,
            "detail": detail,
        })
    };

    if payload.precheck {
        let users = deps.xray.list_users(&tag).await?;
        if users.iter().any(|user| user.email == payload.email) {
            return Ok(response("exists (precheck)"));
        }
    }

    let spec = UserSpec {
        uuid: payload.uuid.clone(),
        email: payload.email.clone(),
        inbound_tag: tag.clone(),
        level: payload.level,
        flow: payload.flow.clone(),
    };
    let outcome = deps.xray.add_user(spec).await?;
    Ok(match outcome {
        AddOutcome::Added => response("added"),
        AddOutcome::AlreadyExists => response("already exists"),
    })
}

/// Remove by email. "Not found" is a skipped success; a confirmed remove
/// invalidates the issue dedupe pointer and gives the capacity slot back.
pub async fn handle_remove(
    deps: &HandlerDeps,
    payload: RemovePayload,
) -> Result<Value, AgentError> {
    let email = payload.email.trim().to_string();
    let tag = deps.tag_or_default(payload.inbound_tag.as_deref());

    match deps.xray.remove_user(&email, &tag).await? {
        RemoveOutcome::Removed => {
            match deps.jobs.clear_issue_dedupe(&email, &tag).await {
                Ok(cleared) => {
                    debug!(email = %email, tag = %tag, cleared, "issue dedupe invalidated");
                }
                Err(e) => {
                    // The pointer expires on its own within the window.
                    warn!(email = %email, tag = %tag, error = %e, "issue dedupe invalidation failed");
                }
            }
            deps.capacity.release(&tag).await;
            Ok(json!({ "removed": true, "email": email, "inbound_tag": tag }))
        }
        RemoveOutcome::NotFound => Ok(json!({
            "skipped": true,
            "reason": "user not found",
            "email": email,
            "inbound_tag": tag,
        })),
    }
}
