//! HTTP surface.
//!
//! Thin request decoding over the core: governance runs in middleware,
//! mutations go to the queue or straight to the job handlers, reads hit
//! the proxy adapter or the snapshot cache. The core never sees HTTP.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::error::{AgentError, ApiError};
use crate::jobs::{handlers as job_handlers, IssuePayload, JobKind, JobState, RemovePayload};
use crate::middleware::{rate_limit, request_id, require_token, RequestId};
use crate::restore;
use crate::state::AppState;

/// Full route table with governance layers applied.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health/full", get(health_full))
        .route("/health/logfile", get(health_logfile))
        .route("/xray/status", get(xray_status))
        .route("/xray/status/clients", get(status_clients))
        .route("/inbounds/{tag}/users/count", get(inbound_users_count))
        .route("/inbounds/{tag}/emails", get(inbound_emails))
        .route("/clients/issue", post(issue_client))
        .route("/clients/{email}", delete(remove_client))
        .route("/xray/restore", post(restore_users))
        .route("/xray/add_user", post(add_user))
        .route("/jobs/{job_id}", get(job_status))
        .layer(from_fn_with_state(state.clone(), require_token))
        .layer(from_fn_with_state(state.clone(), rate_limit))
        .layer(from_fn(request_id))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_DEADLINE))
        .with_state(state)
}

/// Outer bound on any single request, restore included.
const REQUEST_DEADLINE: Duration = Duration::from_secs(120);

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct AsyncQuery {
    #[serde(default = "default_true", rename = "async")]
    r#async: bool,
}

#[derive(Debug, Deserialize)]
struct RemoveQuery {
    #[serde(default)]
    inbound_tag: Option<String>,
    #[serde(default, rename = "async")]
    r#async: bool,
}

/// Issue request as the bot backend submits it.
#[derive(Debug, Deserialize)]
pub struct IssueClientRequest {
    /// Telegram user id as a digit string; becomes the proxy email.
    pub telegram_id: String,
    #[serde(default)]
    pub inbound_tag: Option<String>,
    #[serde(default)]
    pub level: Option<u32>,
    #[serde(default)]
    pub flow: Option<String>,
}

impl IssueClientRequest {
    fn validate(&self) -> Result<(), AgentError> {
        let id = self.telegram_id.trim();
        if id.is_empty() || id.len() > 32 || !id.chars().all(|c| c.is_ascii_digit()) {
            return Err(AgentError::BadRequest(
                "telegram_id must be a numeric string, e.g. '123456789'".to_string(),
            ));
        }
        if let Some(level) = self.level {
            if level > 255 {
                return Err(AgentError::BadRequest(
                    "level must be within 0..=255".to_string(),
                ));
            }
        }
        Ok(())
    }
}

async fn health_full(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = state.xray().runtime_status().await;
    if !status.ok {
        return Err(ApiError::new(
            &rid,
            AgentError::XrayUnavailable {
                details: json!({
                    "xray_api_addr": status.api_addr,
                    "xray_api_port_open": status.port_open,
                }),
            },
        ));
    }

    Ok(Json(json!({
        "ok": true,
        "xray": status,
        "request_id": rid.as_str(),
    })))
}

async fn health_logfile(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let lines = state
        .logwatch()
        .tail(5)
        .await
        .map_err(|e| ApiError::new(&rid, e))?;
    Ok(Json(json!({
        "ok": true,
        "tail_lines": lines.len(),
        "request_id": rid.as_str(),
    })))
}

/// Fast status: always 200, `/health/full` owns the 503 semantics.
async fn xray_status(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
) -> Json<serde_json::Value> {
    let status = state.xray().runtime_status().await;
    Json(json!({
        "xray": status,
        "request_id": rid.as_str(),
    }))
}

async fn status_clients(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
) -> Json<serde_json::Value> {
    match state.logwatch().snapshot().await {
        Ok(snapshot) => {
            let mut body = serde_json::to_value(&*snapshot).unwrap_or_else(|_| json!({}));
            if let Some(map) = body.as_object_mut() {
                map.insert("request_id".to_string(), json!(rid.as_str()));
            }
            Json(body)
        }
        Err(e) => Json(json!({
            "ok": false,
            "error": e.to_string(),
            "request_id": rid.as_str(),
        })),
    }
}

async fn inbound_users_count(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Path(tag): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let count = state
        .xray()
        .count_users(&tag)
        .await
        .map_err(|e| ApiError::new(&rid, e.into()))?;
    Ok(Json(json!({ "result": count, "request_id": rid.as_str() })))
}

async fn inbound_emails(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Path(tag): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let users = state
        .xray()
        .list_users(&tag)
        .await
        .map_err(|e| ApiError::new(&rid, e.into()))?;
    let mut emails: Vec<String> = users.into_iter().map(|user| user.email).collect();
    emails.sort();
    Ok(Json(json!({ "result": emails, "request_id": rid.as_str() })))
}

/// Async-only: the worker generates the UUID, adds the user, builds the
/// link and notifies. The caller polls `/jobs/{job_id}`.
async fn issue_client(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Query(query): Query<AsyncQuery>,
    Json(request): Json<IssueClientRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !query.r#async {
        return Err(ApiError::new(&rid, AgentError::SyncDisabled));
    }
    request.validate().map_err(|e| ApiError::new(&rid, e))?;

    let payload = IssuePayload {
        telegram_id: request.telegram_id.trim().to_string(),
        inbound_tag: request.inbound_tag,
        level: request.level.unwrap_or(0),
        flow: request.flow,
    };
    let (job_id, deduped) = state
        .jobs()
        .enqueue_issue(&payload, &state.settings().xray.inbound_tag)
        .await
        .map_err(|e| ApiError::new(&rid, e))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "queued",
            "job_id": job_id,
            "deduped": deduped,
            "request_id": rid.as_str(),
        })),
    ))
}

/// Remove by email, either inline or queued. Both paths share the job
/// handler, so dedupe invalidation and the capacity release behave
/// identically.
async fn remove_client(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Path(email): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let payload = RemovePayload {
        email,
        inbound_tag: query.inbound_tag,
    };

    if query.r#async {
        let raw = serde_json::to_value(&payload)
            .map_err(|e| ApiError::new(&rid, AgentError::Internal(e.into())))?;
        let job_id = state
            .jobs()
            .enqueue(JobKind::RemoveClient, raw)
            .await
            .map_err(|e| ApiError::new(&rid, e))?;
        return Ok(Json(
            json!({ "job_id": job_id, "request_id": rid.as_str() }),
        ));
    }

    let result = job_handlers::handle_remove(state.deps(), payload)
        .await
        .map_err(|e| ApiError::new(&rid, e))?;
    Ok(Json(json!({ "result": result, "request_id": rid.as_str() })))
}

async fn restore_users(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Json(request): Json<restore::RestoreRequest>,
) -> Result<Json<restore::RestoreReport>, ApiError> {
    let report = restore::run(state.xray().clone(), request)
        .await
        .map_err(|e| ApiError::new(&rid, e))?;
    Ok(Json(report))
}

async fn add_user(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Json(payload): Json<crate::jobs::AddPayload>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let result = job_handlers::handle_add(state.deps(), payload)
        .await
        .map_err(|e| ApiError::new(&rid, e))?;
    Ok(Json(result))
}

async fn job_status(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Path(job_id): Path<String>,
) -> Result<Json<crate::jobs::JobStatus>, ApiError> {
    let status = state
        .jobs()
        .status(&job_id)
        .await
        .map_err(|e| ApiError::new(&rid, e))?;
    if status.state == JobState::NotFound {
        return Err(ApiError::new(&rid, AgentError::JobNotFound { job_id }));
    }
    Ok(Json(status))
}
