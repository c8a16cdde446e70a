//! Error taxonomy surfaced to callers.
//!
//! Every failure a caller can observe is one of the codes below,
//! rendered as `{"error": {code, message, request_id, details}}`.
//! Upstream detail strings are truncated and stripped of
//! credential-shaped substrings before they leave the process.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use thiserror::Error;

use crate::middleware::RequestId;
use crate::xray::XrayError;

/// Maximum length of an upstream detail string surfaced to a caller or
/// stored in a job error document.
pub const MAX_DETAIL_LEN: usize = 500;

/// Agent-level error with a caller-visible code.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Missing or malformed credential.
    #[error("{0}")]
    Unauthenticated(String),

    /// Credential present but wrong.
    #[error("invalid token")]
    Forbidden,

    /// Token bucket for the caller's group is empty.
    #[error("too many requests")]
    RateLimited {
        group: &'static str,
        retry_after_ms: u64,
    },

    /// Capacity reservation for the inbound was denied.
    #[error("inbound capacity exceeded for tag {tag}")]
    CapacityExceeded { tag: String },

    /// Proxy RPC failure not otherwise classified. The adapter truncates
    /// and scrubs details at construction, so the message is safe.
    #[error("upstream service error: {0}")]
    Upstream(#[from] XrayError),

    /// An overall operation deadline elapsed (bulk restore).
    #[error("upstream operation timed out")]
    UpstreamTimeout,

    /// Proxy port closed or sys-stats failing (health paths only).
    #[error("xray is not healthy")]
    XrayUnavailable { details: serde_json::Value },

    /// State store unreachable for a required write.
    #[error("queue backend error: {0}")]
    Redis(String),

    /// Polled job id absent or expired.
    #[error("job not found")]
    JobNotFound { job_id: String },

    /// Synchronous variant of an async-only endpoint.
    #[error("sync mode disabled; use async=true")]
    SyncDisabled,

    /// Request decoding failure (surfaced as a 400 without a dedicated code).
    #[error("{0}")]
    BadRequest(String),

    /// Uncaught failure; the body carries only the request id.
    #[error("internal server error")]
    Internal(#[source] anyhow::Error),
}

impl AgentError {
    /// Stable code string for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "UNAUTHENTICATED",
            Self::Forbidden => "FORBIDDEN",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            Self::Upstream(_) | Self::UpstreamTimeout => "UPSTREAM_ERROR",
            Self::XrayUnavailable { .. } => "XRAY_UNAVAILABLE",
            Self::Redis(_) => "REDIS_ERROR",
            Self::JobNotFound { .. } => "JOB_NOT_FOUND",
            Self::SyncDisabled => "SYNC_DISABLED",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status this error maps to.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CapacityExceeded { .. } => StatusCode::CONFLICT,
            Self::Upstream(_) | Self::Redis(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::XrayUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::JobNotFound { .. } => StatusCode::NOT_FOUND,
            Self::SyncDisabled | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Structured details included in the envelope; never leaks more
    /// than the classification already admits.
    fn details(&self) -> serde_json::Value {
        match self {
            Self::RateLimited {
                group,
                retry_after_ms,
            } => json!({ "group": group, "retry_after_ms": retry_after_ms }),
            Self::CapacityExceeded { tag } => json!({ "inbound_tag": tag }),
            Self::Upstream(err) => json!({ "detail": safe_detail(&err.to_string()) }),
            Self::XrayUnavailable { details } => details.clone(),
            Self::JobNotFound { job_id } => json!({ "job_id": job_id }),
            _ => json!({}),
        }
    }
}

/// An [`AgentError`] bound to the request it occurred in, ready to be
/// rendered as the normalized error envelope.
#[derive(Debug)]
pub struct ApiError {
    request_id: RequestId,
    error: AgentError,
}

impl ApiError {
    #[must_use]
    pub fn new(request_id: &RequestId, error: AgentError) -> Self {
        Self {
            request_id: request_id.clone(),
            error,
        }
    }

    #[must_use]
    pub fn error(&self) -> &AgentError {
        &self.error
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.error.status();
        let body = json!({
            "error": {
                "code": self.error.code(),
                "message": self.error.to_string(),
                "request_id": self.request_id.as_str(),
                "details": self.error.details(),
            }
        });

        let mut response = (status, Json(body)).into_response();
        if let AgentError::RateLimited { retry_after_ms, .. } = self.error {
            let retry_secs = (retry_after_ms / 1000).max(1);
            if let Ok(value) = retry_secs.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

static BEARER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/=-]+").expect("bearer regex"));

// No dashes, so UUIDs in upstream details survive scrubbing.
static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9+/_=]{32,}").expect("token regex"));

/// Truncate an upstream detail to [`MAX_DETAIL_LEN`] chars and strip
/// credential-shaped substrings.
#[must_use]
pub fn safe_detail(detail: &str) -> String {
    let scrubbed = BEARER_RE.replace_all(detail, "bearer [redacted]");
    let scrubbed = TOKEN_RE.replace_all(&scrubbed, "[redacted]");
    truncate_chars(&scrubbed, MAX_DETAIL_LEN)
}

/// Truncate at a char boundary without panicking on multibyte input.
#[must_use]
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(AgentError::Forbidden.code(), "FORBIDDEN");
        assert_eq!(
            AgentError::RateLimited {
                group: "mutate",
                retry_after_ms: 1200
            }
            .code(),
            "RATE_LIMITED"
        );
        assert_eq!(
            AgentError::Redis("connection refused".into()).code(),
            "REDIS_ERROR"
        );
        assert_eq!(AgentError::SyncDisabled.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AgentError::UpstreamTimeout.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_safe_detail_truncates() {
        let long = "x".repeat(2000);
        assert_eq!(safe_detail(&long).chars().count(), MAX_DETAIL_LEN);
    }

    #[test]
    fn test_safe_detail_scrubs_bearer() {
        let detail = "call failed: Authorization: Bearer abc.def-123 rejected";
        let scrubbed = safe_detail(detail);
        assert!(!scrubbed.contains("abc.def-123"));
        assert!(scrubbed.contains("bearer [redacted]"));
    }

    #[test]
    fn test_safe_detail_scrubs_long_tokens_but_keeps_uuids() {
        let detail = "token sk1234567890abcdef1234567890abcdef for user \
                      3f2b8c1a-9d4e-4f6a-8b2c-1d3e5f7a9b0c";
        let scrubbed = safe_detail(detail);
        assert!(!scrubbed.contains("sk1234567890abcdef1234567890abcdef"));
        assert!(scrubbed.contains("3f2b8c1a-9d4e-4f6a-8b2c-1d3e5f7a9b0c"));
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        let s = "абвгд";
        assert_eq!(truncate_chars(s, 3), "абв");
    }

    proptest::proptest! {
        #[test]
        fn prop_truncate_never_exceeds_cap(s in ".{0,800}", max in 0usize..600) {
            proptest::prop_assert!(truncate_chars(&s, max).chars().count() <= max);
        }

        #[test]
        fn prop_safe_detail_bounded_and_total(s in ".{0,800}") {
            let out = safe_detail(&s);
            proptest::prop_assert!(out.chars().count() <= MAX_DETAIL_LEN);
        }
    }
}
