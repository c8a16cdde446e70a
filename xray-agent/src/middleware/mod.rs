//! HTTP middleware: request-id propagation, bearer auth and the
//! rate-limit gate. The core behind these is HTTP-free; everything here
//! is translation.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use uuid::Uuid;

use crate::error::{AgentError, ApiError};
use crate::limits::rate::{resolve_group, token_fingerprint};
use crate::state::AppState;

/// Per-request correlation id, honored from the caller or generated,
/// and echoed back as `x-request-id`.
#[derive(Debug, Clone)]
pub struct RequestId(String);

impl RequestId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::generate()
    }
}

/// Outermost middleware: establish the request id before anything can
/// fail, so every error envelope carries one.
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let rid = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map_or_else(RequestId::generate, |value| RequestId(value.to_string()));

    request.extensions_mut().insert(rid.clone());
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(rid.as_str()) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

fn request_id_of(request: &Request) -> RequestId {
    request
        .extensions()
        .get::<RequestId>()
        .cloned()
        .unwrap_or_default()
}

/// Digest equality instead of a byte-by-byte token compare, so timing
/// does not leak how much of the secret matched.
fn token_matches(presented: &str, expected: &str) -> bool {
    Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
}

/// Bearer auth on the single configured secret. Missing/malformed
/// credentials are 401, a wrong token is 403.
pub async fn require_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let rid = request_id_of(&request);

    let Some(header) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    else {
        return Err(ApiError::new(
            &rid,
            AgentError::Unauthenticated("missing Authorization header".to_string()),
        ));
    };

    let token = match header.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token.trim(),
        _ => {
            return Err(ApiError::new(
                &rid,
                AgentError::Unauthenticated(
                    "invalid Authorization scheme, use: Bearer <token>".to_string(),
                ),
            ))
        }
    };

    if !token_matches(token, &state.settings().api.token) {
        return Err(ApiError::new(&rid, AgentError::Forbidden));
    }

    Ok(next.run(request).await)
}

fn client_ip(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |info| info.0.ip().to_string())
}

/// Take one token from the caller's bucket for the path's group. Denials
/// are RATE_LIMITED with `Retry-After`; allowed responses carry the
/// group so callers can see which budget they spent.
pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let rid = request_id_of(&request);
    let group = resolve_group(request.uri().path());
    let fingerprint = token_fingerprint(
        request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok()),
    );
    let ip = client_ip(&request);

    let decision = state.rate_limiter().check(group, &fingerprint, &ip).await;
    if !decision.allowed {
        return ApiError::new(
            &rid,
            AgentError::RateLimited {
                group,
                retry_after_ms: decision.retry_after_ms,
            },
        )
        .into_response();
    }

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert("x-ratelimit-group", HeaderValue::from_static(group));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_token_compare() {
        assert!(token_matches("secret", "secret"));
        assert!(!token_matches("secret", "secret2"));
        assert!(!token_matches("", "secret"));
    }

    fn request_with_headers(headers: &[(&str, &str)]) -> Request {
        let mut builder = axum::http::Request::builder().uri("/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_client_ip_prefers_forwarded_header() {
        let request = request_with_headers(&[("x-forwarded-for", "9.9.9.9, 10.0.0.1")]);
        assert_eq!(client_ip(&request), "9.9.9.9");
    }

    #[test]
    fn test_client_ip_without_any_source_is_unknown() {
        let request = request_with_headers(&[]);
        assert_eq!(client_ip(&request), "unknown");
    }

    #[test]
    fn test_client_ip_falls_back_past_empty_forwarded_header() {
        let request = request_with_headers(&[("x-forwarded-for", " ")]);
        assert_eq!(client_ip(&request), "unknown");
    }
}
