//! Per-caller token-bucket rate limiting.
//!
//! One bucket per `(group, token fingerprint, client IP)`, maintained by
//! a single atomic Lua script: refill by elapsed time, decrement on
//! allow, idle-expire at roughly twice the full-refill time. Buckets are
//! shared by every API process through the store.
//!
//! Failure policy: fail open. A broken store must not take down the
//! read API.

use std::time::{SystemTime, UNIX_EPOCH};

use deadpool_redis::Pool;
use once_cell::sync::Lazy;
use redis::Script;
use sha2::{Digest, Sha256};
use tracing::error;

use crate::store::{self, keys};

// KEYS[1] bucket, ARGV: now_ms, rate_per_ms, burst.
// Returns {allowed, retry_after_ms, remaining_tokens}.
const TOKEN_BUCKET_LUA: &str = r"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local burst = tonumber(ARGV[3])

local data = redis.call('HMGET', key, 'ts', 'tokens')
local last_ts = tonumber(data[1])
local tokens = tonumber(data[2])

if last_ts == nil then
  last_ts = now
  tokens = burst
end

local delta = now - last_ts
if delta < 0 then delta = 0 end
tokens = math.min(burst, tokens + (delta * rate))
last_ts = now

local allowed = 0
local retry_after = 0
if tokens >= 1.0 then
  allowed = 1
  tokens = tokens - 1.0
else
  allowed = 0
  retry_after = math.ceil((1.0 - tokens) / rate)
end

redis.call('HMSET', key, 'ts', last_ts, 'tokens', tokens)

local ttl_ms = math.ceil((burst / rate) * 2)
redis.call('PEXPIRE', key, ttl_ms)

return {allowed, retry_after, tokens}
";

static TOKEN_BUCKET_SCRIPT: Lazy<Script> = Lazy::new(|| Script::new(TOKEN_BUCKET_LUA));

/// One group's bucket parameters: sustained tokens per second plus burst.
#[derive(Debug, Clone, Copy)]
pub struct RateRule {
    pub group: &'static str,
    pub rate: f64,
    pub burst: u32,
}

/// The recognized groups: tight buckets for listings and mutations,
/// loose ones for health checks and status polling.
pub const RULES: &[RateRule] = &[
    RateRule {
        group: "health",
        rate: 2.0,
        burst: 5,
    },
    RateRule {
        group: "status",
        rate: 10.0,
        burst: 30,
    },
    RateRule {
        group: "count",
        rate: 5.0,
        burst: 15,
    },
    RateRule {
        group: "emails",
        rate: 1.0,
        burst: 3,
    },
    RateRule {
        group: "mutate",
        rate: 1.0,
        burst: 3,
    },
];

#[must_use]
pub fn rule_for(group: &str) -> RateRule {
    RULES
        .iter()
        .copied()
        .find(|rule| rule.group == group)
        .unwrap_or(RULES[1]) // "status" is the fallback group
}

/// Map a request path to its rate group.
#[must_use]
pub fn resolve_group(path: &str) -> &'static str {
    if path.starts_with("/health") {
        return "health";
    }
    if path.starts_with("/xray/status") {
        return "status";
    }
    if path.contains("/inbounds/") && path.ends_with("/users/count") {
        return "count";
    }
    if path.contains("/inbounds/") && path.ends_with("/emails") {
        return "emails";
    }
    if path.starts_with("/clients/")
        || path.starts_with("/xray/restore")
        || path.starts_with("/xray/add_user")
    {
        return "mutate";
    }
    "status"
}

/// Stable, non-reversible keying for the presented credential. Never the
/// credential itself.
#[must_use]
pub fn token_fingerprint(authorization: Option<&str>) -> String {
    let Some(value) = authorization else {
        return "anon".to_string();
    };
    let Some(token) = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
    else {
        return "anon".to_string();
    };

    let digest = Sha256::digest(token.trim().as_bytes());
    format!("t:{}", &hex::encode(digest)[..16])
}

/// Outcome of one bucket check.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after_ms: u64,
    pub remaining: f64,
}

/// Store-backed token bucket checker.
#[derive(Clone)]
pub struct RateLimiter {
    pool: Pool,
}

impl RateLimiter {
    #[must_use]
    pub const fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Take one token from the caller's bucket in `group`. Fails open.
    pub async fn check(&self, group: &'static str, token_fp: &str, ip: &str) -> RateDecision {
        let rule = rule_for(group);
        match self.invoke(&rule, token_fp, ip).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(group, error = %e, "rate limit store error, allowing");
                RateDecision {
                    allowed: true,
                    retry_after_ms: 0,
                    remaining: 0.0,
                }
            }
        }
    }

    async fn invoke(
        &self,
        rule: &RateRule,
        token_fp: &str,
        ip: &str,
    ) -> Result<RateDecision, crate::error::AgentError> {
        let mut conn = store::connection(&self.pool).await?;

        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let rate_per_ms = rule.rate / 1000.0;

        let (allowed, retry_after_ms, remaining): (i64, i64, f64) = TOKEN_BUCKET_SCRIPT
            .key(keys::rate_bucket(rule.group, token_fp, ip))
            .arg(now_ms)
            .arg(rate_per_ms)
            .arg(rule.burst)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| crate::error::AgentError::Redis(e.to_string()))?;

        Ok(RateDecision {
            allowed: allowed == 1,
            retry_after_ms: retry_after_ms.max(0) as u64,
            remaining,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolver_maps_every_surface() {
        assert_eq!(resolve_group("/health/full"), "health");
        assert_eq!(resolve_group("/health/logfile"), "health");
        assert_eq!(resolve_group("/xray/status"), "status");
        assert_eq!(resolve_group("/xray/status/clients"), "status");
        assert_eq!(resolve_group("/inbounds/vless-in/users/count"), "count");
        assert_eq!(resolve_group("/inbounds/vless-in/emails"), "emails");
        assert_eq!(resolve_group("/clients/issue"), "mutate");
        assert_eq!(resolve_group("/clients/123456"), "mutate");
        assert_eq!(resolve_group("/xray/restore"), "mutate");
        assert_eq!(resolve_group("/xray/add_user"), "mutate");
        assert_eq!(resolve_group("/jobs/abc"), "status");
    }

    #[test]
    fn test_rule_table_matches_contract() {
        let mutate = rule_for("mutate");
        assert!((mutate.rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(mutate.burst, 3);
        let status = rule_for("status");
        assert_eq!(status.burst, 30);
        // Unknown groups fall back to the status rule.
        assert_eq!(rule_for("nope").group, "status");
    }

    #[test]
    fn test_fingerprint_is_stable_and_opaque() {
        let a = token_fingerprint(Some("Bearer super-secret-token"));
        let b = token_fingerprint(Some("Bearer super-secret-token"));
        assert_eq!(a, b);
        assert!(a.starts_with("t:"));
        assert_eq!(a.len(), 18);
        assert!(!a.contains("super-secret-token"));

        assert_eq!(token_fingerprint(None), "anon");
        assert_eq!(token_fingerprint(Some("Basic abc")), "anon");
    }

    #[tokio::test]
    async fn test_check_fails_open_without_store() {
        let pool = store::create_pool("redis://127.0.0.1:1/0").unwrap();
        let limiter = RateLimiter::new(pool);
        let decision = limiter.check("mutate", "anon", "1.2.3.4").await;
        assert!(decision.allowed);
    }
}
