//! State store client.
//!
//! A thin layer over a pooled Redis connection: the pool constructor and
//! the single place every key name used by the agent is declared. All
//! agent state is advisory and TTL-bounded; the proxy remains the source
//! of truth for the user set.

use deadpool_redis::{Config, Pool, Runtime};

use crate::error::AgentError;

/// Build the shared connection pool. Connections are established lazily,
/// so this succeeds even when the store is down; individual operations
/// surface the failure instead.
pub fn create_pool(url: &str) -> anyhow::Result<Pool> {
    let pool = Config::from_url(url).create_pool(Some(Runtime::Tokio1))?;
    Ok(pool)
}

/// Check out a connection, mapping pool errors to the caller-visible
/// store error.
pub async fn connection(pool: &Pool) -> Result<deadpool_redis::Connection, AgentError> {
    pool.get()
        .await
        .map_err(|e| AgentError::Redis(e.to_string()))
}

/// Key names, all in one place.
pub mod keys {
    /// Job queue (LIST; producers LPUSH, workers BRPOP).
    pub const JOB_QUEUE: &str = "xray:jobs";

    /// Job status document.
    #[must_use]
    pub fn job(job_id: &str) -> String {
        format!("xray:job:{job_id}")
    }

    /// Issue idempotency pointer, keyed by the request hash.
    #[must_use]
    pub fn idem(hash: &str) -> String {
        format!("xray:idem:{hash}")
    }

    /// Per-inbound capacity counter.
    #[must_use]
    pub fn capacity(tag: &str) -> String {
        format!("cap:{tag}")
    }

    /// Rate-limit bucket for one caller in one group.
    #[must_use]
    pub fn rate_bucket(group: &str, token_fingerprint: &str, ip: &str) -> String {
        format!("rl:{group}:{token_fingerprint}:{ip}")
    }

    /// Guard state keys for one `(inbound, email)` pair.
    #[derive(Debug, Clone)]
    pub struct GuardKeys {
        pub warned_at: String,
        pub once_warn: String,
        pub once_ban: String,
        pub once_thanks: String,
    }

    #[must_use]
    pub fn guard(tag: &str, email: &str) -> GuardKeys {
        let base = format!("xray_guard:{tag}:{email}");
        GuardKeys {
            warned_at: format!("{base}:warned_at"),
            once_warn: format!("{base}:once:warn"),
            once_ban: format!("{base}:once:ban"),
            once_thanks: format!("{base}:once:thanks"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::keys;

    #[test]
    fn test_key_shapes() {
        assert_eq!(keys::job("abc"), "xray:job:abc");
        assert_eq!(keys::idem("deadbeef"), "xray:idem:deadbeef");
        assert_eq!(keys::capacity("vless-in"), "cap:vless-in");
        assert_eq!(
            keys::rate_bucket("mutate", "t:0011", "1.2.3.4"),
            "rl:mutate:t:0011:1.2.3.4"
        );

        let g = keys::guard("vless-in", "42");
        assert_eq!(g.warned_at, "xray_guard:vless-in:42:warned_at");
        assert_eq!(g.once_warn, "xray_guard:vless-in:42:once:warn");
        assert_eq!(g.once_ban, "xray_guard:vless-in:42:once:ban");
        assert_eq!(g.once_thanks, "xray_guard:vless-in:42:once:thanks");
    }
}
