//! Per-inbound capacity limiter.
//!
//! A plain `if count >= limit` check races under concurrent issue
//! requests, so reservation is a single Lua script under `cap:<tag>`.
//! The counter carries a safety TTL so a worker that crashes between
//! reserve and release cannot leak its slot forever.
//!
//! Failure policy: reserve fails closed (a broken store denies), release
//! failures are logged only.

use deadpool_redis::Pool;
use once_cell::sync::Lazy;
use redis::Script;
use tracing::error;

use crate::config::CapacitySettings;
use crate::error::AgentError;
use crate::store::{self, keys};

const RESERVE_LUA: &str = r"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])

local cur = redis.call('GET', key)
if cur == false then
  cur = 0
else
  cur = tonumber(cur)
end

if cur >= limit then
  return {0, cur}
end

cur = redis.call('INCR', key)
redis.call('EXPIRE', key, ttl)

return {1, cur}
";

const RELEASE_LUA: &str = r"
local key = KEYS[1]
local cur = redis.call('GET', key)
if cur == false then
  return 0
end
cur = tonumber(cur)
if cur <= 0 then
  redis.call('DEL', key)
  return 0
end
cur = redis.call('DECR', key)
if cur <= 0 then
  redis.call('DEL', key)
end
return cur
";

static RESERVE_SCRIPT: Lazy<Script> = Lazy::new(|| Script::new(RESERVE_LUA));
static RELEASE_SCRIPT: Lazy<Script> = Lazy::new(|| Script::new(RELEASE_LUA));

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, Copy)]
pub struct Reservation {
    pub allowed: bool,
    /// Counter value observed by the script; `-1` when the store failed.
    pub current: i64,
}

/// Atomic reserve/release against the shared capacity counter.
#[derive(Clone)]
pub struct CapacityLimiter {
    pool: Pool,
    settings: CapacitySettings,
}

impl CapacityLimiter {
    #[must_use]
    pub fn new(pool: Pool, settings: CapacitySettings) -> Self {
        Self { pool, settings }
    }

    /// Reserve one slot for `tag`. Fails closed: a store error denies.
    pub async fn reserve(&self, tag: &str) -> Reservation {
        match self.try_reserve(tag).await {
            Ok(reservation) => reservation,
            Err(e) => {
                error!(tag, error = %e, "capacity reserve store error, denying");
                Reservation {
                    allowed: false,
                    current: -1,
                }
            }
        }
    }

    async fn try_reserve(&self, tag: &str) -> Result<Reservation, AgentError> {
        let mut conn = store::connection(&self.pool).await?;
        let (ok, current): (i64, i64) = RESERVE_SCRIPT
            .key(keys::capacity(tag))
            .arg(self.settings.limit)
            .arg(self.settings.ttl_sec)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| AgentError::Redis(e.to_string()))?;
        Ok(Reservation {
            allowed: ok == 1,
            current,
        })
    }

    /// Release one slot for `tag`. Errors are logged only.
    pub async fn release(&self, tag: &str) {
        let result: Result<i64, AgentError> = async {
            let mut conn = store::connection(&self.pool).await?;
            RELEASE_SCRIPT
                .key(keys::capacity(tag))
                .invoke_async(&mut *conn)
                .await
                .map_err(|e| AgentError::Redis(e.to_string()))
        }
        .await;

        if let Err(e) = result {
            error!(tag, error = %e, "capacity release store error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The scripts themselves run inside Redis; what can go wrong on this
    // side is the failure policy.
    #[tokio::test]
    async fn test_reserve_fails_closed_without_store() {
        let pool = store::create_pool("redis://127.0.0.1:1/0").unwrap();
        let limiter = CapacityLimiter::new(pool, CapacitySettings::default());
        let reservation = limiter.reserve("vless-in").await;
        assert!(!reservation.allowed);
        assert_eq!(reservation.current, -1);
    }

    #[tokio::test]
    async fn test_release_never_panics_without_store() {
        let pool = store::create_pool("redis://127.0.0.1:1/0").unwrap();
        let limiter = CapacityLimiter::new(pool, CapacitySettings::default());
        limiter.release("vless-in").await;
    }
}
