//! Guard state in the store: the `warned_at` timestamp plus the
//! warn/ban/thanks anti-spam locks. Everything is TTL-bounded and
//! advisory; losing a key costs at most one extra notification or a
//! delayed ban.

use deadpool_redis::Pool;
use tracing::error;

use crate::error::AgentError;
use crate::store;

#[derive(Clone)]
pub struct GuardStore {
    pool: Pool,
}

impl GuardStore {
    #[must_use]
    pub const fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, AgentError> {
        let mut conn = store::connection(&self.pool).await?;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .map_err(|e| AgentError::Redis(e.to_string()))
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_sec: u64) -> Result<(), AgentError> {
        let mut conn = store::connection(&self.pool).await?;
        let () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_sec)
            .query_async(&mut *conn)
            .await
            .map_err(|e| AgentError::Redis(e.to_string()))?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), AgentError> {
        let mut conn = store::connection(&self.pool).await?;
        let () = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .map_err(|e| AgentError::Redis(e.to_string()))?;
        Ok(())
    }

    /// One atomic `SET NX EX`: true exactly once per TTL window. A store
    /// error yields false so a flapping store cannot cause notification
    /// spam or repeated bans.
    pub async fn allow_once(&self, key: &str, ttl_sec: u64) -> bool {
        let outcome: Result<Option<String>, AgentError> = async {
            let mut conn = store::connection(&self.pool).await?;
            redis::cmd("SET")
                .arg(key)
                .arg("1")
                .arg("NX")
                .arg("EX")
                .arg(ttl_sec)
                .query_async(&mut *conn)
                .await
                .map_err(|e| AgentError::Redis(e.to_string()))
        }
        .await;

        match outcome {
            Ok(set) => set.is_some(),
            Err(e) => {
                error!(key, error = %e, "allow_once store error, suppressing");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allow_once_suppresses_without_store() {
        let pool = crate::store::create_pool("redis://127.0.0.1:1/0").unwrap();
        let guard_store = GuardStore::new(pool);
        assert!(!guard_store.allow_once("xray_guard:t:e:once:warn", 60).await);
    }
}
