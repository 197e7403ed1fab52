//! Redis-backed lock, Redlock's single-instance primitive without the
//! multi-node quorum: `SET key owner NX PX <ttl>` to acquire, a
//! compare-and-delete Lua script to release so a holder can never delete a
//! lock it no longer owns (e.g. after its TTL already expired and someone
//! else acquired it).

use std::time::Duration;

use deadpool_redis::{redis, Pool};
use rand::Rng;

use crate::error::{ServerError, ServerResult};
use crate::lock::LockBackend;

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

#[derive(Debug)]
pub struct RedisBackend {
    pool: Pool,
    /// Random per-process token so a release can't delete a different
    /// holder's lock of the same key.
    owner: String,
}

impl RedisBackend {
    pub fn new(pool: Pool) -> Self {
        let owner: u128 = rand::thread_rng().gen();
        Self { pool, owner: format!("{owner:032x}") }
    }

    async fn connection(&self) -> ServerResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| ServerError::lock_unavailable("redis", e))
    }
}

#[async_trait::async_trait]
impl LockBackend for RedisBackend {
    async fn try_acquire_exclusive(&self, key: &str, ttl: Duration) -> ServerResult<bool> {
        let mut conn = self.connection().await?;
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&self.owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| ServerError::lock_unavailable("redis", e))?;
        Ok(result.is_some())
    }

    async fn release_exclusive(&self, key: &str) -> ServerResult<()> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(RELEASE_SCRIPT);
        script
            .key(key)
            .arg(&self.owner)
            .invoke_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| ServerError::lock_unavailable("redis", e))?;
        Ok(())
    }
}
