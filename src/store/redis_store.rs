//! Redis-backed store.
//!
//! Uses a `ConnectionManager` so one multiplexed connection is shared by
//! every queue on a process and reconnects transparently after a drop.

use crate::error::Result;
use crate::store::Store;
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

/// Moves due members of a sorted set onto the right end of a list.
///
/// KEYS[1] delayed sorted set, KEYS[2] ready list, ARGV[1] now (unix seconds).
/// RPUSH is chunked so `unpack` never exceeds Lua's stack limit.
const MIGRATE_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
if next(due) == nil then
    return 0
end

redis.call('ZREMRANGEBYRANK', KEYS[1], 0, #due - 1)

for i = 1, #due, 100 do
    redis.call('RPUSH', KEYS[2], unpack(due, i, math.min(i + 99, #due)))
end

return #due
"#;

/// Store adapter over a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    migrate_due: redis::Script,
}

impl RedisStore {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        tracing::debug!("connected to redis");
        Ok(Self {
            conn,
            migrate_due: redis::Script::new(MIGRATE_DUE_SCRIPT),
        })
    }

    /// Round-trip a PING to check the server is reachable.
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: usize = conn.lpush(key, value).await?;
        Ok(())
    }

    async fn rpoplpush(&self, from: &str, to: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.rpoplpush(from, to).await?)
    }

    async fn lrem(&self, key: &str, count: usize, value: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.lrem(key, count as isize, value).await?)
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(key).await?)
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.ltrim(key, start, stop).await?;
        Ok(())
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: usize = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(key).await?)
    }

    async fn zremrangebyrank(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: usize = redis::cmd("ZREMRANGEBYRANK")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let added: usize = conn.sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: usize = conn.del(key).await?;
        Ok(deleted > 0)
    }

    async fn migrate_due(&self, delayed: &str, ready: &str, now: i64) -> Result<usize> {
        let mut conn = self.conn.clone();
        let moved: usize = self
            .migrate_due
            .key(delayed)
            .key(ready)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }
}
