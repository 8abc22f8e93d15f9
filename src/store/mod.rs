//! Store adapter.
//!
//! The queue engine only needs a handful of list, sorted-set, and set
//! primitives plus one atomic migration. Each call must be atomic on its
//! own; nothing here spans more than one command except `migrate_due`.
//!
//! Lists follow Redis orientation: `lpush` writes the left end and
//! `rpoplpush` takes from the right end, so the right end holds the
//! oldest entry.

pub mod memory;
pub mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use crate::error::Result;
use async_trait::async_trait;

/// Maximum number of entries a single bulk command touches.
pub const CHUNK_SIZE: usize = 100;

#[async_trait]
pub trait Store: Send + Sync {
    /// Prepend `value` to the list at `key`.
    async fn lpush(&self, key: &str, value: &str) -> Result<()>;

    /// Atomically pop the right end of `from` and prepend it to `to`.
    /// `None` when `from` is empty.
    async fn rpoplpush(&self, from: &str, to: &str) -> Result<Option<String>>;

    /// Remove up to `count` occurrences of `value`, scanning from the left.
    /// Returns how many were removed.
    async fn lrem(&self, key: &str, count: usize, value: &str) -> Result<usize>;

    async fn llen(&self, key: &str) -> Result<usize>;

    /// Keep only the inclusive range `start..=stop`. Negative indexes count
    /// from the right end, as in Redis.
    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()>;

    /// Add `member` with `score`, updating the score if it is already present.
    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<()>;

    async fn zcard(&self, key: &str) -> Result<usize>;

    /// Remove the members ranked `start..=stop` by ascending score.
    async fn zremrangebyrank(&self, key: &str, start: isize, stop: isize) -> Result<()>;

    /// Returns true if `member` was newly added.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// Returns true if `member` was present.
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Returns true if the key existed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// In one atomic step, remove every member of `delayed` scored at or
    /// below `now` and append them to the right end of `ready` in ascending
    /// score order. Returns the number of members moved.
    async fn migrate_due(&self, delayed: &str, ready: &str, now: i64) -> Result<usize>;
}

/// Resolve a Redis-style inclusive index range against a collection of
/// `len` entries. `None` when the range selects nothing.
pub(crate) fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}
