//! In-process store with Redis semantics.
//!
//! Backs the test suite and local development. Every operation takes one
//! mutex, which gives the same per-command atomicity Redis does. Empty
//! collections are removed, matching how Redis drops empty keys.

use crate::error::{Error, Result};
use crate::store::{Store, resolve_range};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    /// Front is the left end.
    lists: HashMap<String, VecDeque<String>>,
    /// Kept ordered by (score, member) like a Redis sorted set.
    sorted: HashMap<String, Vec<(i64, String)>>,
    sets: HashMap<String, BTreeSet<String>>,
    calls: HashMap<&'static str, usize>,
    unavailable: bool,
}

/// Store held entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail, simulating a store outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.unavailable = unavailable;
        }
    }

    /// How many times `operation` (the trait method name) has been called.
    pub fn calls(&self, operation: &str) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.calls.get(operation).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Snapshot of a list, left end first.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .lists
                    .get(key)
                    .map(|list| list.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Snapshot of a sorted set in ascending score order.
    pub fn sorted(&self, key: &str) -> Vec<(i64, String)> {
        self.inner
            .lock()
            .map(|inner| inner.sorted.get(key).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn lock(&self, operation: &'static str) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::Store("memory store lock poisoned".to_string()))?;
        *inner.calls.entry(operation).or_default() += 1;
        if inner.unavailable {
            return Err(Error::Store(format!("store unavailable during {operation}")));
        }
        Ok(inner)
    }
}

impl Inner {
    fn drop_if_empty(&mut self, key: &str) {
        if self.lists.get(key).is_some_and(VecDeque::is_empty) {
            self.lists.remove(key);
        }
        if self.sorted.get(key).is_some_and(Vec::is_empty) {
            self.sorted.remove(key);
        }
        if self.sets.get(key).is_some_and(BTreeSet::is_empty) {
            self.sets.remove(key);
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.lock("lpush")?;
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn rpoplpush(&self, from: &str, to: &str) -> Result<Option<String>> {
        let mut inner = self.lock("rpoplpush")?;
        let Some(value) = inner.lists.get_mut(from).and_then(VecDeque::pop_back) else {
            return Ok(None);
        };
        inner
            .lists
            .entry(to.to_string())
            .or_default()
            .push_front(value.clone());
        inner.drop_if_empty(from);
        Ok(Some(value))
    }

    async fn lrem(&self, key: &str, count: usize, value: &str) -> Result<usize> {
        let mut inner = self.lock("lrem")?;
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(0);
        };
        let mut removed = 0;
        while removed < count {
            match list.iter().position(|entry| entry == value) {
                Some(index) => {
                    list.remove(index);
                    removed += 1;
                }
                None => break,
            }
        }
        inner.drop_if_empty(key);
        Ok(removed)
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        let inner = self.lock("llen")?;
        Ok(inner.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let mut inner = self.lock("ltrim")?;
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(());
        };
        match resolve_range(list.len(), start, stop) {
            Some((start, stop)) => {
                list.truncate(stop + 1);
                list.drain(..start);
            }
            None => list.clear(),
        }
        inner.drop_if_empty(key);
        Ok(())
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<()> {
        let mut inner = self.lock("zadd")?;
        let set = inner.sorted.entry(key.to_string()).or_default();
        set.retain(|(_, existing)| existing != member);
        let entry = (score, member.to_string());
        let index = set.partition_point(|existing| *existing < entry);
        set.insert(index, entry);
        Ok(())
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        let inner = self.lock("zcard")?;
        Ok(inner.sorted.get(key).map_or(0, Vec::len))
    }

    async fn zremrangebyrank(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let mut inner = self.lock("zremrangebyrank")?;
        let Some(set) = inner.sorted.get_mut(key) else {
            return Ok(());
        };
        if let Some((start, stop)) = resolve_range(set.len(), start, stop) {
            set.drain(start..=stop);
        }
        inner.drop_if_empty(key);
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.lock("sadd")?;
        Ok(inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.lock("srem")?;
        let removed = inner
            .sets
            .get_mut(key)
            .is_some_and(|set| set.remove(member));
        inner.drop_if_empty(key);
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let inner = self.lock("smembers")?;
        Ok(inner
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut inner = self.lock("del")?;
        let list = inner.lists.remove(key).is_some();
        let sorted = inner.sorted.remove(key).is_some();
        let set = inner.sets.remove(key).is_some();
        Ok(list || sorted || set)
    }

    async fn migrate_due(&self, delayed: &str, ready: &str, now: i64) -> Result<usize> {
        let mut inner = self.lock("migrate_due")?;
        let due: Vec<String> = match inner.sorted.get_mut(delayed) {
            Some(set) => {
                let split = set.partition_point(|(score, _)| *score <= now);
                set.drain(..split).map(|(_, member)| member).collect()
            }
            None => return Ok(0),
        };
        inner.drop_if_empty(delayed);
        if due.is_empty() {
            return Ok(0);
        }
        let moved = due.len();
        inner
            .lists
            .entry(ready.to_string())
            .or_default()
            .extend(due);
        Ok(moved)
    }
}
