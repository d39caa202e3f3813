use crate::error::{Result, StorageError};
use crate::kv::KvStore;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Default)]
struct ZSet {
    by_member: HashMap<String, i64>,
    by_score: BTreeSet<(i64, String)>,
}

impl ZSet {
    fn insert(&mut self, score: i64, member: &str) {
        if let Some(old) = self.by_member.insert(member.to_string(), score) {
            self.by_score.remove(&(old, member.to_string()));
        }
        self.by_score.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.by_member.remove(member) {
            Some(score) => {
                self.by_score.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn range(&self, min: i64, max: i64) -> Vec<(String, i64)> {
        if min > max {
            return Vec::new();
        }
        self.by_score
            .range((min, String::new())..)
            .take_while(|(score, _)| *score <= max)
            .map(|(score, member)| (member.clone(), *score))
            .collect()
    }
}

#[derive(Default)]
struct Inner {
    kv: HashMap<String, (String, Option<Instant>)>,
    sets: HashMap<String, BTreeSet<String>>,
    zsets: HashMap<String, ZSet>,
    lists: HashMap<String, VecDeque<String>>,
}

impl Inner {
    fn live_value(&mut self, key: &str) -> Option<String> {
        let expired = match self.kv.get(key) {
            Some((_, Some(deadline))) => *deadline <= Instant::now(),
            Some(_) => false,
            None => return None,
        };
        if expired {
            self.kv.remove(key);
            return None;
        }
        self.kv.get(key).map(|(v, _)| v.clone())
    }

    fn put(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        let deadline = ttl.map(|d| Instant::now() + d);
        self.kv.insert(key.to_string(), (value.to_string(), deadline));
    }
}

/// Process-local store. Used for tests and single-process deployments that
/// do not need durability.
///
/// [`MemoryStore::set_available`] simulates an outage: while unavailable
/// every call fails with [`StorageError::Unavailable`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable);
        }
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.live_value(key))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.lock()?.put(key, value, ttl);
        Ok(())
    }

    fn del(&self, key: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        let removed = inner.kv.remove(key).is_some()
            | inner.sets.remove(key).is_some()
            | inner.zsets.remove(key).is_some()
            | inner.lists.remove(key).is_some();
        Ok(removed)
    }

    fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut inner = self.lock()?;
        if inner.live_value(key).is_some() {
            return Ok(false);
        }
        inner.put(key, value, ttl);
        Ok(true)
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        if inner.live_value(key).as_deref() != expected {
            return Ok(false);
        }
        inner.put(key, value, ttl);
        Ok(true)
    }

    fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        if inner.live_value(key).as_deref() != Some(expected) {
            return Ok(false);
        }
        inner.kv.remove(key);
        Ok(true)
    }

    fn count_prefix(&self, prefix: &str) -> Result<usize> {
        let inner = self.lock()?;
        let now = Instant::now();
        Ok(inner
            .kv
            .iter()
            .filter(|(k, (_, deadline))| {
                k.starts_with(prefix) && deadline.map_or(true, |d| d > now)
            })
            .count())
    }

    fn sadd(&self, key: &str, members: &[String]) -> Result<usize> {
        let mut inner = self.lock()?;
        let set = inner.sets.entry(key.to_string()).or_default();
        Ok(members.iter().filter(|m| set.insert((*m).clone())).count())
    }

    fn srem(&self, key: &str, members: &[String]) -> Result<usize> {
        let mut inner = self.lock()?;
        let Some(set) = inner.sets.get_mut(key) else {
            return Ok(0);
        };
        let removed = members.iter().filter(|m| set.remove(m.as_str())).count();
        if set.is_empty() {
            inner.sets.remove(key);
        }
        Ok(removed)
    }

    fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let inner = self.lock()?;
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn spop_all(&self, key: &str) -> Result<Vec<String>> {
        let mut inner = self.lock()?;
        Ok(inner
            .sets
            .remove(key)
            .map(|s| s.into_iter().collect())
            .unwrap_or_default())
    }

    fn zadd(&self, key: &str, score: i64, member: &str) -> Result<()> {
        let mut inner = self.lock()?;
        inner
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(score, member);
        Ok(())
    }

    fn zrange_by_score(&self, key: &str, min: i64, max: i64) -> Result<Vec<(String, i64)>> {
        let inner = self.lock()?;
        Ok(inner
            .zsets
            .get(key)
            .map(|z| z.range(min, max))
            .unwrap_or_default())
    }

    fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> Result<usize> {
        let mut inner = self.lock()?;
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(0);
        };
        let doomed = zset.range(min, max);
        for (member, _) in &doomed {
            zset.remove(member);
        }
        Ok(doomed.len())
    }

    fn zpop_by_score(&self, key: &str, max: i64, limit: usize) -> Result<Vec<(String, i64)>> {
        let mut inner = self.lock()?;
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(Vec::new());
        };
        let mut popped = zset.range(i64::MIN, max);
        popped.truncate(limit);
        for (member, _) in &popped {
            zset.remove(member);
        }
        Ok(popped)
    }

    fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        Ok(inner
            .zsets
            .get_mut(key)
            .map(|z| z.remove(member))
            .unwrap_or(false))
    }

    fn zcard(&self, key: &str) -> Result<usize> {
        let inner = self.lock()?;
        Ok(inner.zsets.get(key).map(|z| z.by_member.len()).unwrap_or(0))
    }

    fn rpush(&self, key: &str, values: &[String]) -> Result<usize> {
        let mut inner = self.lock()?;
        let list = inner.lists.entry(key.to_string()).or_default();
        list.extend(values.iter().cloned());
        Ok(list.len())
    }

    fn lpush(&self, key: &str, values: &[String]) -> Result<usize> {
        let mut inner = self.lock()?;
        let list = inner.lists.entry(key.to_string()).or_default();
        for v in values.iter().rev() {
            list.push_front(v.clone());
        }
        Ok(list.len())
    }

    fn lpop(&self, key: &str, count: usize) -> Result<Vec<String>> {
        let mut inner = self.lock()?;
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(Vec::new());
        };
        let n = count.min(list.len());
        let out: Vec<String> = list.drain(..n).collect();
        if list.is_empty() {
            inner.lists.remove(key);
        }
        Ok(out)
    }

    fn lrange(&self, key: &str, start: usize, count: usize) -> Result<Vec<String>> {
        let inner = self.lock()?;
        Ok(inner
            .lists
            .get(key)
            .map(|l| l.iter().skip(start).take(count).cloned().collect())
            .unwrap_or_default())
    }

    fn llen(&self, key: &str) -> Result<usize> {
        let inner = self.lock()?;
        Ok(inner.lists.get(key).map(|l| l.len()).unwrap_or(0))
    }

    fn purge_expired(&self) -> Result<usize> {
        let mut inner = self.lock()?;
        let now = Instant::now();
        let before = inner.kv.len();
        inner
            .kv
            .retain(|_, (_, deadline)| deadline.map_or(true, |d| d > now));
        Ok(before - inner.kv.len())
    }

    fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }
}
