use crate::error::Result;
use std::time::Duration;

/// Key-value store with Redis-like collection semantics.
///
/// Every operation on a single key is atomic. Implementations must be safe to
/// share across threads because the filter, checker, scheduler and dispatcher
/// all hold the same store.
///
/// Sorted-set scores are integers (unix seconds for the notification queue
/// and metric samples). Sorted-set reads return entries ordered by score,
/// then by member.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Writes `value`, replacing any previous value and expiry.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Deletes a key of any kind. Returns true if something was removed.
    fn del(&self, key: &str) -> Result<bool>;

    /// Writes `value` only if `key` is absent or expired.
    fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Writes `value` only if the current value equals `expected`
    /// (`None` meaning absent).
    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Deletes `key` only if its current value equals `expected`.
    fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Number of live plain keys starting with `prefix`.
    fn count_prefix(&self, prefix: &str) -> Result<usize>;

    fn sadd(&self, key: &str, members: &[String]) -> Result<usize>;
    fn srem(&self, key: &str, members: &[String]) -> Result<usize>;
    /// Members in lexical order.
    fn smembers(&self, key: &str) -> Result<Vec<String>>;
    /// Removes and returns every member of the set.
    fn spop_all(&self, key: &str) -> Result<Vec<String>>;

    /// Adds or re-scores `member`.
    fn zadd(&self, key: &str, score: i64, member: &str) -> Result<()>;
    fn zrange_by_score(&self, key: &str, min: i64, max: i64) -> Result<Vec<(String, i64)>>;
    fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> Result<usize>;
    /// Atomically removes and returns up to `limit` entries with score `<= max`.
    fn zpop_by_score(&self, key: &str, max: i64, limit: usize) -> Result<Vec<(String, i64)>>;
    fn zrem(&self, key: &str, member: &str) -> Result<bool>;
    fn zcard(&self, key: &str) -> Result<usize>;

    fn rpush(&self, key: &str, values: &[String]) -> Result<usize>;
    /// Pushes to the head; the first element of `values` ends up first.
    fn lpush(&self, key: &str, values: &[String]) -> Result<usize>;
    fn lpop(&self, key: &str, count: usize) -> Result<Vec<String>>;
    fn lrange(&self, key: &str, start: usize, count: usize) -> Result<Vec<String>>;
    fn llen(&self, key: &str) -> Result<usize>;

    /// Drops expired keys. Returns the number removed.
    fn purge_expired(&self) -> Result<usize>;

    fn ping(&self) -> Result<()>;
}
