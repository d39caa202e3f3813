use crate::error::Result;
use crate::kv::KvStore;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const KV_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv(expires_at);
";

const SETS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sets (
    key TEXT NOT NULL,
    member TEXT NOT NULL,
    PRIMARY KEY (key, member)
);
";

const ZSETS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS zsets (
    key TEXT NOT NULL,
    member TEXT NOT NULL,
    score INTEGER NOT NULL,
    PRIMARY KEY (key, member)
);
CREATE INDEX IF NOT EXISTS idx_zsets_score ON zsets(key, score, member);
";

const LISTS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS lists (
    key TEXT NOT NULL,
    seq INTEGER NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (key, seq)
);
";

/// Durable store on a single SQLite database in WAL mode.
///
/// Each collection kind has its own table. Expiry is stored as unix
/// milliseconds and checked on read; [`KvStore::purge_expired`] reclaims
/// the rows.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn deadline(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|d| now_ms() + d.as_millis() as i64)
}

fn live_value(tx: &Transaction<'_>, key: &str) -> Result<Option<String>> {
    let value = tx
        .query_row(
            "SELECT value FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            params![key, now_ms()],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(value)
}

fn upsert(tx: &Transaction<'_>, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
    tx.execute(
        "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
        params![key, value, deadline(ttl)],
    )?;
    Ok(())
}

fn zrange(tx: &Transaction<'_>, key: &str, min: i64, max: i64, limit: i64) -> Result<Vec<(String, i64)>> {
    let mut stmt = tx.prepare_cached(
        "SELECT member, score FROM zsets WHERE key = ?1 AND score >= ?2 AND score <= ?3
         ORDER BY score, member LIMIT ?4",
    )?;
    let rows = stmt.query_map(params![key, min, max, limit], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(KV_SCHEMA)?;
        conn.execute_batch(SETS_SCHEMA)?;
        conn.execute_batch(ZSETS_SCHEMA)?;
        conn.execute_batch(LISTS_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the connection, recovering from a poisoned Mutex if necessary.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_tx<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction<'_>) -> Result<R>,
    {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_tx(|tx| live_value(tx, key))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.with_tx(|tx| upsert(tx, key, value, ttl))
    }

    fn del(&self, key: &str) -> Result<bool> {
        self.with_tx(|tx| {
            let mut n = tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            n += tx.execute("DELETE FROM sets WHERE key = ?1", params![key])?;
            n += tx.execute("DELETE FROM zsets WHERE key = ?1", params![key])?;
            n += tx.execute("DELETE FROM lists WHERE key = ?1", params![key])?;
            Ok(n > 0)
        })
    }

    fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        self.with_tx(|tx| {
            if live_value(tx, key)?.is_some() {
                return Ok(false);
            }
            upsert(tx, key, value, ttl)?;
            Ok(true)
        })
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.with_tx(|tx| {
            if live_value(tx, key)?.as_deref() != expected {
                return Ok(false);
            }
            upsert(tx, key, value, ttl)?;
            Ok(true)
        })
    }

    fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        self.with_tx(|tx| {
            if live_value(tx, key)?.as_deref() != Some(expected) {
                return Ok(false);
            }
            tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(true)
        })
    }

    fn count_prefix(&self, prefix: &str) -> Result<usize> {
        self.with_tx(|tx| {
            let n: i64 = tx.query_row(
                "SELECT COUNT(*) FROM kv WHERE substr(key, 1, length(?1)) = ?1
                 AND (expires_at IS NULL OR expires_at > ?2)",
                params![prefix, now_ms()],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }

    fn sadd(&self, key: &str, members: &[String]) -> Result<usize> {
        self.with_tx(|tx| {
            let mut added = 0;
            for m in members {
                added += tx.execute(
                    "INSERT OR IGNORE INTO sets (key, member) VALUES (?1, ?2)",
                    params![key, m],
                )?;
            }
            Ok(added)
        })
    }

    fn srem(&self, key: &str, members: &[String]) -> Result<usize> {
        self.with_tx(|tx| {
            let mut removed = 0;
            for m in members {
                removed += tx.execute(
                    "DELETE FROM sets WHERE key = ?1 AND member = ?2",
                    params![key, m],
                )?;
            }
            Ok(removed)
        })
    }

    fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.with_tx(|tx| {
            let mut stmt =
                tx.prepare_cached("SELECT member FROM sets WHERE key = ?1 ORDER BY member")?;
            let rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    fn spop_all(&self, key: &str) -> Result<Vec<String>> {
        self.with_tx(|tx| {
            let members = {
                let mut stmt =
                    tx.prepare_cached("SELECT member FROM sets WHERE key = ?1 ORDER BY member")?;
                let rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                out
            };
            tx.execute("DELETE FROM sets WHERE key = ?1", params![key])?;
            Ok(members)
        })
    }

    fn zadd(&self, key: &str, score: i64, member: &str) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO zsets (key, member, score) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key, member) DO UPDATE SET score = excluded.score",
                params![key, member, score],
            )?;
            Ok(())
        })
    }

    fn zrange_by_score(&self, key: &str, min: i64, max: i64) -> Result<Vec<(String, i64)>> {
        self.with_tx(|tx| zrange(tx, key, min, max, -1))
    }

    fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> Result<usize> {
        self.with_tx(|tx| {
            let n = tx.execute(
                "DELETE FROM zsets WHERE key = ?1 AND score >= ?2 AND score <= ?3",
                params![key, min, max],
            )?;
            Ok(n)
        })
    }

    fn zpop_by_score(&self, key: &str, max: i64, limit: usize) -> Result<Vec<(String, i64)>> {
        self.with_tx(|tx| {
            let popped = zrange(tx, key, i64::MIN, max, limit as i64)?;
            for (member, _) in &popped {
                tx.execute(
                    "DELETE FROM zsets WHERE key = ?1 AND member = ?2",
                    params![key, member],
                )?;
            }
            Ok(popped)
        })
    }

    fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        self.with_tx(|tx| {
            let n = tx.execute(
                "DELETE FROM zsets WHERE key = ?1 AND member = ?2",
                params![key, member],
            )?;
            Ok(n > 0)
        })
    }

    fn zcard(&self, key: &str) -> Result<usize> {
        self.with_tx(|tx| {
            let n: i64 = tx.query_row(
                "SELECT COUNT(*) FROM zsets WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }

    fn rpush(&self, key: &str, values: &[String]) -> Result<usize> {
        self.with_tx(|tx| {
            let mut seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM lists WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )?;
            for v in values {
                seq += 1;
                tx.execute(
                    "INSERT INTO lists (key, seq, value) VALUES (?1, ?2, ?3)",
                    params![key, seq, v],
                )?;
            }
            list_len(tx, key)
        })
    }

    fn lpush(&self, key: &str, values: &[String]) -> Result<usize> {
        self.with_tx(|tx| {
            let mut seq: i64 = tx.query_row(
                "SELECT COALESCE(MIN(seq), 0) FROM lists WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )?;
            for v in values.iter().rev() {
                seq -= 1;
                tx.execute(
                    "INSERT INTO lists (key, seq, value) VALUES (?1, ?2, ?3)",
                    params![key, seq, v],
                )?;
            }
            list_len(tx, key)
        })
    }

    fn lpop(&self, key: &str, count: usize) -> Result<Vec<String>> {
        self.with_tx(|tx| {
            let head = list_slice(tx, key, 0, count)?;
            if let Some((last_seq, _)) = head.last() {
                tx.execute(
                    "DELETE FROM lists WHERE key = ?1 AND seq <= ?2",
                    params![key, last_seq],
                )?;
            }
            Ok(head.into_iter().map(|(_, v)| v).collect())
        })
    }

    fn lrange(&self, key: &str, start: usize, count: usize) -> Result<Vec<String>> {
        self.with_tx(|tx| {
            Ok(list_slice(tx, key, start, count)?
                .into_iter()
                .map(|(_, v)| v)
                .collect())
        })
    }

    fn llen(&self, key: &str) -> Result<usize> {
        self.with_tx(|tx| list_len(tx, key))
    }

    fn purge_expired(&self) -> Result<usize> {
        self.with_tx(|tx| {
            let n = tx.execute(
                "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now_ms()],
            )?;
            Ok(n)
        })
    }

    fn ping(&self) -> Result<()> {
        let conn = self.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

fn list_len(tx: &Transaction<'_>, key: &str) -> Result<usize> {
    let n: i64 = tx.query_row(
        "SELECT COUNT(*) FROM lists WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )?;
    Ok(n as usize)
}

fn list_slice(tx: &Transaction<'_>, key: &str, start: usize, count: usize) -> Result<Vec<(i64, String)>> {
    let mut stmt = tx.prepare_cached(
        "SELECT seq, value FROM lists WHERE key = ?1 ORDER BY seq LIMIT ?2 OFFSET ?3",
    )?;
    let rows = stmt.query_map(params![key, count as i64, start as i64], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
