use super::Database;
use crate::error::Result;
use crate::keys;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per `(contact, trigger)` delivery history used for rate limiting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleRecord {
    /// Times events were accepted for delivery, oldest first.
    #[serde(default)]
    pub events: Vec<i64>,
    /// End of the current throttled period; 0 when not throttled.
    #[serde(default)]
    pub throttled_until: i64,
}

impl ThrottleRecord {
    /// Drops entries older than `window_s` relative to `now`.
    pub fn prune(&mut self, now: i64, window_s: i64) {
        let cutoff = now - window_s;
        self.events.retain(|ts| *ts > cutoff);
    }

    pub fn count(&self) -> usize {
        self.events.len()
    }
}

impl Database {
    /// Current record and its stored form for compare-and-set.
    pub fn get_throttle(
        &self,
        contact_id: &str,
        trigger_id: &str,
    ) -> Result<Option<(String, ThrottleRecord)>> {
        let Some(raw) = self.kv.get(&keys::throttling(contact_id, trigger_id))? else {
            return Ok(None);
        };
        let record = serde_json::from_str(&raw)?;
        Ok(Some((raw, record)))
    }

    /// Writes `record` only if the stored form still equals `expected`.
    pub fn cas_throttle(
        &self,
        contact_id: &str,
        trigger_id: &str,
        expected: Option<&str>,
        record: &ThrottleRecord,
        ttl: Duration,
    ) -> Result<bool> {
        let raw = serde_json::to_string(record)?;
        self.kv.compare_and_set(
            &keys::throttling(contact_id, trigger_id),
            expected,
            &raw,
            Some(ttl),
        )
    }

    /// Number of live throttling records.
    pub fn throttled_records(&self) -> Result<usize> {
        self.kv.count_prefix(keys::THROTTLING_PREFIX)
    }
}
