use super::Database;
use crate::error::Result;
use crate::keys;
use oxalert_common::types::NotificationEvent;
use std::time::Duration;

impl Database {
    /// Appends events to the tail of the event FIFO.
    pub fn push_events(&self, events: &[NotificationEvent]) -> Result<usize> {
        if events.is_empty() {
            return self.kv.llen(keys::EVENTS);
        }
        let raw = events
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.kv.rpush(keys::EVENTS, &raw)
    }

    /// Pops up to `count` events from the head of the FIFO. Entries that no
    /// longer deserialize are logged and dropped.
    pub fn pop_events(&self, count: usize) -> Result<Vec<NotificationEvent>> {
        let raw = self.kv.lpop(keys::EVENTS, count)?;
        Ok(decode_events(&raw))
    }

    /// Puts events back at the head of the FIFO, preserving their order.
    pub fn requeue_events(&self, events: &[NotificationEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let raw = events
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.kv.lpush(keys::EVENTS, &raw)?;
        Ok(())
    }

    pub fn events_len(&self) -> Result<usize> {
        self.kv.llen(keys::EVENTS)
    }

    /// Records events of a dropped notification in the audit stream.
    pub fn push_audit(&self, events: &[NotificationEvent]) -> Result<()> {
        let raw = events
            .iter()
            .map(|e| {
                let mut e = e.clone();
                e.dispatch_failed = true;
                serde_json::to_string(&e)
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if !raw.is_empty() {
            self.kv.rpush(keys::AUDIT, &raw)?;
        }
        Ok(())
    }

    pub fn audit_events(&self, start: usize, count: usize) -> Result<Vec<NotificationEvent>> {
        let raw = self.kv.lrange(keys::AUDIT, start, count)?;
        Ok(decode_events(&raw))
    }

    /// Returns true the first time `key` is seen within `ttl`.
    pub fn mark_event_seen(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.kv.set_nx(&keys::dedup(key), "1", Some(ttl))
    }

    /// Clears a dedup marker so a redelivered event is handled again.
    pub fn forget_event(&self, key: &str) -> Result<()> {
        self.kv.del(&keys::dedup(key))?;
        Ok(())
    }
}

fn decode_events(raw: &[String]) -> Vec<NotificationEvent> {
    raw.iter()
        .filter_map(|r| match serde_json::from_str(r) {
            Ok(ev) => Some(ev),
            Err(e) => {
                tracing::error!(error = %e, "Dropping undecodable event");
                None
            }
        })
        .collect()
}
