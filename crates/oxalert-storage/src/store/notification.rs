use super::Database;
use crate::error::Result;
use crate::keys;
use oxalert_common::types::{ScheduledNotification, ThrottleTier};
use std::time::Duration;

/// A queued notification together with its exact stored form, which is
/// needed to replace it atomically.
#[derive(Debug, Clone)]
pub struct PendingNotification {
    pub raw: String,
    pub notification: ScheduledNotification,
}

impl Database {
    /// Adds a notification to the time-keyed queue and returns its stored form.
    pub fn enqueue_notification(&self, n: &ScheduledNotification) -> Result<String> {
        let raw = serde_json::to_string(n)?;
        self.kv.zadd(keys::NOTIFICATION_QUEUE, n.send_at, &raw)?;
        Ok(raw)
    }

    /// Swaps a queued notification for `new`. Returns the new stored form, or
    /// `None` if `old_raw` is no longer queued (already dispatched).
    pub fn replace_notification(
        &self,
        old_raw: &str,
        new: &ScheduledNotification,
    ) -> Result<Option<String>> {
        if !self.kv.zrem(keys::NOTIFICATION_QUEUE, old_raw)? {
            return Ok(None);
        }
        self.enqueue_notification(new).map(Some)
    }

    /// Atomically removes and returns up to `limit` notifications due at `now`.
    pub fn fetch_due_notifications(
        &self,
        now: i64,
        limit: usize,
    ) -> Result<Vec<ScheduledNotification>> {
        let popped = self
            .kv
            .zpop_by_score(keys::NOTIFICATION_QUEUE, now, limit)?;
        Ok(popped
            .iter()
            .filter_map(|(raw, _)| match serde_json::from_str(raw) {
                Ok(n) => Some(n),
                Err(e) => {
                    tracing::error!(error = %e, "Dropping undecodable notification");
                    None
                }
            })
            .collect())
    }

    /// Every queued notification, earliest first.
    pub fn queued_notifications(&self) -> Result<Vec<ScheduledNotification>> {
        let entries = self
            .kv
            .zrange_by_score(keys::NOTIFICATION_QUEUE, i64::MIN, i64::MAX)?;
        let mut out = Vec::with_capacity(entries.len());
        for (raw, _) in entries {
            out.push(serde_json::from_str(&raw)?);
        }
        Ok(out)
    }

    pub fn notification_queue_len(&self) -> Result<usize> {
        self.kv.zcard(keys::NOTIFICATION_QUEUE)
    }

    /// The notification still open for coalescing for this contact, trigger
    /// and tier, if any.
    pub fn pending_notification(
        &self,
        contact_id: &str,
        trigger_id: &str,
        tier: ThrottleTier,
    ) -> Result<Option<PendingNotification>> {
        let key = keys::pending(contact_id, trigger_id, tier.as_str());
        let Some(raw) = self.kv.get(&key)? else {
            return Ok(None);
        };
        let notification = serde_json::from_str(&raw)?;
        Ok(Some(PendingNotification { raw, notification }))
    }

    /// Marks `raw` as the open notification for its contact, trigger and tier
    /// until `ttl` elapses.
    pub fn set_pending_notification(
        &self,
        n: &ScheduledNotification,
        raw: &str,
        ttl: Duration,
    ) -> Result<()> {
        let key = keys::pending(&n.contact.id, &n.trigger.id, n.tier.as_str());
        self.kv.set(&key, raw, Some(ttl))
    }

    pub fn clear_pending_notification(
        &self,
        contact_id: &str,
        trigger_id: &str,
        tier: ThrottleTier,
    ) -> Result<()> {
        self.kv
            .del(&keys::pending(contact_id, trigger_id, tier.as_str()))?;
        Ok(())
    }
}
