use super::Database;
use crate::error::Result;
use crate::keys;
use oxalert_common::types::Subscription;
use std::collections::BTreeSet;

impl Database {
    pub fn get_subscription(&self, id: &str) -> Result<Option<Subscription>> {
        self.get_json(&keys::subscription(id))
    }

    pub fn save_subscription(&self, sub: &Subscription) -> Result<()> {
        if let Some(prev) = self.get_subscription(&sub.id)? {
            self.unindex_subscription(&prev)?;
        }
        self.set_json(&keys::subscription(&sub.id), sub)?;
        let id = vec![sub.id.clone()];
        if sub.any_tags {
            self.kv.sadd(keys::ANY_TAG_SUBSCRIPTIONS, &id)?;
        }
        for tag in &sub.tags {
            self.kv.sadd(&keys::tag_subscriptions(tag), &id)?;
        }
        Ok(())
    }

    pub fn remove_subscription(&self, id: &str) -> Result<bool> {
        let Some(sub) = self.get_subscription(id)? else {
            return Ok(false);
        };
        self.unindex_subscription(&sub)?;
        self.kv.del(&keys::subscription(id))?;
        Ok(true)
    }

    fn unindex_subscription(&self, sub: &Subscription) -> Result<()> {
        let id = vec![sub.id.clone()];
        self.kv.srem(keys::ANY_TAG_SUBSCRIPTIONS, &id)?;
        for tag in &sub.tags {
            self.kv.srem(&keys::tag_subscriptions(tag), &id)?;
        }
        Ok(())
    }

    /// Candidate subscriptions for a trigger carrying `tags`: every
    /// subscription indexed under one of the tags plus the any-tag ones.
    /// Tag containment is not checked here.
    pub fn subscriptions_for_tags(&self, tags: &[String]) -> Result<Vec<Subscription>> {
        let mut ids: BTreeSet<String> = self
            .kv
            .smembers(keys::ANY_TAG_SUBSCRIPTIONS)?
            .into_iter()
            .collect();
        for tag in tags {
            ids.extend(self.kv.smembers(&keys::tag_subscriptions(tag))?);
        }
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(sub) = self.get_subscription(&id)? {
                out.push(sub);
            }
        }
        Ok(out)
    }
}
