use super::Database;
use crate::error::Result;
use crate::keys;
use oxalert_common::types::Trigger;

impl Database {
    pub fn get_trigger(&self, id: &str) -> Result<Option<Trigger>> {
        self.get_json(&keys::trigger(id))
    }

    /// Loads the triggers that still exist, in the order of `ids`.
    pub fn get_triggers(&self, ids: &[String]) -> Result<Vec<Trigger>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(t) = self.get_trigger(id)? {
                out.push(t);
            }
        }
        Ok(out)
    }

    /// Stores a trigger and updates the trigger and pattern indexes.
    ///
    /// Patterns no longer referenced by any trigger are dropped together with
    /// their metric index.
    pub fn save_trigger(&self, trigger: &Trigger) -> Result<()> {
        let previous = self.get_trigger(&trigger.id)?;
        self.set_json(&keys::trigger(&trigger.id), trigger)?;

        let id = vec![trigger.id.clone()];
        self.kv.srem(keys::trigger_index(!trigger.is_remote), &id)?;
        self.kv.sadd(keys::trigger_index(trigger.is_remote), &id)?;

        let patterns = trigger.patterns();
        for pattern in &patterns {
            self.kv.sadd(&keys::pattern_triggers(pattern), &id)?;
        }
        self.kv.sadd(keys::PATTERNS, &patterns)?;

        if let Some(prev) = previous {
            let stale: Vec<String> = prev
                .patterns()
                .into_iter()
                .filter(|p| !patterns.contains(p))
                .collect();
            self.unlink_patterns(&trigger.id, &stale)?;
        }
        tracing::debug!(trigger_id = %trigger.id, patterns = patterns.len(), "Saved trigger");
        Ok(())
    }

    /// Removes a trigger with its check data, maintenance and index entries.
    pub fn remove_trigger(&self, id: &str) -> Result<bool> {
        let Some(trigger) = self.get_trigger(id)? else {
            return Ok(false);
        };
        let ids = vec![id.to_string()];
        self.kv.srem(keys::TRIGGERS_LOCAL, &ids)?;
        self.kv.srem(keys::TRIGGERS_REMOTE, &ids)?;
        self.unlink_patterns(id, &trigger.patterns())?;
        self.kv.del(&keys::check_data(id))?;
        self.kv.del(&keys::maintenance(id))?;
        self.kv.del(&keys::trigger(id))?;
        tracing::info!(trigger_id = %id, "Removed trigger");
        Ok(true)
    }

    fn unlink_patterns(&self, trigger_id: &str, patterns: &[String]) -> Result<()> {
        let id = vec![trigger_id.to_string()];
        for pattern in patterns {
            self.kv.srem(&keys::pattern_triggers(pattern), &id)?;
            if self.pattern_ref_count(pattern)? == 0 {
                self.remove_pattern(pattern)?;
            }
        }
        Ok(())
    }

    /// Ids of local (`remote == false`) or remote triggers.
    pub fn trigger_ids(&self, remote: bool) -> Result<Vec<String>> {
        self.kv.smembers(keys::trigger_index(remote))
    }

    /// Ids of triggers referencing any of `patterns`, deduplicated.
    pub fn triggers_by_patterns(&self, patterns: &[String]) -> Result<Vec<String>> {
        let mut out = std::collections::BTreeSet::new();
        for pattern in patterns {
            out.extend(self.kv.smembers(&keys::pattern_triggers(pattern))?);
        }
        Ok(out.into_iter().collect())
    }

    pub fn mark_triggers_to_check(&self, remote: bool, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.kv.sadd(&keys::triggers_to_check(remote), ids)?;
        Ok(())
    }

    pub fn take_triggers_to_check(&self, remote: bool) -> Result<Vec<String>> {
        self.kv.spop_all(&keys::triggers_to_check(remote))
    }
}
