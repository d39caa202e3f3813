use super::Database;
use crate::error::Result;
use crate::keys;

impl Database {
    /// Every pattern referenced by at least one trigger.
    pub fn patterns(&self) -> Result<Vec<String>> {
        self.kv.smembers(keys::PATTERNS)
    }

    /// Number of triggers referencing `pattern`, derived from the index.
    pub fn pattern_ref_count(&self, pattern: &str) -> Result<usize> {
        Ok(self.kv.smembers(&keys::pattern_triggers(pattern))?.len())
    }

    pub fn pattern_metrics(&self, pattern: &str) -> Result<Vec<String>> {
        self.kv.smembers(&keys::pattern_metrics(pattern))
    }

    pub fn add_pattern_metrics(&self, pattern: &str, metrics: &[String]) -> Result<()> {
        if metrics.is_empty() {
            return Ok(());
        }
        self.kv.sadd(&keys::pattern_metrics(pattern), metrics)?;
        Ok(())
    }

    pub fn remove_pattern_metrics(&self, pattern: &str, metrics: &[String]) -> Result<()> {
        self.kv.srem(&keys::pattern_metrics(pattern), metrics)?;
        Ok(())
    }

    /// Drops a pattern that no trigger references any more.
    pub fn remove_pattern(&self, pattern: &str) -> Result<()> {
        self.kv.srem(keys::PATTERNS, &[pattern.to_string()])?;
        self.kv.del(&keys::pattern_metrics(pattern))?;
        self.kv.del(&keys::pattern_triggers(pattern))?;
        tracing::debug!(pattern = %pattern, "Removed unreferenced pattern");
        Ok(())
    }
}
