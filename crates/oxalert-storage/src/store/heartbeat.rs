use super::Database;
use crate::error::Result;
use crate::keys;

pub const FILTER: &str = "filter";
pub const CHECKER: &str = "checker";
pub const NOTIFIER: &str = "notifier";

impl Database {
    pub fn beat(&self, component: &str, ts: i64) -> Result<()> {
        self.kv.set(&keys::heartbeat(component), &ts.to_string(), None)
    }

    pub fn last_beat(&self, component: &str) -> Result<Option<i64>> {
        Ok(self
            .kv
            .get(&keys::heartbeat(component))?
            .and_then(|v| v.parse().ok()))
    }
}
