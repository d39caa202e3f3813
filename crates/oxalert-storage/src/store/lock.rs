use super::Database;
use crate::error::Result;
use crate::keys;
use std::time::Duration;

impl Database {
    /// Takes the advisory check lock of a trigger. `token` identifies the
    /// holder so that a lock that expired and was re-taken is not released
    /// by the previous holder.
    pub fn acquire_trigger_lock(&self, trigger_id: &str, token: &str, ttl: Duration) -> Result<bool> {
        self.kv.set_nx(&keys::trigger_lock(trigger_id), token, Some(ttl))
    }

    pub fn release_trigger_lock(&self, trigger_id: &str, token: &str) -> Result<bool> {
        self.kv
            .compare_and_delete(&keys::trigger_lock(trigger_id), token)
    }
}
