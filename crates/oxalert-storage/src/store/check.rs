use super::Database;
use crate::error::Result;
use crate::keys;
use oxalert_common::types::CheckData;

impl Database {
    pub fn get_check_data(&self, trigger_id: &str) -> Result<Option<CheckData>> {
        self.get_json(&keys::check_data(trigger_id))
    }

    pub fn save_check_data(&self, trigger_id: &str, data: &CheckData) -> Result<()> {
        self.set_json(&keys::check_data(trigger_id), data)
    }

    pub fn remove_check_data(&self, trigger_id: &str) -> Result<()> {
        self.kv.del(&keys::check_data(trigger_id))?;
        Ok(())
    }
}
