use super::Database;
use crate::error::Result;
use crate::keys;
use oxalert_common::types::SelfState;

impl Database {
    /// The self-state record and its stored form; a missing record reads as
    /// the default (OK, auto).
    pub fn get_self_state(&self) -> Result<(Option<String>, SelfState)> {
        match self.kv.get(keys::SELF_STATE)? {
            Some(raw) => {
                let state = serde_json::from_str(&raw)?;
                Ok((Some(raw), state))
            }
            None => Ok((None, SelfState::default())),
        }
    }

    /// Writes `state` only if the stored form still equals `expected`.
    pub fn cas_self_state(&self, expected: Option<&str>, state: &SelfState) -> Result<bool> {
        let raw = serde_json::to_string(state)?;
        self.kv
            .compare_and_set(keys::SELF_STATE, expected, &raw, None)
    }
}
