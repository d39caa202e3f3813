use super::Database;
use crate::error::Result;
use crate::keys;
use oxalert_common::types::Maintenance;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maintenance windows written by the control plane for one trigger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerMaintenance {
    #[serde(default)]
    pub trigger: Option<Maintenance>,
    #[serde(default)]
    pub metrics: BTreeMap<String, Maintenance>,
}

impl Database {
    pub fn get_maintenance(&self, trigger_id: &str) -> Result<TriggerMaintenance> {
        Ok(self
            .get_json(&keys::maintenance(trigger_id))?
            .unwrap_or_default())
    }

    pub fn set_trigger_maintenance(&self, trigger_id: &str, m: Option<Maintenance>) -> Result<()> {
        let mut record = self.get_maintenance(trigger_id)?;
        record.trigger = m;
        self.set_json(&keys::maintenance(trigger_id), &record)
    }

    pub fn set_metric_maintenance(
        &self,
        trigger_id: &str,
        metric: &str,
        m: Option<Maintenance>,
    ) -> Result<()> {
        let mut record = self.get_maintenance(trigger_id)?;
        match m {
            Some(m) => {
                record.metrics.insert(metric.to_string(), m);
            }
            None => {
                record.metrics.remove(metric);
            }
        }
        self.set_json(&keys::maintenance(trigger_id), &record)
    }
}
