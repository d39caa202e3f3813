use super::Database;
use crate::error::Result;
use crate::keys;
use serde::{Deserialize, Serialize};

/// A persisted metric sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub timestamp: i64,
    /// Step of the series in seconds.
    pub retention: i64,
}

fn encode_member(ts: i64, value: f64) -> String {
    format!("{ts} {value}")
}

fn decode_member(member: &str, score: i64) -> Option<(i64, f64)> {
    let (_, value) = member.split_once(' ')?;
    value.parse::<f64>().ok().map(|v| (score, v))
}

impl Database {
    /// Writes samples, replacing any value at the same timestamp, and records
    /// each metric's retention.
    pub fn save_metrics(&self, samples: &[MetricSample]) -> Result<()> {
        for sample in samples {
            let key = keys::metric_data(&sample.name);
            self.kv
                .zrem_range_by_score(&key, sample.timestamp, sample.timestamp)?;
            self.kv.zadd(
                &key,
                sample.timestamp,
                &encode_member(sample.timestamp, sample.value),
            )?;
            self.kv.set(
                &keys::metric_retention(&sample.name),
                &sample.retention.to_string(),
                None,
            )?;
        }
        Ok(())
    }

    /// `(timestamp, value)` pairs in `[from, until]`, oldest first.
    pub fn metric_values(&self, metric: &str, from: i64, until: i64) -> Result<Vec<(i64, f64)>> {
        let entries = self
            .kv
            .zrange_by_score(&keys::metric_data(metric), from, until)?;
        Ok(entries
            .iter()
            .filter_map(|(member, score)| decode_member(member, *score))
            .collect())
    }

    pub fn metric_retention(&self, metric: &str) -> Result<Option<i64>> {
        Ok(self
            .kv
            .get(&keys::metric_retention(metric))?
            .and_then(|v| v.parse().ok()))
    }

    /// Removes samples with timestamps up to and including `until`.
    pub fn trim_metric_values(&self, metric: &str, until: i64) -> Result<usize> {
        self.kv
            .zrem_range_by_score(&keys::metric_data(metric), i64::MIN, until)
    }

    pub fn remove_metric(&self, metric: &str) -> Result<()> {
        self.kv.del(&keys::metric_data(metric))?;
        self.kv.del(&keys::metric_retention(metric))?;
        Ok(())
    }
}
