use regex::Regex;
use serde::{Deserialize, Serialize};

/// `[ingest]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_batch_capacity")]
    pub batch_capacity: usize,
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    #[serde(default = "default_parse_workers")]
    pub parse_workers: usize,
    #[serde(default = "default_match_workers")]
    pub match_workers: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_retention_s")]
    pub default_retention_s: i64,
    /// First matching regex decides a metric's retention.
    #[serde(default)]
    pub retentions: Vec<RetentionRule>,
    #[serde(default = "default_pattern_refresh_ms")]
    pub pattern_refresh_ms: u64,
    #[serde(default = "default_fallback_warn_threshold")]
    pub fallback_warn_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionRule {
    pub pattern: String,
    pub retention_s: i64,
}

fn default_batch_capacity() -> usize {
    10_000
}

fn default_batch_interval_ms() -> u64 {
    1000
}

fn default_parse_workers() -> usize {
    4
}

fn default_match_workers() -> usize {
    4
}

fn default_channel_capacity() -> usize {
    65_536
}

fn default_retention_s() -> i64 {
    60
}

fn default_pattern_refresh_ms() -> u64 {
    1000
}

fn default_fallback_warn_threshold() -> usize {
    1000
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_capacity: default_batch_capacity(),
            batch_interval_ms: default_batch_interval_ms(),
            parse_workers: default_parse_workers(),
            match_workers: default_match_workers(),
            channel_capacity: default_channel_capacity(),
            default_retention_s: default_retention_s(),
            retentions: Vec::new(),
            pattern_refresh_ms: default_pattern_refresh_ms(),
            fallback_warn_threshold: default_fallback_warn_threshold(),
        }
    }
}

/// Compiled retention rules.
#[derive(Debug, Clone)]
pub struct Retentions {
    rules: Vec<(Regex, i64)>,
    default_s: i64,
}

impl Retentions {
    pub fn new(config: &IngestConfig) -> Result<Self, regex::Error> {
        let mut rules = Vec::with_capacity(config.retentions.len());
        for rule in &config.retentions {
            rules.push((Regex::new(&rule.pattern)?, rule.retention_s.max(1)));
        }
        Ok(Self {
            rules,
            default_s: config.default_retention_s.max(1),
        })
    }

    pub fn for_metric(&self, metric: &str) -> i64 {
        self.rules
            .iter()
            .find(|(re, _)| re.is_match(metric))
            .map(|(_, r)| *r)
            .unwrap_or(self.default_s)
    }
}
