use crate::config::RemoteConfig;
use crate::error::{CheckError, Result};
use async_trait::async_trait;
use oxalert_storage::Database;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const DEFAULT_STEP: i64 = 60;

/// One series on a fixed step grid. Missing points are `NaN`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricData {
    pub name: String,
    pub start: i64,
    /// Exclusive.
    pub stop: i64,
    pub step: i64,
    pub values: Vec<f64>,
    /// Placeholder for a target that resolved to no series.
    pub wildcard: bool,
}

impl MetricData {
    /// Empty placeholder covering `[from, until]`.
    pub fn wildcard(target: &str, from: i64, until: i64) -> Self {
        let (start, stop) = grid(from, until, DEFAULT_STEP, true);
        Self {
            name: target.to_string(),
            start,
            stop,
            step: DEFAULT_STEP,
            values: vec![f64::NAN; ((stop - start) / DEFAULT_STEP) as usize],
            wildcard: true,
        }
    }

    pub fn value_at(&self, ts: i64) -> f64 {
        if self.step <= 0 || ts < self.start || ts >= self.stop {
            return f64::NAN;
        }
        let idx = ((ts - self.start) / self.step) as usize;
        self.values.get(idx).copied().unwrap_or(f64::NAN)
    }

    pub fn timestamps(&self) -> impl Iterator<Item = i64> + '_ {
        (0..self.values.len()).map(move |i| self.start + i as i64 * self.step)
    }
}

fn grid(from: i64, until: i64, step: i64, allow_realtime: bool) -> (i64, i64) {
    let start = from - from.rem_euclid(step);
    let last = until - until.rem_euclid(step);
    let stop = if allow_realtime { last + step } else { last };
    (start, stop.max(start))
}

/// Result of resolving one target over a time range.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchResult {
    data: Vec<MetricData>,
    pattern_metrics: Vec<String>,
}

impl FetchResult {
    pub fn new(data: Vec<MetricData>, pattern_metrics: Vec<String>) -> Self {
        Self {
            data,
            pattern_metrics,
        }
    }

    pub fn metrics_data(&self) -> &[MetricData] {
        &self.data
    }

    /// Concrete metric names the target expanded to.
    pub fn pattern_metrics(&self) -> &[String] {
        &self.pattern_metrics
    }

    pub fn has_only_wildcards(&self) -> bool {
        self.data.iter().all(|d| d.wildcard)
    }

    /// Series backed by real metrics.
    pub fn series(&self) -> impl Iterator<Item = &MetricData> {
        self.data.iter().filter(|d| !d.wildcard)
    }
}

#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn fetch(
        &self,
        target: &str,
        from: i64,
        until: i64,
        allow_realtime: bool,
    ) -> Result<FetchResult>;

    fn is_configured(&self) -> bool;
}

/// Reads the samples the filter persisted.
pub struct LocalSource {
    db: Database,
}

impl LocalSource {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn load_series(
        &self,
        metric: &str,
        from: i64,
        until: i64,
        allow_realtime: bool,
    ) -> Result<MetricData> {
        let step = self
            .db
            .metric_retention(metric)?
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_STEP);
        let (start, stop) = grid(from, until, step, allow_realtime);
        let mut values = vec![f64::NAN; ((stop - start) / step) as usize];
        for (ts, value) in self.db.metric_values(metric, from, until)? {
            if ts < start || ts >= stop {
                continue;
            }
            let idx = ((ts - start) / step) as usize;
            if let Some(slot) = values.get_mut(idx) {
                *slot = value;
            }
        }
        Ok(MetricData {
            name: metric.to_string(),
            start,
            stop,
            step,
            values,
            wildcard: false,
        })
    }
}

#[async_trait]
impl MetricSource for LocalSource {
    async fn fetch(
        &self,
        target: &str,
        from: i64,
        until: i64,
        allow_realtime: bool,
    ) -> Result<FetchResult> {
        let pattern = target.trim();
        let metrics = self.db.pattern_metrics(pattern)?;
        if metrics.is_empty() {
            return Ok(FetchResult::new(
                vec![MetricData::wildcard(pattern, from, until)],
                Vec::new(),
            ));
        }
        let mut data = Vec::with_capacity(metrics.len());
        for metric in &metrics {
            data.push(self.load_series(metric, from, until, allow_realtime)?);
        }
        Ok(FetchResult::new(data, metrics))
    }

    fn is_configured(&self) -> bool {
        true
    }
}

#[derive(Debug, Deserialize)]
struct RenderSeries {
    target: String,
    datapoints: Vec<(Option<f64>, i64)>,
}

/// Graphite-compatible render API client.
pub struct RemoteSource {
    client: reqwest::Client,
    url: String,
    consecutive_failures: AtomicU64,
}

impl RemoteSource {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_s.max(1)))
            .build()
            .map_err(|e| CheckError::Source(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            consecutive_failures: AtomicU64::new(0),
        })
    }

    /// Fetch failures since the last success.
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    async fn render(&self, target: &str, from: i64, until: i64) -> Result<Vec<RenderSeries>> {
        let resp = self
            .client
            .get(format!("{}/render", self.url))
            .query(&[
                ("target", target.to_string()),
                ("from", from.to_string()),
                ("until", until.to_string()),
                ("format", "json".to_string()),
            ])
            .send()
            .await
            .map_err(|e| CheckError::Source(format!("remote request failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CheckError::Source(format!(
                "remote returned HTTP {}",
                status.as_u16()
            )));
        }
        resp.json::<Vec<RenderSeries>>()
            .await
            .map_err(|e| CheckError::Source(format!("invalid remote response: {e}")))
    }
}

fn series_from_render(series: RenderSeries) -> MetricData {
    let step = match series.datapoints.as_slice() {
        [(_, a), (_, b), ..] if b > a => b - a,
        _ => DEFAULT_STEP,
    };
    let start = series.datapoints.first().map(|(_, ts)| *ts).unwrap_or(0);
    let values: Vec<f64> = series
        .datapoints
        .iter()
        .map(|(v, _)| v.unwrap_or(f64::NAN))
        .collect();
    MetricData {
        name: series.target,
        start,
        stop: start + values.len() as i64 * step,
        step,
        values,
        wildcard: false,
    }
}

#[async_trait]
impl MetricSource for RemoteSource {
    async fn fetch(
        &self,
        target: &str,
        from: i64,
        until: i64,
        _allow_realtime: bool,
    ) -> Result<FetchResult> {
        if !self.is_configured() {
            return Err(CheckError::RemoteNotConfigured);
        }
        match self.render(target, from, until).await {
            Ok(series) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                if series.is_empty() {
                    return Ok(FetchResult::new(
                        vec![MetricData::wildcard(target, from, until)],
                        Vec::new(),
                    ));
                }
                let data: Vec<MetricData> = series.into_iter().map(series_from_render).collect();
                let names = data.iter().map(|d| d.name.clone()).collect();
                Ok(FetchResult::new(data, names))
            }
            Err(e) => {
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn is_configured(&self) -> bool {
        !self.url.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_series_infers_step() {
        let data = series_from_render(RenderSeries {
            target: "a.b".into(),
            datapoints: vec![(Some(1.0), 120), (None, 180), (Some(3.0), 240)],
        });
        assert_eq!(data.step, 60);
        assert_eq!(data.start, 120);
        assert_eq!(data.stop, 300);
        assert_eq!(data.value_at(240), 3.0);
        assert!(data.value_at(180).is_nan());
        assert!(data.value_at(300).is_nan());
    }

    #[test]
    fn grid_excludes_current_bucket_without_realtime() {
        assert_eq!(grid(65, 250, 60, true), (60, 300));
        assert_eq!(grid(65, 250, 60, false), (60, 240));
    }

    #[test]
    fn unconfigured_remote_reports_it() {
        let source = RemoteSource::new(&RemoteConfig::default()).unwrap();
        assert!(!source.is_configured());
        assert_eq!(source.consecutive_failures(), 0);
    }
}
