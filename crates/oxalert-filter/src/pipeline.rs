use crate::config::{IngestConfig, Retentions};
use crate::error::{FilterError, Result};
use crate::index::PatternMatcher;
use crate::parser::{self, ParsedMetric};
use oxalert_common::metrics::CoreMetrics;
use oxalert_storage::store::heartbeat;
use oxalert_storage::store::MetricSample;
use oxalert_storage::Database;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

const SAVE_BACKOFF_BASE: Duration = Duration::from_millis(100);
const SAVE_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// A sample that matched at least one pattern, ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedSample {
    /// Canonical series name.
    pub metric: String,
    pub value: f64,
    /// Timestamp aligned down to the retention step.
    pub timestamp: i64,
    pub retention: i64,
    pub patterns: Vec<String>,
}

/// Sender side of the pipeline. Cloned into every connection handler.
///
/// [`ingest`](IngestHandle::ingest) waits when the pipeline is saturated so
/// that a slow store slows the producers down instead of losing samples.
#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<Vec<u8>>,
}

impl IngestHandle {
    pub async fn ingest(&self, line: Vec<u8>) -> Result<()> {
        self.tx.send(line).await.map_err(|_| FilterError::Closed)
    }
}

/// Background tasks of a running pipeline. They exit once every
/// [`IngestHandle`] is dropped and the last batch has been saved.
pub struct PipelineTasks {
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineTasks {
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Filter task panicked");
            }
        }
    }
}

/// Matches one parsed metric against the current snapshot.
pub fn match_metric(
    matcher: &PatternMatcher,
    retentions: &Retentions,
    metric: ParsedMetric,
) -> Option<MatchedSample> {
    let patterns = matcher.load().match_metric(&metric);
    if patterns.is_empty() {
        return None;
    }
    let retention = retentions.for_metric(&metric.name);
    Some(MatchedSample {
        timestamp: metric.timestamp - metric.timestamp.rem_euclid(retention),
        metric: metric.name,
        value: metric.value,
        retention,
        patterns,
    })
}

/// Collects matched samples keyed by `(metric, timestamp)`; a later sample
/// for the same key replaces the earlier one.
#[derive(Debug, Default)]
pub struct Batch {
    samples: HashMap<(String, i64), MatchedSample>,
}

impl Batch {
    pub fn push(&mut self, sample: MatchedSample) {
        self.samples
            .insert((sample.metric.clone(), sample.timestamp), sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn take(&mut self) -> Vec<MatchedSample> {
        let mut out: Vec<MatchedSample> = self.samples.drain().map(|(_, v)| v).collect();
        out.sort_by(|a, b| (&a.metric, a.timestamp).cmp(&(&b.metric, b.timestamp)));
        out
    }
}

/// Persists a batch: samples and retentions, the pattern to metric index, and
/// the triggers-to-check set. Returns the number of samples written.
pub fn save_batch(db: &Database, batch: &[MatchedSample], now: i64) -> oxalert_storage::Result<usize> {
    if batch.is_empty() {
        return Ok(0);
    }
    let samples: Vec<MetricSample> = batch
        .iter()
        .map(|s| MetricSample {
            name: s.metric.clone(),
            value: s.value,
            timestamp: s.timestamp,
            retention: s.retention,
        })
        .collect();
    db.save_metrics(&samples)?;

    let mut by_pattern: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    for s in batch {
        for p in &s.patterns {
            by_pattern.entry(p).or_default().insert(s.metric.clone());
        }
    }
    for (pattern, metrics) in &by_pattern {
        let metrics: Vec<String> = metrics.iter().cloned().collect();
        db.add_pattern_metrics(pattern, &metrics)?;
    }

    let patterns: Vec<String> = by_pattern.keys().map(|p| p.to_string()).collect();
    let local: BTreeSet<String> = db.trigger_ids(false)?.into_iter().collect();
    let due: Vec<String> = db
        .triggers_by_patterns(&patterns)?
        .into_iter()
        .filter(|id| local.contains(id))
        .collect();
    db.mark_triggers_to_check(false, &due)?;
    db.beat(heartbeat::FILTER, now)?;
    Ok(samples.len())
}

async fn save_with_retry(db: &Database, batch: Vec<MatchedSample>, metrics: &CoreMetrics) {
    let mut delay = SAVE_BACKOFF_BASE;
    let mut attempt = 0u32;
    loop {
        let now = oxalert_common::now_ts();
        match save_batch(db, &batch, now) {
            Ok(saved) => {
                metrics.metrics_saved.add(saved as u64);
                if attempt > 0 {
                    tracing::info!(attempt, samples = saved, "Batch saved after retry");
                }
                return;
            }
            Err(e) => {
                attempt += 1;
                metrics.batch_save_failures.inc();
                let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 10);
                tracing::warn!(
                    attempt,
                    samples = batch.len(),
                    retry_in_ms = delay.as_millis() as u64 + jitter_ms,
                    error = %e,
                    "Failed to save metric batch"
                );
                tokio::time::sleep(delay + Duration::from_millis(jitter_ms)).await;
                delay = (delay * 2).min(SAVE_BACKOFF_CAP);
            }
        }
    }
}

/// Starts parse workers, match workers, the batcher and the saver.
pub fn spawn(
    config: &IngestConfig,
    db: Database,
    matcher: Arc<PatternMatcher>,
    retentions: Retentions,
    metrics: Arc<CoreMetrics>,
) -> (IngestHandle, PipelineTasks) {
    let capacity = config.channel_capacity.max(1);
    let (line_tx, line_rx) = mpsc::channel::<Vec<u8>>(capacity);
    let (parsed_tx, parsed_rx) = mpsc::channel::<ParsedMetric>(capacity);
    let (matched_tx, mut matched_rx) = mpsc::channel::<MatchedSample>(capacity);
    let (batch_tx, mut batch_rx) = mpsc::channel::<Vec<MatchedSample>>(2);

    let mut tasks = Vec::new();

    let line_rx = Arc::new(Mutex::new(line_rx));
    for worker in 0..config.parse_workers.max(1) {
        let rx = line_rx.clone();
        let tx = parsed_tx.clone();
        let metrics = metrics.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let Some(line) = rx.lock().await.recv().await else {
                    break;
                };
                metrics.metrics_received.inc();
                match parser::parse_line(&line) {
                    Ok(parsed) => {
                        metrics.metrics_valid.inc();
                        if tx.send(parsed).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        metrics.metrics_invalid.inc();
                        tracing::debug!(error = %e, "Dropping metric line");
                    }
                }
            }
            tracing::debug!(worker, "Parse worker stopped");
        }));
    }
    drop(parsed_tx);

    let parsed_rx = Arc::new(Mutex::new(parsed_rx));
    let retentions = Arc::new(retentions);
    for worker in 0..config.match_workers.max(1) {
        let rx = parsed_rx.clone();
        let tx = matched_tx.clone();
        let matcher = matcher.clone();
        let retentions = retentions.clone();
        let metrics = metrics.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let Some(parsed) = rx.lock().await.recv().await else {
                    break;
                };
                if let Some(sample) = match_metric(&matcher, &retentions, parsed) {
                    metrics.metrics_matched.inc();
                    if tx.send(sample).await.is_err() {
                        break;
                    }
                }
            }
            tracing::debug!(worker, "Match worker stopped");
        }));
    }
    drop(matched_tx);

    let capacity = config.batch_capacity.max(1);
    let flush_every = Duration::from_millis(config.batch_interval_ms.max(1));
    tasks.push(tokio::spawn(async move {
        let mut batch = Batch::default();
        let mut tick = interval(flush_every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                sample = matched_rx.recv() => match sample {
                    Some(sample) => {
                        batch.push(sample);
                        if batch.len() >= capacity && batch_tx.send(batch.take()).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        if !batch.is_empty() {
                            let _ = batch_tx.send(batch.take()).await;
                        }
                        break;
                    }
                },
                _ = tick.tick() => {
                    if !batch.is_empty() && batch_tx.send(batch.take()).await.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Batcher stopped");
    }));

    tasks.push(tokio::spawn(async move {
        while let Some(batch) = batch_rx.recv().await {
            save_with_retry(&db, batch, &metrics).await;
        }
        tracing::info!("Filter saver stopped");
    }));

    (IngestHandle { tx: line_tx }, PipelineTasks { tasks })
}
