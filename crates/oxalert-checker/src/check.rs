use crate::config::CheckerConfig;
use crate::error::{CheckError, Result};
use crate::expression::{Env, Expression};
use crate::source::{FetchResult, MetricData, MetricSource};
use oxalert_common::metrics::CoreMetrics;
use oxalert_common::types::{
    CheckData, EventInfo, Maintenance, MaintenanceInfo, MetricState, NotificationEvent, State,
    Trigger, TriggerType,
};
use oxalert_storage::store::heartbeat;
use oxalert_storage::store::TriggerMaintenance;
use oxalert_storage::Database;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

const FETCH_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Result of one trigger check.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub trigger: Trigger,
    pub check: CheckData,
    pub events: Vec<NotificationEvent>,
}

/// Why a check could not produce per-metric states.
#[derive(Debug, Clone, PartialEq)]
enum Failure {
    /// The primary target has never resolved to a real series.
    OnlyWildcards,
    Exception(String),
}

/// What applying a new state to a tracked entity produced.
#[derive(Debug, Clone, PartialEq)]
enum Step {
    Silent,
    Suppressed,
    Emit { old: State, info: Option<EventInfo> },
}

/// Mutable view over the state-tracking fields shared by metric and trigger
/// check data.
struct Cursor<'a> {
    state: &'a mut State,
    event_timestamp: &'a mut i64,
    suppressed: &'a mut bool,
    suppressed_state: &'a mut Option<State>,
}

impl<'a> Cursor<'a> {
    fn metric(ms: &'a mut MetricState) -> Self {
        Self {
            state: &mut ms.state,
            event_timestamp: &mut ms.event_timestamp,
            suppressed: &mut ms.suppressed,
            suppressed_state: &mut ms.suppressed_state,
        }
    }

    fn trigger(data: &'a mut CheckData) -> Self {
        Self {
            state: &mut data.state,
            event_timestamp: &mut data.event_timestamp,
            suppressed: &mut data.suppressed,
            suppressed_state: &mut data.suppressed_state,
        }
    }

    /// Applies `candidate` observed at `ts`.
    ///
    /// While suppressed, `suppressed_state` holds the last state subscribers
    /// were told about. When suppression ends the pending difference, if
    /// any, is emitted once with `end_info`.
    fn advance(
        &mut self,
        candidate: State,
        ts: i64,
        suppress: bool,
        reminder_interval_s: i64,
        end_info: Option<&MaintenanceInfo>,
    ) -> Step {
        if *self.suppressed && !suppress {
            let told = self.suppressed_state.take().unwrap_or(*self.state);
            *self.suppressed = false;
            let changed = *self.state != candidate;
            *self.state = candidate;
            if told != candidate {
                *self.event_timestamp = ts;
                return Step::Emit {
                    old: told,
                    info: end_info.map(|info| EventInfo::MaintenanceEnd { info: info.clone() }),
                };
            }
            if changed {
                *self.event_timestamp = ts;
            }
            return Step::Silent;
        }

        let changed = candidate != *self.state;
        let remind = !changed
            && candidate.is_remindable()
            && *self.event_timestamp > 0
            && ts - *self.event_timestamp >= reminder_interval_s;
        if !changed && !remind {
            return Step::Silent;
        }

        if suppress {
            if !*self.suppressed {
                *self.suppressed = true;
                *self.suppressed_state = Some(*self.state);
            }
            if changed {
                *self.state = candidate;
                *self.event_timestamp = ts;
            }
            return Step::Suppressed;
        }

        let old = *self.state;
        *self.state = candidate;
        *self.event_timestamp = ts;
        Step::Emit {
            old,
            info: remind.then_some(EventInfo::Reminder {
                interval_s: reminder_interval_s,
            }),
        }
    }
}

/// Removes the advisory lock on every exit path, including unwinding.
struct LockGuard<'a> {
    db: &'a Database,
    trigger_id: &'a str,
    token: String,
}

impl<'a> LockGuard<'a> {
    fn acquire(db: &'a Database, trigger_id: &'a str, ttl: Duration) -> Result<Option<Self>> {
        let token = format!("{}:{:016x}", std::process::id(), rand::random::<u64>());
        if !db.acquire_trigger_lock(trigger_id, &token, ttl)? {
            return Ok(None);
        }
        Ok(Some(Self {
            db,
            trigger_id,
            token,
        }))
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        match self.db.release_trigger_lock(self.trigger_id, &self.token) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(trigger_id = %self.trigger_id, "Trigger lock expired before release");
            }
            Err(e) => {
                tracing::warn!(trigger_id = %self.trigger_id, error = %e, "Failed to release trigger lock");
            }
        }
    }
}

/// Evaluates triggers against their metric windows.
pub struct TriggerChecker {
    db: Database,
    local: Arc<dyn MetricSource>,
    remote: Option<Arc<dyn MetricSource>>,
    config: CheckerConfig,
    metrics: Arc<CoreMetrics>,
}

impl TriggerChecker {
    pub fn new(
        db: Database,
        local: Arc<dyn MetricSource>,
        remote: Option<Arc<dyn MetricSource>>,
        config: CheckerConfig,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        Self {
            db,
            local,
            remote,
            config,
            metrics,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &CoreMetrics {
        &self.metrics
    }

    /// True when triggers of the partition can be evaluated at all.
    pub fn has_source(&self, remote: bool) -> bool {
        if remote {
            self.remote.as_ref().is_some_and(|r| r.is_configured())
        } else {
            self.local.is_configured()
        }
    }

    /// Checks one trigger at `now`: evaluates it, persists the new check
    /// data and pushes the emitted events to the event FIFO.
    pub async fn check(&self, trigger_id: &str, now: i64) -> Result<CheckOutcome> {
        let ttl = Duration::from_secs(self.config.lock_ttl_s.max(1));
        let Some(_lock) = LockGuard::acquire(&self.db, trigger_id, ttl)? else {
            self.metrics.checks_skipped_locked.inc();
            return Err(CheckError::Locked(trigger_id.to_string()));
        };
        let started = Instant::now();

        let trigger = self
            .db
            .get_trigger(trigger_id)?
            .ok_or_else(|| CheckError::TriggerNotFound(trigger_id.to_string()))?;
        let mut data = self.db.get_check_data(trigger_id)?.unwrap_or_default();
        let maintenance = self.db.get_maintenance(trigger_id)?;

        let fetched = self.fetch_targets(&trigger, now).await;
        if fetched.is_err() {
            if trigger.is_remote {
                self.metrics.check_errors_remote.inc();
            } else {
                self.metrics.check_errors_local.inc();
            }
        }

        let mut suppressed = 0u64;
        let evaluated = fetched.map_err(|e| Failure::Exception(e.to_string())).and_then(|fetched| {
            let mut next = data.clone();
            let result = catch_unwind(AssertUnwindSafe(|| {
                self.evaluate(&trigger, &mut next, &maintenance, &fetched, now, &mut suppressed)
            }));
            match result {
                Ok(Ok(events)) => Ok((next, events, fetched)),
                Ok(Err(f)) => Err(f),
                Err(panic) => {
                    self.metrics.worker_panics.inc();
                    Err(Failure::Exception(format!(
                        "evaluation panicked: {}",
                        panic_message(panic.as_ref())
                    )))
                }
            }
        });

        let mut events = Vec::new();
        let mut read_metrics = Vec::new();
        let (target_state, message) = match evaluated {
            Ok((next, metric_events, fetched)) => {
                data = next;
                events = metric_events;
                read_metrics = fetched
                    .iter()
                    .flat_map(|f| f.pattern_metrics().iter().cloned())
                    .collect();
                (data.worst_metric_state(), None)
            }
            Err(Failure::OnlyWildcards) => (
                State::Nodata,
                Some("Trigger has only wildcard targets and never received metrics".to_string()),
            ),
            Err(Failure::Exception(msg)) => {
                tracing::warn!(trigger_id = %trigger.id, error = %msg, "Trigger check failed");
                (State::Exception, Some(msg))
            }
        };

        data.maintenance = maintenance.trigger.clone();
        let suppress = suppressed_at(&trigger, data.maintenance.as_ref(), now);
        let end_info = data.maintenance.as_ref().map(|m| m.info.clone());
        let step = Cursor::trigger(&mut data).advance(
            target_state,
            now,
            suppress,
            self.config.reminder_interval_s,
            end_info.as_ref(),
        );
        match step {
            Step::Emit { old, info } if events.is_empty() => events.push(NotificationEvent {
                trigger_id: trigger.id.clone(),
                metric: String::new(),
                value: None,
                values: BTreeMap::new(),
                timestamp: now,
                old_state: old,
                state: target_state,
                message: message.clone(),
                is_trigger_event: true,
                sub_id: None,
                info,
                dispatch_failed: false,
            }),
            Step::Suppressed => suppressed += 1,
            _ => {}
        }

        data.message = message;
        data.timestamp = now;
        if target_state != State::Exception {
            data.last_successful_check = now;
        }
        data.score = data.compute_score();

        self.db.save_check_data(&trigger.id, &data)?;
        self.db.push_events(&events)?;
        self.db.beat(heartbeat::CHECKER, now)?;

        if !trigger.is_remote && self.config.metrics_ttl_s > 0 {
            let cutoff = now - self.config.metrics_ttl_s;
            for metric in &read_metrics {
                if let Err(e) = self.db.trim_metric_values(metric, cutoff) {
                    tracing::warn!(metric = %metric, error = %e, "Failed to trim metric values");
                }
            }
        }

        let elapsed = started.elapsed();
        self.metrics.checks_total.inc();
        self.metrics.check_duration.observe(elapsed);
        self.metrics.events_emitted.add(events.len() as u64);
        self.metrics.events_suppressed.add(suppressed);
        tracing::debug!(
            trigger_id = %trigger.id,
            state = %data.state,
            metrics = data.metrics.len(),
            events = events.len(),
            elapsed_us = elapsed.as_micros() as u64,
            "Trigger checked"
        );

        Ok(CheckOutcome {
            trigger,
            check: data,
            events,
        })
    }

    async fn fetch_targets(&self, trigger: &Trigger, now: i64) -> Result<Vec<FetchResult>> {
        let source: &dyn MetricSource = if trigger.is_remote {
            match &self.remote {
                Some(remote) if remote.is_configured() => &**remote,
                _ => return Err(CheckError::RemoteNotConfigured),
            }
        } else {
            &*self.local
        };
        let from = now - trigger.ttl.max(self.config.window_pad_s);
        let mut out = Vec::with_capacity(trigger.targets.len());
        for target in &trigger.targets {
            out.push(self.fetch_with_retry(source, target, from, now).await?);
        }
        Ok(out)
    }

    async fn fetch_with_retry(
        &self,
        source: &dyn MetricSource,
        target: &str,
        from: i64,
        until: i64,
    ) -> Result<FetchResult> {
        let attempts = self.config.fetch_retries.max(1);
        let mut delay = FETCH_BACKOFF_BASE;
        let mut attempt = 1;
        loop {
            match source.fetch(target, from, until, true).await {
                Ok(result) => return Ok(result),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    tracing::warn!(metric_target = %target, attempt, error = %e, "Metric fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
            }
        }
    }

    /// Computes per-metric states into `data` and returns the metric events.
    fn evaluate(
        &self,
        trigger: &Trigger,
        data: &mut CheckData,
        maintenance: &TriggerMaintenance,
        fetched: &[FetchResult],
        now: i64,
        suppressed: &mut u64,
    ) -> std::result::Result<Vec<NotificationEvent>, Failure> {
        let expression = match trigger.trigger_type {
            TriggerType::Expression => Some(
                Expression::parse(trigger.expression.as_deref().unwrap_or_default())
                    .map_err(|e| Failure::Exception(format!("Invalid expression: {e}")))?,
            ),
            _ => None,
        };

        let Some((primary, secondary)) = fetched.split_first() else {
            return Err(Failure::Exception("Trigger has no targets".to_string()));
        };
        if primary.has_only_wildcards() && data.metrics.is_empty() {
            return Err(Failure::OnlyWildcards);
        }
        let mut others: Vec<Option<&MetricData>> = Vec::with_capacity(secondary.len());
        for (i, result) in secondary.iter().enumerate() {
            let count = result.series().count();
            if count > 1 {
                return Err(Failure::Exception(format!(
                    "Target t{} resolved to {count} series, secondary targets must resolve to one",
                    i + 2
                )));
            }
            others.push(result.series().next());
        }

        let series: HashMap<&str, &MetricData> =
            primary.series().map(|s| (s.name.as_str(), s)).collect();
        let names: BTreeSet<String> = series
            .keys()
            .map(|n| n.to_string())
            .chain(data.metrics.keys().cloned())
            .collect();

        let reminder = self.config.reminder_interval_s;
        let mut events = Vec::new();
        for name in names {
            let existing = data.metrics.remove(&name);
            let is_new = existing.is_none();
            let mut ms = existing.unwrap_or_else(|| MetricState::new_metric(0));

            let tuples: Vec<(i64, BTreeMap<String, f64>)> = series
                .get(name.as_str())
                .map(|s| complete_tuples(s, &others, ms.timestamp))
                .unwrap_or_default();
            if is_new && tuples.is_empty() {
                continue;
            }

            let previous = ms.maintenance.take();
            ms.maintenance = Maintenance::later(maintenance.metrics.get(&name), maintenance.trigger.as_ref()).cloned();
            let end_info = previous
                .as_ref()
                .or(ms.maintenance.as_ref())
                .map(|m| m.info.clone());
            let window = ms.maintenance.clone();

            let mut muted = is_new && trigger.mute_new_metrics;
            for (ts, values) in tuples {
                let candidate = state_for(trigger, expression.as_ref(), &values, ms.state)
                    .map_err(|e| Failure::Exception(format!("{name}: {e}")))?;
                ms.value = values.get("t1").copied();
                ms.values = values;
                ms.timestamp = ts;
                if muted {
                    ms.state = candidate;
                    ms.event_timestamp = ts;
                    muted = false;
                    continue;
                }
                let step = Cursor::metric(&mut ms).advance(
                    candidate,
                    ts,
                    suppressed_at(trigger, window.as_ref(), ts),
                    reminder,
                    end_info.as_ref(),
                );
                record_step(step, &trigger.id, &name, &ms, ts, &mut events, suppressed);
            }

            if trigger.ttl > 0 && now - ms.timestamp > trigger.ttl {
                match trigger.ttl_state.to_state() {
                    None => {
                        tracing::debug!(trigger_id = %trigger.id, metric = %name, "Removing silent metric");
                        continue;
                    }
                    Some(ttl_state) => {
                        let step = Cursor::metric(&mut ms).advance(
                            ttl_state,
                            now,
                            suppressed_at(trigger, window.as_ref(), now),
                            reminder,
                            end_info.as_ref(),
                        );
                        record_ttl_step(step, &trigger.id, &name, &ms, now, &mut events, suppressed);
                    }
                }
            }

            if ms.suppressed && !suppressed_at(trigger, window.as_ref(), now) {
                let state = ms.state;
                let step = Cursor::metric(&mut ms).advance(state, now, false, reminder, end_info.as_ref());
                record_step(step, &trigger.id, &name, &ms, now, &mut events, suppressed);
            }

            data.metrics.insert(name, ms);
        }
        Ok(events)
    }
}

/// Timestamps of the primary series newer than `after` where every target
/// has a value, with the values keyed `t1..tN`.
fn complete_tuples(
    primary: &MetricData,
    others: &[Option<&MetricData>],
    after: i64,
) -> Vec<(i64, BTreeMap<String, f64>)> {
    primary
        .timestamps()
        .filter(|ts| *ts > after)
        .filter_map(|ts| {
            let mut values = BTreeMap::new();
            let main = primary.value_at(ts);
            if main.is_nan() {
                return None;
            }
            values.insert("t1".to_string(), main);
            for (i, other) in others.iter().enumerate() {
                let v = other.map(|o| o.value_at(ts)).unwrap_or(f64::NAN);
                if v.is_nan() {
                    return None;
                }
                values.insert(format!("t{}", i + 2), v);
            }
            Some((ts, values))
        })
        .collect()
}

fn state_for(
    trigger: &Trigger,
    expression: Option<&Expression>,
    values: &BTreeMap<String, f64>,
    prev_state: State,
) -> Result<State> {
    let v = values.get("t1").copied().unwrap_or(f64::NAN);
    let state = match trigger.trigger_type {
        TriggerType::Rising => {
            if trigger.error_value.is_some_and(|e| v >= e) {
                State::Error
            } else if trigger.warn_value.is_some_and(|w| v >= w) {
                State::Warn
            } else {
                State::Ok
            }
        }
        TriggerType::Falling => {
            if trigger.error_value.is_some_and(|e| v <= e) {
                State::Error
            } else if trigger.warn_value.is_some_and(|w| v <= w) {
                State::Warn
            } else {
                State::Ok
            }
        }
        TriggerType::Expression => {
            let Some(expression) = expression else {
                return Err(CheckError::Source("expression trigger without expression".into()));
            };
            expression.evaluate(&Env {
                targets: values,
                warn_value: trigger.warn_value,
                error_value: trigger.error_value,
                prev_state,
            })?
        }
    };
    Ok(state)
}

fn suppressed_at(trigger: &Trigger, maintenance: Option<&Maintenance>, ts: i64) -> bool {
    trigger.schedule.as_ref().is_some_and(|s| !s.allows(ts))
        || maintenance.is_some_and(|m| m.covers(ts))
}

fn record_step(
    step: Step,
    trigger_id: &str,
    metric: &str,
    ms: &MetricState,
    ts: i64,
    events: &mut Vec<NotificationEvent>,
    suppressed: &mut u64,
) {
    match step {
        Step::Silent => {}
        Step::Suppressed => *suppressed += 1,
        Step::Emit { old, info } => events.push(NotificationEvent {
            trigger_id: trigger_id.to_string(),
            metric: metric.to_string(),
            value: ms.value,
            values: ms.values.clone(),
            timestamp: ts,
            old_state: old,
            state: ms.state,
            message: None,
            is_trigger_event: false,
            sub_id: None,
            info,
            dispatch_failed: false,
        }),
    }
}

fn record_ttl_step(
    step: Step,
    trigger_id: &str,
    metric: &str,
    ms: &MetricState,
    ts: i64,
    events: &mut Vec<NotificationEvent>,
    suppressed: &mut u64,
) {
    let before = events.len();
    record_step(step, trigger_id, metric, ms, ts, events, suppressed);
    if let Some(ev) = events.get_mut(before) {
        ev.value = None;
        ev.values.clear();
        ev.message = Some(format!("No data for metric {metric}"));
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
