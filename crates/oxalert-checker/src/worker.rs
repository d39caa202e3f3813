use crate::check::TriggerChecker;
use crate::error::CheckError;
use oxalert_common::shutdown::ShutdownSignal;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Schedules the triggers of one partition (local or remote) onto a bounded
/// pool of check tasks.
///
/// Every tick the pool picks triggers whose next check time has passed plus
/// those the filter marked as having fresh data, skipping any already in
/// flight. A trigger that cannot get a worker this tick stays due.
pub struct CheckerPool {
    checker: Arc<TriggerChecker>,
    remote: bool,
    workers: usize,
    tick: Duration,
    next_check_at: Arc<Mutex<HashMap<String, i64>>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl CheckerPool {
    pub fn new(checker: Arc<TriggerChecker>, remote: bool) -> Self {
        let workers = if remote {
            checker.config().remote_pool_size()
        } else {
            checker.config().local_pool_size()
        };
        Self {
            checker,
            remote,
            workers,
            tick: Duration::from_secs(1),
            next_check_at: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    fn partition(&self) -> &'static str {
        if self.remote {
            "remote"
        } else {
            "local"
        }
    }

    pub async fn run(self, mut shutdown: ShutdownSignal) {
        if !self.checker.has_source(self.remote) {
            tracing::info!(partition = self.partition(), "No metric source configured, checker idle");
            shutdown.triggered().await;
            return;
        }
        tracing::info!(
            partition = self.partition(),
            workers = self.workers,
            "Checker pool started"
        );

        let semaphore = Arc::new(Semaphore::new(self.workers.max(1)));
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        loop {
            tasks.retain(|t| !t.is_finished());
            let now = oxalert_common::now_ts();
            match self.due_triggers(now) {
                Ok(due) => {
                    for trigger_id in due {
                        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                            break;
                        };
                        self.lock_map(&self.in_flight).insert(trigger_id.clone());
                        tasks.push(self.spawn_check(trigger_id, now, permit));
                    }
                }
                Err(e) => {
                    tracing::error!(partition = self.partition(), error = %e, "Failed to collect due triggers");
                }
            }
            if shutdown.sleep(self.tick).await {
                break;
            }
        }

        tracing::info!(
            partition = self.partition(),
            in_flight = tasks.len(),
            "Checker pool stopping"
        );
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Check supervisor panicked");
            }
        }
    }

    fn lock_map<'a, T>(&self, m: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Triggers to check at `now`, in a stable order.
    fn due_triggers(&self, now: i64) -> oxalert_storage::Result<Vec<String>> {
        let db = self.checker.db();
        let ids = db.trigger_ids(self.remote)?;
        let fresh: HashSet<String> = db.take_triggers_to_check(self.remote)?.into_iter().collect();

        let in_flight = self.lock_map(&self.in_flight).clone();
        let mut next = self.lock_map(&self.next_check_at);
        let known: HashSet<&String> = ids.iter().collect();
        next.retain(|id, _| known.contains(id));

        let mut due: Vec<String> = ids
            .iter()
            .filter(|id| !in_flight.contains(*id))
            .filter(|id| fresh.contains(*id) || next.get(*id).map_or(true, |at| *at <= now))
            .cloned()
            .collect();
        due.sort();

        let deferred: Vec<String> = fresh
            .into_iter()
            .filter(|id| in_flight.contains(id) && known.contains(id))
            .collect();
        drop(next);
        if !deferred.is_empty() {
            db.mark_triggers_to_check(self.remote, &deferred)?;
        }
        Ok(due)
    }

    fn spawn_check(
        &self,
        trigger_id: String,
        now: i64,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) -> JoinHandle<()> {
        let checker = self.checker.clone();
        let next_check_at = self.next_check_at.clone();
        let in_flight = self.in_flight.clone();
        let remote = self.remote;
        let default_interval = checker.config().interval_s as i64;

        tokio::spawn(async move {
            let _permit = permit;
            let inner = {
                let checker = checker.clone();
                let trigger_id = trigger_id.clone();
                tokio::spawn(async move { checker.check(&trigger_id, now).await })
            };
            let interval = match inner.await {
                Ok(Ok(outcome)) => outcome
                    .trigger
                    .check_interval_s
                    .map(|s| s as i64)
                    .unwrap_or(default_interval),
                Ok(Err(CheckError::Locked(_))) => {
                    tracing::debug!(trigger_id = %trigger_id, "Trigger locked elsewhere, skipping");
                    default_interval
                }
                Ok(Err(CheckError::TriggerNotFound(_))) => {
                    tracing::debug!(trigger_id = %trigger_id, "Trigger removed before check");
                    default_interval
                }
                Ok(Err(e)) => {
                    if remote {
                        checker.metrics().check_errors_remote.inc();
                    } else {
                        checker.metrics().check_errors_local.inc();
                    }
                    tracing::error!(trigger_id = %trigger_id, error = %e, "Trigger check failed");
                    default_interval
                }
                Err(e) => {
                    checker.metrics().worker_panics.inc();
                    tracing::error!(trigger_id = %trigger_id, error = %e, "Trigger check panicked");
                    default_interval
                }
            };
            next_check_at
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(trigger_id.clone(), now + interval.max(1));
            in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&trigger_id);
        })
    }
}
