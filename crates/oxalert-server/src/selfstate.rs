use crate::config::SelfStateConfig;
use oxalert_checker::RemoteSource;
use oxalert_common::shutdown::ShutdownSignal;
use oxalert_common::types::{
    Contact, NotificationEvent, SelfState, SelfStateActor, SelfStateValue, State,
    TriggerSnapshot, TriggerType,
};
use oxalert_notify::Dispatcher;
use oxalert_storage::store::heartbeat::{CHECKER, FILTER};
use oxalert_storage::Database;
use std::sync::Arc;
use std::time::Duration;

const SELF_STATE_TRIGGER_ID: &str = "oxalert-self-state";

/// Watches the health of the pipeline and flips the global self-state.
///
/// Health signals: filter and checker heartbeats, store connectivity and the
/// remote source's consecutive failures. Any problem sets ERROR (actor auto);
/// once none remain it resets to OK. A manual override is left alone.
pub struct SelfStateMonitor {
    db: Database,
    config: SelfStateConfig,
    remote: Option<Arc<RemoteSource>>,
    dispatcher: Option<Dispatcher>,
    admins: Vec<Contact>,
    started_at: i64,
}

impl SelfStateMonitor {
    pub fn new(db: Database, config: SelfStateConfig, started_at: i64) -> Self {
        Self {
            db,
            config,
            remote: None,
            dispatcher: None,
            admins: Vec::new(),
            started_at,
        }
    }

    pub fn with_remote(mut self, remote: Arc<RemoteSource>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Admin contacts are told about every automatic change.
    pub fn with_admins(mut self, dispatcher: Dispatcher, admins: Vec<Contact>) -> Self {
        self.dispatcher = Some(dispatcher);
        self.admins = admins;
        self
    }

    /// Problems observed at `now`; empty when healthy.
    pub fn problems(&self, now: i64) -> Vec<String> {
        let mut problems = Vec::new();
        if let Err(e) = self.db.ping() {
            problems.push(format!("store unreachable: {e}"));
            return problems;
        }
        for (component, what) in [(FILTER, "metric samples saved"), (CHECKER, "trigger checks completed")] {
            match self.db.last_beat(component) {
                Ok(beat) => {
                    // Before the first beat the process start counts as one.
                    let last = beat.unwrap_or(self.started_at).max(self.started_at);
                    if now - last > self.config.heartbeat_timeout_s {
                        problems.push(format!("no {what} for {}s", now - last));
                    }
                }
                Err(e) => problems.push(format!("store unreachable: {e}")),
            }
        }
        if let Some(remote) = &self.remote {
            let failures = remote.consecutive_failures();
            if failures >= self.config.remote_failure_threshold {
                problems.push(format!("remote metric source failed {failures} times in a row"));
            }
        }
        problems
    }

    /// Collects the problems once and applies the outcome. Returns the new state
    /// when it changed.
    pub async fn evaluate(&self, now: i64) -> Option<SelfState> {
        let problems = self.problems(now);
        let (raw, current) = match self.db.get_self_state() {
            Ok(found) => found,
            Err(e) => {
                tracing::error!(error = %e, problems = ?problems, "Cannot read self-state");
                return None;
            }
        };
        if current.actor == SelfStateActor::Manual {
            tracing::debug!(state = ?current.state, "Self-state is manually overridden");
            return None;
        }

        let desired = if problems.is_empty() {
            SelfStateValue::Ok
        } else {
            SelfStateValue::Error
        };
        if desired == current.state {
            return None;
        }
        let next = SelfState {
            state: desired,
            actor: SelfStateActor::Auto,
            updated_at: now,
            message: (!problems.is_empty()).then(|| problems.join("; ")),
        };
        match self.db.cas_self_state(raw.as_deref(), &next) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("Self-state changed concurrently, re-evaluating next round");
                return None;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to write self-state");
                return None;
            }
        }

        match next.state {
            SelfStateValue::Error => tracing::warn!(
                problems = %next.message.as_deref().unwrap_or_default(),
                "Self-state set to ERROR, notifications paused"
            ),
            SelfStateValue::Ok => tracing::info!("Self-state recovered to OK, notifications resumed"),
        }
        self.notify_admins(&current, &next).await;
        Some(next)
    }

    async fn notify_admins(&self, previous: &SelfState, next: &SelfState) {
        let Some(dispatcher) = &self.dispatcher else {
            return;
        };
        let trigger = self_state_trigger();
        let event = NotificationEvent {
            trigger_id: trigger.id.clone(),
            metric: String::new(),
            value: None,
            values: Default::default(),
            timestamp: next.updated_at,
            old_state: as_state(previous.state),
            state: as_state(next.state),
            message: next.message.clone(),
            is_trigger_event: true,
            sub_id: None,
            info: None,
            dispatch_failed: false,
        };
        for contact in &self.admins {
            if let Err(e) = dispatcher
                .send_now(contact, &trigger, vec![event.clone()])
                .await
            {
                tracing::warn!(contact = %contact.value, error = %e, "Failed to notify admin of self-state change");
            }
        }
    }

    pub async fn run(self, mut shutdown: ShutdownSignal) {
        if !self.config.enabled {
            tracing::info!("Self-state monitor disabled");
            return;
        }
        tracing::info!(
            heartbeat_timeout_s = self.config.heartbeat_timeout_s,
            "Self-state monitor started"
        );
        let every = Duration::from_secs(self.config.check_interval_s.max(1));
        loop {
            self.evaluate(oxalert_common::now_ts()).await;
            if shutdown.sleep(every).await {
                break;
            }
        }
        tracing::info!("Self-state monitor stopped");
    }
}

fn as_state(v: SelfStateValue) -> State {
    match v {
        SelfStateValue::Ok => State::Ok,
        SelfStateValue::Error => State::Error,
    }
}

fn self_state_trigger() -> TriggerSnapshot {
    TriggerSnapshot {
        id: SELF_STATE_TRIGGER_ID.to_string(),
        name: "oxalert self-state".to_string(),
        desc: Some("Health of the alerting pipeline".to_string()),
        targets: Vec::new(),
        warn_value: None,
        error_value: None,
        trigger_type: TriggerType::Expression,
        tags: Vec::new(),
        is_remote: false,
    }
}

/// Administrator override. ERROR is pinned (actor manual) until cleared;
/// OK clears the override and hands control back to the monitor.
pub fn override_self_state(
    db: &Database,
    value: SelfStateValue,
    now: i64,
) -> oxalert_storage::Result<SelfState> {
    let next = match value {
        SelfStateValue::Error => SelfState {
            state: SelfStateValue::Error,
            actor: SelfStateActor::Manual,
            updated_at: now,
            message: Some("set by administrator".to_string()),
        },
        SelfStateValue::Ok => SelfState {
            state: SelfStateValue::Ok,
            actor: SelfStateActor::Auto,
            updated_at: now,
            message: None,
        },
    };
    loop {
        let (raw, _) = db.get_self_state()?;
        if db.cas_self_state(raw.as_deref(), &next)? {
            return Ok(next);
        }
    }
}
