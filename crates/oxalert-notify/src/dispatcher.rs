use crate::config::NotifierConfig;
use crate::error::{NotifyError, Result};
use crate::gate::SelfStateGate;
use crate::plot::PlotRenderer;
use crate::registry::SenderRegistry;
use crate::sender::Sender;
use oxalert_common::metrics::CoreMetrics;
use oxalert_common::shutdown::ShutdownSignal;
use oxalert_common::types::{Contact, NotificationEvent, ScheduledNotification, TriggerSnapshot};
use oxalert_storage::store::heartbeat::NOTIFIER;
use oxalert_storage::Database;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Seconds of history rendered before the earliest event of a plot.
const PLOT_LOOKBEHIND_S: i64 = 3600;

/// Counts of one dispatch tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// The self-state gate was closed and nothing was fetched.
    pub paused: bool,
    pub fetched: usize,
    pub sent: usize,
    pub requeued: usize,
    pub dropped: usize,
}

impl DispatchStats {
    fn merge(&mut self, other: DispatchStats) {
        self.sent += other.sent;
        self.requeued += other.requeued;
        self.dropped += other.dropped;
    }
}

/// Notifications for one `(contact type, contact value, trigger)`, delivered
/// in a single sender call.
struct Group {
    contact: Contact,
    trigger: TriggerSnapshot,
    notifications: Vec<ScheduledNotification>,
}

impl Group {
    fn events(&self) -> Vec<NotificationEvent> {
        self.notifications
            .iter()
            .flat_map(|n| n.events.iter().cloned())
            .collect()
    }

    fn throttled(&self) -> bool {
        self.notifications.iter().any(|n| n.throttled)
    }
}

/// Drains due notifications from the time-keyed queue and hands them to the
/// registered senders through a bounded pool.
#[derive(Clone)]
pub struct Dispatcher {
    db: Database,
    registry: Arc<SenderRegistry>,
    plot: Option<Arc<dyn PlotRenderer>>,
    gate: Arc<SelfStateGate>,
    config: NotifierConfig,
    metrics: Arc<CoreMetrics>,
}

impl Dispatcher {
    pub fn new(
        db: Database,
        registry: Arc<SenderRegistry>,
        gate: Arc<SelfStateGate>,
        config: NotifierConfig,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        Self {
            db,
            registry,
            plot: None,
            gate,
            config,
            metrics,
        }
    }

    pub fn with_plot_renderer(mut self, plot: Arc<dyn PlotRenderer>) -> Self {
        self.plot = Some(plot);
        self
    }

    pub async fn run(self, mut shutdown: ShutdownSignal) {
        tracing::info!(
            workers = self.config.send_workers,
            senders = ?self.registry.sender_types(),
            "Notification dispatcher started"
        );
        let tick = Duration::from_millis(self.config.tick_ms.max(1));
        loop {
            let pause = match self.tick(oxalert_common::now_ts()).await {
                Ok(stats) if stats.paused => {
                    tracing::warn!(
                        pause_s = self.config.selfstate_pause_s,
                        "Self-state is ERROR, dispatch paused"
                    );
                    Duration::from_secs(self.config.selfstate_pause_s)
                }
                Ok(_) => tick,
                Err(e) => {
                    tracing::error!(error = %e, "Dispatch tick failed");
                    tick
                }
            };
            if shutdown.sleep(pause).await {
                break;
            }
        }
        tracing::info!("Notification dispatcher stopped");
    }

    /// Delivers every notification due at `now` and waits for all sends to
    /// finish.
    pub async fn tick(&self, now: i64) -> Result<DispatchStats> {
        if !self.gate.is_open() {
            return Ok(DispatchStats {
                paused: true,
                ..Default::default()
            });
        }
        let due = self
            .db
            .fetch_due_notifications(now, self.config.fetch_limit)?;
        if let Err(e) = self.db.beat(NOTIFIER, now) {
            tracing::warn!(error = %e, "Failed to write notifier heartbeat");
        }

        let mut stats = DispatchStats {
            fetched: due.len(),
            ..Default::default()
        };
        if !due.is_empty() {
            let semaphore = Arc::new(Semaphore::new(self.config.send_workers.max(1)));
            let mut tasks: Vec<JoinHandle<DispatchStats>> = Vec::new();
            for group in group_notifications(due) {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| NotifyError::Other(e.to_string()))?;
                let this = self.clone();
                tasks.push(tokio::spawn(async move {
                    let _permit = permit;
                    this.deliver(group, now).await
                }));
            }
            for task in tasks {
                match task.await {
                    Ok(group_stats) => stats.merge(group_stats),
                    Err(e) => {
                        self.metrics.worker_panics.inc();
                        tracing::error!(error = %e, "Dispatch worker panicked");
                    }
                }
            }
        }

        if let Ok(depth) = self.db.notification_queue_len() {
            self.metrics.notification_queue_depth.set(depth as i64);
        }
        Ok(stats)
    }

    async fn deliver(&self, group: Group, now: i64) -> DispatchStats {
        let Some(sender) = self.registry.get(&group.contact.contact_type) else {
            tracing::error!(
                contact_type = %group.contact.contact_type,
                contact_id = %group.contact.id,
                trigger_id = %group.trigger.id,
                "No sender registered for contact type, notification dropped"
            );
            self.metrics
                .notifications_failed
                .add(group.notifications.len() as u64);
            return self.drop_all(group.notifications);
        };

        let events = group.events();
        let plot = self.render_plot(&group, &events, now).await;
        let result = self
            .send_with_timeout(sender, events, &group.contact, &group.trigger, plot, group.throttled())
            .await;

        match result {
            Ok(()) => {
                self.metrics
                    .notifications_sent
                    .add(group.notifications.len() as u64);
                tracing::debug!(
                    contact_id = %group.contact.id,
                    trigger_id = %group.trigger.id,
                    notifications = group.notifications.len(),
                    "Notification delivered"
                );
                DispatchStats {
                    sent: group.notifications.len(),
                    ..Default::default()
                }
            }
            Err(e) => {
                self.metrics
                    .notifications_failed
                    .add(group.notifications.len() as u64);
                tracing::warn!(
                    contact_id = %group.contact.id,
                    trigger_id = %group.trigger.id,
                    error = %e,
                    "Notification delivery failed"
                );
                self.retry_or_drop(group.notifications, now)
            }
        }
    }

    /// Calls the sender on its own task so a hung or panicking sender only
    /// costs this delivery.
    async fn send_with_timeout(
        &self,
        sender: Arc<dyn Sender>,
        events: Vec<NotificationEvent>,
        contact: &Contact,
        trigger: &TriggerSnapshot,
        plot: Option<Vec<u8>>,
        throttled: bool,
    ) -> Result<()> {
        let contact = contact.clone();
        let trigger = trigger.clone();
        let mut handle = tokio::spawn(async move {
            sender
                .send_events(&events, &contact, &trigger, plot.as_deref(), throttled)
                .await
        });
        let limit = Duration::from_millis(self.config.sending_timeout_ms);
        match tokio::time::timeout(limit, &mut handle).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(NotifyError::Sender(format!("{e:#}"))),
            Ok(Err(e)) => {
                self.metrics.worker_panics.inc();
                Err(NotifyError::Sender(format!("sender panicked: {e}")))
            }
            Err(_) => {
                handle.abort();
                Err(NotifyError::Timeout(self.config.sending_timeout_ms))
            }
        }
    }

    async fn render_plot(
        &self,
        group: &Group,
        events: &[NotificationEvent],
        now: i64,
    ) -> Option<Vec<u8>> {
        let plot = self.plot.as_ref()?;
        let plotting = group
            .notifications
            .iter()
            .map(|n| &n.plotting)
            .find(|p| p.enabled)?;
        let metrics: Vec<String> = events
            .iter()
            .filter(|e| !e.is_trigger_event && !e.metric.is_empty())
            .map(|e| e.metric.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let from = events.iter().map(|e| e.timestamp).min().unwrap_or(now) - PLOT_LOOKBEHIND_S;

        let limit = Duration::from_secs(self.config.plot_timeout_s);
        match tokio::time::timeout(
            limit,
            plot.render(&group.trigger, &metrics, plotting, from, now),
        )
        .await
        {
            Ok(Ok(bytes)) => Some(bytes),
            Ok(Err(e)) => {
                tracing::warn!(trigger_id = %group.trigger.id, error = %e, "Plot rendering failed, sending without plot");
                None
            }
            Err(_) => {
                tracing::warn!(trigger_id = %group.trigger.id, "Plot rendering timed out, sending without plot");
                None
            }
        }
    }

    fn retry_or_drop(&self, notifications: Vec<ScheduledNotification>, now: i64) -> DispatchStats {
        let mut stats = DispatchStats::default();
        let mut exhausted = Vec::new();
        for mut n in notifications {
            n.fail_count += 1;
            if n.fail_count >= self.config.max_retries {
                exhausted.push(n);
                continue;
            }
            n.send_at = now + self.config.resending_timeout_s;
            match self.db.enqueue_notification(&n) {
                Ok(_) => {
                    self.metrics.notifications_requeued.inc();
                    stats.requeued += 1;
                    tracing::info!(
                        notification_id = %n.id,
                        fail_count = n.fail_count,
                        send_at = n.send_at,
                        "Notification requeued"
                    );
                }
                Err(e) => {
                    tracing::error!(notification_id = %n.id, error = %e, "Failed to requeue notification");
                    exhausted.push(n);
                }
            }
        }
        let dropped = self.drop_all(exhausted);
        stats.merge(dropped);
        stats
    }

    /// Gives up on `notifications`, recording their events in the audit
    /// stream.
    fn drop_all(&self, notifications: Vec<ScheduledNotification>) -> DispatchStats {
        for n in &notifications {
            self.metrics.notifications_dropped.inc();
            tracing::error!(
                notification_id = %n.id,
                contact_id = %n.contact.id,
                trigger_id = %n.trigger.id,
                fail_count = n.fail_count,
                events = n.events.len(),
                "Notification dropped"
            );
            if let Err(e) = self.db.push_audit(&n.events) {
                tracing::error!(notification_id = %n.id, error = %e, "Failed to write audit events");
            }
        }
        DispatchStats {
            dropped: notifications.len(),
            ..Default::default()
        }
    }

    /// Sends `events` to `contact` right away, bypassing the queue and the
    /// self-state gate.
    pub async fn send_now(
        &self,
        contact: &Contact,
        trigger: &TriggerSnapshot,
        events: Vec<NotificationEvent>,
    ) -> Result<()> {
        let sender = self
            .registry
            .get(&contact.contact_type)
            .ok_or_else(|| NotifyError::UnknownSenderType(contact.contact_type.clone()))?;
        self.send_with_timeout(sender, events, contact, trigger, None, false)
            .await
    }
}

fn group_notifications(due: Vec<ScheduledNotification>) -> Vec<Group> {
    let mut groups: BTreeMap<(String, String, String), Group> = BTreeMap::new();
    for n in due {
        let key = (
            n.contact.contact_type.clone(),
            n.contact.value.clone(),
            n.trigger.id.clone(),
        );
        groups
            .entry(key)
            .or_insert_with(|| Group {
                contact: n.contact.clone(),
                trigger: n.trigger.clone(),
                notifications: Vec::new(),
            })
            .notifications
            .push(n);
    }
    groups.into_values().collect()
}
