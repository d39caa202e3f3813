use crate::config::{NotifierConfig, ThrottlingConfig};
use crate::error::{NotifyError, Result};
use crate::gate::SelfStateGate;
use oxalert_common::id::IdGenerator;
use oxalert_common::metrics::CoreMetrics;
use oxalert_common::shutdown::ShutdownSignal;
use oxalert_common::types::{
    Contact, NotificationEvent, ScheduledNotification, Subscription, ThrottleTier,
    ThrottlingPolicy, Trigger, TriggerSnapshot,
};
use oxalert_storage::store::throttling::ThrottleRecord;
use oxalert_storage::Database;
use std::sync::Arc;
use std::time::Duration;

const THROTTLE_CAS_ATTEMPTS: usize = 16;
const MAX_BACKOFF: Duration = Duration::from_secs(30);

enum Coalesce {
    Joined,
    Full,
    Absent,
}

/// Consumes the event FIFO, matches events against subscriptions and puts
/// one scheduled notification per eligible contact on the time-keyed queue.
///
/// Runs as a single writer. While the self-state is ERROR nothing is
/// consumed and events accumulate in the FIFO.
pub struct EventScheduler {
    db: Database,
    ids: Arc<IdGenerator>,
    gate: Arc<SelfStateGate>,
    config: NotifierConfig,
    throttling: ThrottlingConfig,
    metrics: Arc<CoreMetrics>,
}

impl EventScheduler {
    pub fn new(
        db: Database,
        ids: Arc<IdGenerator>,
        gate: Arc<SelfStateGate>,
        config: NotifierConfig,
        throttling: ThrottlingConfig,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        Self {
            db,
            ids,
            gate,
            config,
            throttling,
            metrics,
        }
    }

    pub async fn run(self, mut shutdown: ShutdownSignal) {
        tracing::info!(batch = self.config.event_batch, "Event scheduler started");
        let tick = Duration::from_millis(self.config.tick_ms.max(1));
        let mut backoff = tick;
        while !shutdown.is_triggered() {
            if !self.gate.is_open() {
                tracing::debug!("Self-state is ERROR, holding events");
                if shutdown
                    .sleep(Duration::from_secs(self.config.selfstate_pause_s))
                    .await
                {
                    break;
                }
                continue;
            }
            let pause = match self.process_batch(oxalert_common::now_ts()) {
                Ok(0) => {
                    backoff = tick;
                    tick
                }
                Ok(_) => {
                    backoff = tick;
                    tokio::task::yield_now().await;
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, retry_in_ms = backoff.as_millis() as u64, "Event scheduling failed");
                    let pause = backoff;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    pause
                }
            };
            if shutdown.sleep(pause).await {
                break;
            }
        }
        tracing::info!("Event scheduler stopped");
    }

    /// Pops one batch of events and schedules them. On failure the unhandled
    /// tail of the batch goes back to the head of the FIFO.
    pub fn process_batch(&self, now: i64) -> Result<usize> {
        let events = self.db.pop_events(self.config.event_batch)?;
        for (i, event) in events.iter().enumerate() {
            if let Err(e) = self.handle(event, now) {
                let rest = &events[i..];
                if let Err(requeue_err) = self.db.requeue_events(rest) {
                    tracing::error!(
                        error = %requeue_err,
                        lost = rest.len(),
                        "Failed to requeue events"
                    );
                }
                return Err(e);
            }
        }
        if let Ok(depth) = self.db.events_len() {
            self.metrics.event_queue_depth.set(depth as i64);
        }
        if let Ok(throttled) = self.db.throttled_records() {
            self.metrics.throttled_records.set(throttled as i64);
        }
        Ok(events.len())
    }

    /// Fans one event out to every eligible subscription. Returns the number
    /// of contacts it was scheduled for.
    pub fn handle(&self, event: &NotificationEvent, now: i64) -> Result<usize> {
        let Some(trigger) = self.db.get_trigger(&event.trigger_id)? else {
            tracing::debug!(trigger_id = %event.trigger_id, "Event for removed trigger dropped");
            return Ok(0);
        };
        let subs = self.db.subscriptions_for_tags(&trigger.tags)?;

        let mut scheduled = 0;
        for sub in subs.iter().filter(|s| eligible(s, &trigger, event)) {
            let policy = self.policy_for(sub);
            let key = event.dedup_key(&sub.id);
            let ttl = Duration::from_secs(policy.window_s.max(1) as u64);
            if !self.db.mark_event_seen(&key, ttl)? {
                tracing::debug!(
                    sub_id = %sub.id,
                    trigger_id = %trigger.id,
                    metric = %event.metric,
                    "Duplicate event skipped"
                );
                continue;
            }
            match self.fan_out(sub, &trigger, event, &policy, now) {
                Ok(n) => scheduled += n,
                Err(e) => {
                    if let Err(forget_err) = self.db.forget_event(&key) {
                        tracing::warn!(error = %forget_err, "Failed to clear dedup marker");
                    }
                    return Err(e);
                }
            }
        }
        Ok(scheduled)
    }

    fn fan_out(
        &self,
        sub: &Subscription,
        trigger: &Trigger,
        event: &NotificationEvent,
        policy: &ThrottlingPolicy,
        now: i64,
    ) -> Result<usize> {
        let contacts = self.db.get_contacts(&sub.contacts)?;
        for contact in &contacts {
            self.schedule_one(sub, contact, trigger, event, policy, now)?;
        }
        Ok(contacts.len())
    }

    fn policy_for(&self, sub: &Subscription) -> ThrottlingPolicy {
        sub.throttling
            .clone()
            .unwrap_or_else(|| self.throttling.policy.clone())
    }

    /// Decides when the event reaches `contact` and either joins it to the
    /// open notification of the same tier or enqueues a new one.
    fn schedule_one(
        &self,
        sub: &Subscription,
        contact: &Contact,
        trigger: &Trigger,
        event: &NotificationEvent,
        policy: &ThrottlingPolicy,
        now: i64,
    ) -> Result<()> {
        let (tier, mut send_at) = if sub.throttling_enabled {
            self.throttle(contact, trigger, policy, now)?
        } else {
            (ThrottleTier::Immediate, now)
        };
        if let Some(schedule) = &sub.schedule {
            match schedule.next_allowed(send_at) {
                Some(at) => send_at = at,
                None => {
                    tracing::warn!(sub_id = %sub.id, "Subscription schedule has no enabled day, notification dropped");
                    return Ok(());
                }
            }
        }

        let mut event = event.clone();
        event.sub_id = Some(sub.id.clone());

        let overflow = match self.coalesce(contact, trigger, tier, &event, send_at, now)? {
            Coalesce::Joined => {
                self.metrics.notifications_coalesced.inc();
                tracing::debug!(
                    contact_id = %contact.id,
                    trigger_id = %trigger.id,
                    tier = tier.as_str(),
                    "Event coalesced into pending notification"
                );
                return Ok(());
            }
            Coalesce::Full => true,
            Coalesce::Absent => false,
        };

        let notification = ScheduledNotification {
            id: self.ids.next_id(),
            send_at,
            contact: contact.clone(),
            trigger: TriggerSnapshot::from(trigger),
            events: vec![event],
            throttled: tier == ThrottleTier::Throttled || overflow,
            tier,
            fail_count: 0,
            plotting: sub.plotting.clone(),
            sub_id: Some(sub.id.clone()),
            created_at: now,
        };
        let raw = self.db.enqueue_notification(&notification)?;
        if send_at > now {
            self.db
                .set_pending_notification(&notification, &raw, pending_ttl(send_at, now))?;
        }
        self.metrics.notifications_enqueued.inc();
        tracing::debug!(
            notification_id = %notification.id,
            contact_id = %contact.id,
            trigger_id = %trigger.id,
            tier = tier.as_str(),
            send_at,
            "Notification scheduled"
        );
        Ok(())
    }

    /// Records the event in the `(contact, trigger)` throttling record and
    /// returns the resulting tier and send time.
    fn throttle(
        &self,
        contact: &Contact,
        trigger: &Trigger,
        policy: &ThrottlingPolicy,
        now: i64,
    ) -> Result<(ThrottleTier, i64)> {
        let ttl = Duration::from_secs(policy.window_s.max(1) as u64);
        for _ in 0..THROTTLE_CAS_ATTEMPTS {
            let (expected, mut record) = match self.db.get_throttle(&contact.id, &trigger.id)? {
                Some((raw, record)) => (Some(raw), record),
                None => (None, ThrottleRecord::default()),
            };
            record.prune(now, policy.window_s);
            record.events.push(now);
            let count = record.count() as u32;

            let decision = if record.throttled_until > now || count > policy.tier2_threshold {
                record.throttled_until = now + policy.tier2_delay_s;
                (ThrottleTier::Throttled, now + policy.tier2_delay_s)
            } else if count > policy.tier1_threshold {
                (ThrottleTier::Delayed, now + policy.tier1_delay_s)
            } else {
                (ThrottleTier::Immediate, now)
            };

            if self.db.cas_throttle(
                &contact.id,
                &trigger.id,
                expected.as_deref(),
                &record,
                ttl,
            )? {
                return Ok(decision);
            }
        }
        Err(NotifyError::Other(format!(
            "throttling record for {}:{} kept changing",
            contact.id, trigger.id
        )))
    }

    fn coalesce(
        &self,
        contact: &Contact,
        trigger: &Trigger,
        tier: ThrottleTier,
        event: &NotificationEvent,
        send_at: i64,
        now: i64,
    ) -> Result<Coalesce> {
        let Some(pending) = self.db.pending_notification(&contact.id, &trigger.id, tier)? else {
            return Ok(Coalesce::Absent);
        };
        if pending.notification.send_at <= now {
            return Ok(Coalesce::Absent);
        }
        if pending.notification.events.len() >= self.throttling.max_events_per_notification {
            return Ok(Coalesce::Full);
        }

        let mut joined = pending.notification;
        joined.events.push(event.clone());
        if tier == ThrottleTier::Throttled {
            joined.send_at = joined.send_at.max(send_at);
        }
        match self.db.replace_notification(&pending.raw, &joined)? {
            Some(raw) => {
                self.db
                    .set_pending_notification(&joined, &raw, pending_ttl(joined.send_at, now))?;
                Ok(Coalesce::Joined)
            }
            None => Ok(Coalesce::Absent),
        }
    }
}

fn eligible(sub: &Subscription, trigger: &Trigger, event: &NotificationEvent) -> bool {
    if let Some(target) = &event.sub_id {
        if *target != sub.id {
            return false;
        }
    }
    sub.enabled && sub.matches_tags(&trigger.tags) && !sub.ignores(event)
}

fn pending_ttl(send_at: i64, now: i64) -> Duration {
    Duration::from_secs((send_at - now).max(1) as u64)
}
