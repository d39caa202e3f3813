use crate::config::{NotifierConfig, SenderConfig, ThrottlingConfig};
use crate::dispatcher::Dispatcher;
use crate::error::NotifyError;
use crate::gate::SelfStateGate;
use crate::plot::PlotRenderer;
use crate::registry::SenderRegistry;
use crate::scheduler::EventScheduler;
use crate::sender::Sender;
use async_trait::async_trait;
use chrono::FixedOffset;
use oxalert_common::id::IdGenerator;
use oxalert_common::metrics::CoreMetrics;
use oxalert_common::schedule::Schedule;
use oxalert_common::shutdown;
use oxalert_common::types::{
    Contact, NotificationEvent, Owner, PlottingConfig, SelfState, SelfStateActor,
    SelfStateValue, State, Subscription, ThrottleTier, Trigger, TriggerSnapshot, TriggerType,
    TtlState,
};
use oxalert_storage::{Database, MemoryStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const T0: i64 = 1_700_000_000;

fn trigger(id: &str, tags: &[&str]) -> Trigger {
    Trigger {
        id: id.into(),
        name: format!("{id} trigger"),
        desc: None,
        targets: vec!["servers.*.cpu".into()],
        warn_value: Some(10.0),
        error_value: Some(20.0),
        trigger_type: TriggerType::Rising,
        expression: None,
        tags: tags.iter().map(|t| t.to_string()).collect(),
        ttl: 600,
        ttl_state: TtlState::Nodata,
        schedule: None,
        owner: Owner::User("alice".into()),
        is_remote: false,
        mute_new_metrics: false,
        check_interval_s: None,
    }
}

fn contact(id: &str, contact_type: &str) -> Contact {
    Contact {
        id: id.into(),
        contact_type: contact_type.into(),
        value: format!("{id}@example.com"),
        owner: Owner::User("alice".into()),
    }
}

fn subscription(id: &str, tags: &[&str], contacts: &[&str]) -> Subscription {
    Subscription {
        id: id.into(),
        owner: Owner::User("alice".into()),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        any_tags: false,
        contacts: contacts.iter().map(|c| c.to_string()).collect(),
        schedule: None,
        throttling_enabled: true,
        enabled: true,
        ignore_recoveries: false,
        ignore_warnings: false,
        plotting: PlottingConfig::default(),
        throttling: None,
    }
}

fn event(trigger_id: &str, ts: i64, old: State, new: State) -> NotificationEvent {
    NotificationEvent {
        trigger_id: trigger_id.into(),
        metric: "servers.a.cpu".into(),
        value: Some(42.0),
        values: Default::default(),
        timestamp: ts,
        old_state: old,
        state: new,
        message: None,
        is_trigger_event: false,
        sub_id: None,
        info: None,
        dispatch_failed: false,
    }
}

#[derive(Debug, Clone)]
struct Delivery {
    contact_id: String,
    trigger_id: String,
    events: usize,
    throttled: bool,
    plot: Option<Vec<u8>>,
}

/// Records deliveries; fails the first `failures` calls and sleeps `delay`
/// before answering.
#[derive(Clone, Default)]
struct RecordingSender {
    log: Arc<Mutex<Vec<Delivery>>>,
    failures: Arc<AtomicU32>,
    delay: Duration,
}

impl RecordingSender {
    fn deliveries(&self) -> Vec<Delivery> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sender for RecordingSender {
    fn init(
        &mut self,
        _settings: &HashMap<String, String>,
        _location: FixedOffset,
        _datetime_format: &str,
    ) -> crate::Result<()> {
        Ok(())
    }

    async fn send_events(
        &self,
        events: &[NotificationEvent],
        contact: &Contact,
        trigger: &TriggerSnapshot,
        plot: Option<&[u8]>,
        throttled: bool,
    ) -> anyhow::Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("mail server unavailable");
        }
        self.log.lock().unwrap().push(Delivery {
            contact_id: contact.id.clone(),
            trigger_id: trigger.id.clone(),
            events: events.len(),
            throttled,
            plot: plot.map(|p| p.to_vec()),
        });
        Ok(())
    }
}

struct Env {
    db: Database,
    metrics: Arc<CoreMetrics>,
    scheduler: EventScheduler,
    dispatcher: Dispatcher,
    sender: RecordingSender,
}

fn notifier_config() -> NotifierConfig {
    NotifierConfig {
        sending_timeout_ms: 1000,
        tick_ms: 10,
        ..NotifierConfig::default()
    }
}

fn env_with(config: NotifierConfig, sender: RecordingSender) -> Env {
    let db = Database::new(Arc::new(MemoryStore::new()));
    let metrics = Arc::new(CoreMetrics::new());
    let gate = Arc::new(SelfStateGate::with_ttl(db.clone(), Duration::ZERO));

    let mut registry = SenderRegistry::default();
    registry
        .register("mail", Box::new(sender.clone()), &HashMap::new())
        .unwrap();

    let scheduler = EventScheduler::new(
        db.clone(),
        Arc::new(IdGenerator::new(1, 1)),
        gate.clone(),
        config.clone(),
        ThrottlingConfig::default(),
        metrics.clone(),
    );
    let dispatcher = Dispatcher::new(
        db.clone(),
        Arc::new(registry),
        gate,
        config,
        metrics.clone(),
    );
    Env {
        db,
        metrics,
        scheduler,
        dispatcher,
        sender,
    }
}

fn env() -> Env {
    env_with(notifier_config(), RecordingSender::default())
}

fn seed_basic(db: &Database) {
    db.save_trigger(&trigger("t1", &["prod", "web"])).unwrap();
    db.save_contact(&contact("c1", "mail")).unwrap();
    db.save_subscription(&subscription("s1", &["prod"], &["c1"]))
        .unwrap();
}

fn set_self_state(db: &Database, state: SelfStateValue) {
    let (raw, _) = db.get_self_state().unwrap();
    let next = SelfState {
        state,
        actor: SelfStateActor::Manual,
        updated_at: T0,
        message: None,
    };
    assert!(db.cas_self_state(raw.as_deref(), &next).unwrap());
}

#[test]
fn default_registry_has_log_sender() {
    let registry = SenderRegistry::default();
    assert!(registry.has_sender("log"));
    assert_eq!(registry.sender_types(), vec!["log"]);
    assert!(registry.get("pager").is_none());
}

#[test]
fn registry_rejects_unknown_sender_type() {
    let configs = vec![SenderConfig {
        sender_type: "pager".into(),
        settings: HashMap::new(),
    }];
    let err = SenderRegistry::from_config(&configs, 0, "%H:%M").err().unwrap();
    assert!(matches!(err, NotifyError::UnknownSenderType(t) if t == "pager"));
}

#[test]
fn registry_validates_sender_settings() {
    let mut settings = HashMap::new();
    settings.insert("level".to_string(), "loud".to_string());
    let configs = vec![SenderConfig {
        sender_type: "log".into(),
        settings,
    }];
    let err = SenderRegistry::from_config(&configs, 0, "%H:%M").err().unwrap();
    assert!(matches!(err, NotifyError::InvalidConfig(_)));
}

#[test]
fn registry_rejects_out_of_range_timezone() {
    assert!(SenderRegistry::from_config(&[], 24 * 60, "%H:%M").is_err());
    let registry = SenderRegistry::from_config(&[], 180, "%H:%M").unwrap();
    assert!(registry.has_sender("log"));
}

#[test]
fn event_reaches_only_matching_subscriptions() {
    let env = env();
    seed_basic(&env.db);
    env.db.save_contact(&contact("c2", "mail")).unwrap();
    env.db.save_contact(&contact("c3", "mail")).unwrap();
    // needs a tag the trigger lacks
    env.db
        .save_subscription(&subscription("s2", &["prod", "db"], &["c2"]))
        .unwrap();
    let mut disabled = subscription("s3", &["web"], &["c3"]);
    disabled.enabled = false;
    env.db.save_subscription(&disabled).unwrap();

    let scheduled = env
        .scheduler
        .handle(&event("t1", T0, State::Ok, State::Error), T0)
        .unwrap();
    assert_eq!(scheduled, 1);

    let queued = env.db.queued_notifications().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].contact.id, "c1");
    assert_eq!(queued[0].send_at, T0);
    assert_eq!(queued[0].tier, ThrottleTier::Immediate);
    assert_eq!(queued[0].events[0].sub_id.as_deref(), Some("s1"));
    assert_eq!(queued[0].trigger.name, "t1 trigger");
}

#[test]
fn any_tag_subscription_matches_every_trigger() {
    let env = env();
    env.db.save_trigger(&trigger("t1", &["misc"])).unwrap();
    env.db.save_contact(&contact("c1", "mail")).unwrap();
    let mut sub = subscription("s1", &[], &["c1"]);
    sub.any_tags = true;
    env.db.save_subscription(&sub).unwrap();

    let scheduled = env
        .scheduler
        .handle(&event("t1", T0, State::Ok, State::Warn), T0)
        .unwrap();
    assert_eq!(scheduled, 1);
}

#[test]
fn transition_flags_hide_events() {
    let env = env();
    env.db.save_trigger(&trigger("t1", &["prod"])).unwrap();
    env.db.save_contact(&contact("c1", "mail")).unwrap();
    let mut sub = subscription("s1", &["prod"], &["c1"]);
    sub.ignore_recoveries = true;
    sub.ignore_warnings = true;
    env.db.save_subscription(&sub).unwrap();

    let s = &env.scheduler;
    assert_eq!(s.handle(&event("t1", T0, State::Error, State::Ok), T0).unwrap(), 0);
    assert_eq!(s.handle(&event("t1", T0 + 1, State::Ok, State::Warn), T0).unwrap(), 0);
    assert_eq!(s.handle(&event("t1", T0 + 2, State::Warn, State::Ok), T0).unwrap(), 0);
    assert_eq!(s.handle(&event("t1", T0 + 3, State::Warn, State::Error), T0).unwrap(), 1);
}

#[test]
fn duplicate_events_are_scheduled_once() {
    let env = env();
    seed_basic(&env.db);
    let ev = event("t1", T0, State::Ok, State::Error);
    assert_eq!(env.scheduler.handle(&ev, T0).unwrap(), 1);
    assert_eq!(env.scheduler.handle(&ev, T0 + 5).unwrap(), 0);
    assert_eq!(env.db.notification_queue_len().unwrap(), 1);
}

#[test]
fn event_for_removed_trigger_is_dropped() {
    let env = env();
    assert_eq!(
        env.scheduler
            .handle(&event("gone", T0, State::Ok, State::Error), T0)
            .unwrap(),
        0
    );
}

#[test]
fn throttling_tiers_coalesce_bursts() {
    let env = env();
    seed_basic(&env.db);

    // 25 transitions in under five minutes
    for i in 0..25 {
        let now = T0 + i * 12;
        let (old, new) = if i % 2 == 0 {
            (State::Ok, State::Error)
        } else {
            (State::Error, State::Ok)
        };
        env.scheduler.handle(&event("t1", now, old, new), now).unwrap();
    }

    let queued = env.db.queued_notifications().unwrap();
    assert_eq!(queued.len(), 12);

    let immediate: Vec<_> = queued
        .iter()
        .filter(|n| n.tier == ThrottleTier::Immediate)
        .collect();
    assert_eq!(immediate.len(), 10);
    assert!(immediate.iter().all(|n| n.events.len() == 1 && !n.throttled));

    let delayed: Vec<_> = queued
        .iter()
        .filter(|n| n.tier == ThrottleTier::Delayed)
        .collect();
    assert_eq!(delayed.len(), 1);
    assert_eq!(delayed[0].events.len(), 10);
    assert_eq!(delayed[0].send_at, T0 + 10 * 12 + 1800);
    assert!(!delayed[0].throttled);

    let throttled: Vec<_> = queued
        .iter()
        .filter(|n| n.tier == ThrottleTier::Throttled)
        .collect();
    assert_eq!(throttled.len(), 1);
    assert_eq!(throttled[0].events.len(), 5);
    assert!(throttled[0].throttled);
    // the window slides with every throttled event
    assert_eq!(throttled[0].send_at, T0 + 24 * 12 + 3600);

    let snap = env.metrics.snapshot();
    assert_eq!(snap.notifications_enqueued, 12);
    assert_eq!(snap.notifications_coalesced, 13);
    assert_eq!(env.db.throttled_records().unwrap(), 1);
}

#[test]
fn events_within_a_notification_keep_order() {
    let env = env();
    seed_basic(&env.db);
    for i in 0..12 {
        let now = T0 + i;
        env.scheduler
            .handle(&event("t1", now, State::Ok, State::Error), now)
            .unwrap();
    }
    let queued = env.db.queued_notifications().unwrap();
    let delayed = queued
        .iter()
        .find(|n| n.tier == ThrottleTier::Delayed)
        .unwrap();
    let stamps: Vec<i64> = delayed.events.iter().map(|e| e.timestamp).collect();
    assert_eq!(stamps, vec![T0 + 10, T0 + 11]);
}

#[test]
fn full_pending_notification_overflows_into_throttled_record() {
    let env = env_with(notifier_config(), RecordingSender::default());
    let mut throttling = ThrottlingConfig::default();
    throttling.max_events_per_notification = 2;
    let scheduler = EventScheduler::new(
        env.db.clone(),
        Arc::new(IdGenerator::new(1, 2)),
        Arc::new(SelfStateGate::with_ttl(env.db.clone(), Duration::ZERO)),
        notifier_config(),
        throttling,
        env.metrics.clone(),
    );
    seed_basic(&env.db);
    for i in 0..13 {
        let now = T0 + i;
        scheduler
            .handle(&event("t1", now, State::Ok, State::Error), now)
            .unwrap();
    }
    let delayed: Vec<_> = env
        .db
        .queued_notifications()
        .unwrap()
        .into_iter()
        .filter(|n| n.tier == ThrottleTier::Delayed)
        .collect();
    assert_eq!(delayed.len(), 2);
    assert_eq!(delayed.iter().filter(|n| n.throttled).count(), 1);
    assert_eq!(delayed.iter().map(|n| n.events.len()).sum::<usize>(), 3);
}

#[test]
fn disabled_throttling_sends_everything_immediately() {
    let env = env();
    env.db.save_trigger(&trigger("t1", &["prod"])).unwrap();
    env.db.save_contact(&contact("c1", "mail")).unwrap();
    let mut sub = subscription("s1", &["prod"], &["c1"]);
    sub.throttling_enabled = false;
    env.db.save_subscription(&sub).unwrap();

    for i in 0..30 {
        env.scheduler
            .handle(&event("t1", T0 + i, State::Ok, State::Error), T0 + i)
            .unwrap();
    }
    let queued = env.db.queued_notifications().unwrap();
    assert_eq!(queued.len(), 30);
    assert!(queued.iter().all(|n| n.tier == ThrottleTier::Immediate));
}

#[test]
fn subscription_schedule_defers_delivery() {
    let env = env();
    env.db.save_trigger(&trigger("t1", &["prod"])).unwrap();
    env.db.save_contact(&contact("c1", "mail")).unwrap();
    let mut sub = subscription("s1", &["prod"], &["c1"]);
    // 2024-01-01 (Monday) 02:00 UTC, schedule opens at 09:00
    let now = 1_704_074_400;
    sub.schedule = Some(Schedule {
        days: [true; 7],
        start_offset: 9 * 60,
        end_offset: 18 * 60,
        timezone_offset: 0,
    });
    env.db.save_subscription(&sub).unwrap();

    env.scheduler
        .handle(&event("t1", now, State::Ok, State::Error), now)
        .unwrap();
    let queued = env.db.queued_notifications().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].send_at, now + 7 * 3600);
}

#[test]
fn process_batch_requeues_on_store_failure() {
    let store = Arc::new(MemoryStore::new());
    let db = Database::new(store.clone());
    let metrics = Arc::new(CoreMetrics::new());
    let scheduler = EventScheduler::new(
        db.clone(),
        Arc::new(IdGenerator::default()),
        Arc::new(SelfStateGate::with_ttl(db.clone(), Duration::ZERO)),
        notifier_config(),
        ThrottlingConfig::default(),
        metrics,
    );
    seed_basic(&db);
    db.push_events(&[
        event("t1", T0, State::Ok, State::Error),
        event("t1", T0 + 1, State::Error, State::Ok),
    ])
    .unwrap();

    store.set_available(false);
    assert!(scheduler.process_batch(T0).is_err());
    store.set_available(true);

    assert_eq!(db.events_len().unwrap(), 2);
    assert_eq!(scheduler.process_batch(T0).unwrap(), 2);
    assert_eq!(db.events_len().unwrap(), 0);
    assert_eq!(db.notification_queue_len().unwrap(), 2);
}

#[tokio::test]
async fn scheduler_holds_events_while_self_state_is_error() {
    let env = env();
    seed_basic(&env.db);
    set_self_state(&env.db, SelfStateValue::Error);
    env.db
        .push_events(&[event("t1", T0, State::Ok, State::Error)])
        .unwrap();

    let (trigger, signal) = shutdown::channel();
    let handle = tokio::spawn(env.scheduler.run(signal));
    tokio::time::sleep(Duration::from_millis(50)).await;
    trigger.trigger();
    handle.await.unwrap();

    assert_eq!(env.db.events_len().unwrap(), 1);
    assert_eq!(env.db.notification_queue_len().unwrap(), 0);
}

#[tokio::test]
async fn scheduler_run_drains_fifo() {
    let env = env();
    seed_basic(&env.db);
    env.db
        .push_events(&[event("t1", oxalert_common::now_ts(), State::Ok, State::Error)])
        .unwrap();

    let (trigger, signal) = shutdown::channel();
    let handle = tokio::spawn(env.scheduler.run(signal));
    for _ in 0..100 {
        if env.db.notification_queue_len().unwrap() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    trigger.trigger();
    handle.await.unwrap();
    assert_eq!(env.db.events_len().unwrap(), 0);
    assert_eq!(env.db.notification_queue_len().unwrap(), 1);
}

#[tokio::test]
async fn dispatcher_delivers_due_notifications() {
    let env = env();
    seed_basic(&env.db);
    env.scheduler
        .handle(&event("t1", T0, State::Ok, State::Error), T0)
        .unwrap();

    // not yet due
    let stats = env.dispatcher.tick(T0 - 1).await.unwrap();
    assert_eq!(stats.fetched, 0);

    let stats = env.dispatcher.tick(T0).await.unwrap();
    assert_eq!(stats.fetched, 1);
    assert_eq!(stats.sent, 1);

    let deliveries = env.sender.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].contact_id, "c1");
    assert_eq!(deliveries[0].trigger_id, "t1");
    assert!(!deliveries[0].throttled);
    assert_eq!(env.db.notification_queue_len().unwrap(), 0);
    assert_eq!(env.metrics.snapshot().notifications_sent, 1);
    assert_eq!(env.db.last_beat("notifier").unwrap(), Some(T0));
}

#[tokio::test]
async fn dispatcher_groups_by_contact_and_trigger() {
    let env = env();
    seed_basic(&env.db);
    env.db.save_trigger(&trigger("t2", &["prod"])).unwrap();
    for (trigger_id, ts) in [("t1", T0), ("t1", T0 + 1), ("t2", T0 + 2)] {
        env.scheduler
            .handle(&event(trigger_id, ts, State::Ok, State::Error), ts)
            .unwrap();
    }

    let stats = env.dispatcher.tick(T0 + 5).await.unwrap();
    assert_eq!(stats.fetched, 3);
    assert_eq!(stats.sent, 3);

    let mut deliveries = env.sender.deliveries();
    deliveries.sort_by(|a, b| a.trigger_id.cmp(&b.trigger_id));
    assert_eq!(deliveries.len(), 2);
    assert_eq!(deliveries[0].trigger_id, "t1");
    assert_eq!(deliveries[0].events, 2);
    assert_eq!(deliveries[1].events, 1);
}

#[tokio::test]
async fn failed_sends_are_retried_until_delivered() {
    let sender = RecordingSender {
        failures: Arc::new(AtomicU32::new(2)),
        ..Default::default()
    };
    let env = env_with(notifier_config(), sender);
    seed_basic(&env.db);
    env.scheduler
        .handle(&event("t1", T0, State::Ok, State::Error), T0)
        .unwrap();

    let stats = env.dispatcher.tick(T0).await.unwrap();
    assert_eq!(stats.requeued, 1);
    let queued = env.db.queued_notifications().unwrap();
    assert_eq!(queued[0].fail_count, 1);
    assert_eq!(queued[0].send_at, T0 + 60);

    // not due until the resend timeout passes
    assert_eq!(env.dispatcher.tick(T0 + 30).await.unwrap().fetched, 0);

    env.dispatcher.tick(T0 + 60).await.unwrap();
    let queued = env.db.queued_notifications().unwrap();
    assert_eq!(queued[0].fail_count, 2);

    let stats = env.dispatcher.tick(T0 + 120).await.unwrap();
    assert_eq!(stats.sent, 1);
    assert_eq!(env.sender.deliveries().len(), 1);

    let snap = env.metrics.snapshot();
    assert_eq!(snap.notifications_failed, 2);
    assert_eq!(snap.notifications_requeued, 2);
    assert_eq!(snap.notifications_sent, 1);
    assert_eq!(snap.notifications_dropped, 0);
}

#[tokio::test]
async fn exhausted_notifications_are_dropped_to_audit() {
    let sender = RecordingSender {
        failures: Arc::new(AtomicU32::new(10)),
        ..Default::default()
    };
    let env = env_with(notifier_config(), sender);
    seed_basic(&env.db);
    env.scheduler
        .handle(&event("t1", T0, State::Ok, State::Error), T0)
        .unwrap();

    env.dispatcher.tick(T0).await.unwrap();
    env.dispatcher.tick(T0 + 60).await.unwrap();
    let stats = env.dispatcher.tick(T0 + 120).await.unwrap();
    assert_eq!(stats.dropped, 1);
    assert_eq!(env.db.notification_queue_len().unwrap(), 0);

    let audit = env.db.audit_events(0, 10).unwrap();
    assert_eq!(audit.len(), 1);
    assert!(audit[0].dispatch_failed);
    assert_eq!(env.metrics.snapshot().notifications_dropped, 1);
}

#[tokio::test]
async fn unknown_contact_type_fails_without_retry() {
    let env = env();
    env.db.save_trigger(&trigger("t1", &["prod"])).unwrap();
    env.db.save_contact(&contact("c1", "pager")).unwrap();
    env.db
        .save_subscription(&subscription("s1", &["prod"], &["c1"]))
        .unwrap();
    for ts in [T0, T0 + 1] {
        env.scheduler
            .handle(&event("t1", ts, State::Ok, State::Error), ts)
            .unwrap();
    }

    let stats = env.dispatcher.tick(T0 + 5).await.unwrap();
    assert_eq!(stats.dropped, 2);
    assert_eq!(stats.requeued, 0);
    assert_eq!(env.db.notification_queue_len().unwrap(), 0);
    assert!(env.sender.deliveries().is_empty());

    let snapshot = env.metrics.snapshot();
    assert_eq!(snapshot.notifications_failed, 2);
    assert_eq!(snapshot.notifications_dropped, 2);
}

#[tokio::test]
async fn slow_sender_times_out_and_is_requeued() {
    let sender = RecordingSender {
        delay: Duration::from_millis(500),
        ..Default::default()
    };
    let config = NotifierConfig {
        sending_timeout_ms: 20,
        ..notifier_config()
    };
    let env = env_with(config, sender);
    seed_basic(&env.db);
    env.scheduler
        .handle(&event("t1", T0, State::Ok, State::Error), T0)
        .unwrap();

    let stats = env.dispatcher.tick(T0).await.unwrap();
    assert_eq!(stats.requeued, 1);
    assert!(env.sender.deliveries().is_empty());
}

#[tokio::test]
async fn dispatcher_pauses_while_self_state_is_error() {
    let env = env();
    seed_basic(&env.db);
    env.scheduler
        .handle(&event("t1", T0, State::Ok, State::Error), T0)
        .unwrap();
    set_self_state(&env.db, SelfStateValue::Error);

    let stats = env.dispatcher.tick(T0).await.unwrap();
    assert!(stats.paused);
    assert_eq!(env.db.notification_queue_len().unwrap(), 1);

    set_self_state(&env.db, SelfStateValue::Ok);
    let stats = env.dispatcher.tick(T0).await.unwrap();
    assert_eq!(stats.sent, 1);
}

struct FixedPlot(Option<Vec<u8>>);

#[async_trait]
impl PlotRenderer for FixedPlot {
    async fn render(
        &self,
        _trigger: &TriggerSnapshot,
        metrics: &[String],
        _plotting: &PlottingConfig,
        from: i64,
        until: i64,
    ) -> anyhow::Result<Vec<u8>> {
        assert_eq!(metrics, ["servers.a.cpu".to_string()]);
        assert!(from < until);
        self.0.clone().ok_or_else(|| anyhow::anyhow!("renderer down"))
    }
}

async fn deliver_with_plot(renderer: FixedPlot) -> Delivery {
    let env = env();
    env.db.save_trigger(&trigger("t1", &["prod"])).unwrap();
    env.db.save_contact(&contact("c1", "mail")).unwrap();
    let mut sub = subscription("s1", &["prod"], &["c1"]);
    sub.plotting.enabled = true;
    env.db.save_subscription(&sub).unwrap();
    env.scheduler
        .handle(&event("t1", T0, State::Ok, State::Error), T0)
        .unwrap();

    let dispatcher = env.dispatcher.clone().with_plot_renderer(Arc::new(renderer));
    assert_eq!(dispatcher.tick(T0).await.unwrap().sent, 1);
    env.sender.deliveries().remove(0)
}

#[tokio::test]
async fn plot_is_attached_when_rendered() {
    let delivery = deliver_with_plot(FixedPlot(Some(vec![0x89, 0x50]))).await;
    assert_eq!(delivery.plot, Some(vec![0x89, 0x50]));
}

#[tokio::test]
async fn plot_failure_still_sends() {
    let delivery = deliver_with_plot(FixedPlot(None)).await;
    assert_eq!(delivery.plot, None);
}

#[tokio::test]
async fn send_now_bypasses_queue_and_gate() {
    let env = env();
    set_self_state(&env.db, SelfStateValue::Error);
    let snapshot = TriggerSnapshot::from(&trigger("selfstate", &[]));
    env.dispatcher
        .send_now(
            &contact("admin", "mail"),
            &snapshot,
            vec![event("selfstate", T0, State::Ok, State::Error)],
        )
        .await
        .unwrap();
    assert_eq!(env.sender.deliveries().len(), 1);

    let err = env
        .dispatcher
        .send_now(&contact("admin", "pager"), &snapshot, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, NotifyError::UnknownSenderType(_)));
}
