//! End-to-end flows across filter, checker, scheduler and dispatcher on an
//! in-memory store with explicit clocks.

use async_trait::async_trait;
use chrono::FixedOffset;
use oxalert_checker::{CheckerConfig, LocalSource, TriggerChecker};
use oxalert_common::id::IdGenerator;
use oxalert_common::metrics::CoreMetrics;
use oxalert_common::types::{
    Contact, EventInfo, Maintenance, MaintenanceInfo, NotificationEvent, Owner, PlottingConfig,
    SelfStateActor, SelfStateValue, State, Subscription, Trigger, TriggerSnapshot, TriggerType,
    TtlState,
};
use oxalert_filter::config::Retentions;
use oxalert_filter::{pipeline, IngestConfig, PatternMatcher};
use oxalert_notify::{
    Dispatcher, EventScheduler, NotifierConfig, SelfStateGate, Sender, SenderRegistry,
    ThrottlingConfig,
};
use oxalert_server::config::SelfStateConfig;
use oxalert_server::selfstate::{override_self_state, SelfStateMonitor};
use oxalert_storage::store::heartbeat::{CHECKER, FILTER};
use oxalert_storage::store::MetricSample;
use oxalert_storage::{Database, MemoryStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Aligned to a 60 second retention.
const T0: i64 = 1_699_999_980;

#[derive(Debug, Clone)]
struct Delivery {
    contact_id: String,
    trigger_id: String,
    transitions: Vec<(State, State)>,
    infos: Vec<Option<EventInfo>>,
}

#[derive(Clone, Default)]
struct RecordingSender {
    log: Arc<Mutex<Vec<Delivery>>>,
    failures: Arc<AtomicU32>,
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
    ) -> oxalert_notify::Result<()> {
        Ok(())
    }

    async fn send_events(
        &self,
        events: &[NotificationEvent],
        contact: &Contact,
        trigger: &TriggerSnapshot,
        _plot: Option<&[u8]>,
        _throttled: bool,
    ) -> anyhow::Result<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("smtp: connection refused");
        }
        self.log.lock().unwrap().push(Delivery {
            contact_id: contact.id.clone(),
            trigger_id: trigger.id.clone(),
            transitions: events.iter().map(|e| (e.old_state, e.state)).collect(),
            infos: events.iter().map(|e| e.info.clone()).collect(),
        });
        Ok(())
    }
}

struct Engine {
    db: Database,
    metrics: Arc<CoreMetrics>,
    checker: TriggerChecker,
    scheduler: EventScheduler,
    dispatcher: Dispatcher,
    sender: RecordingSender,
}

impl Engine {
    fn new() -> Self {
        let db = Database::new(Arc::new(MemoryStore::new()));
        let metrics = Arc::new(CoreMetrics::new());
        let checker = TriggerChecker::new(
            db.clone(),
            Arc::new(LocalSource::new(db.clone())),
            None,
            CheckerConfig {
                fetch_retries: 1,
                ..CheckerConfig::default()
            },
            metrics.clone(),
        );

        let sender = RecordingSender::default();
        let mut registry = SenderRegistry::default();
        registry
            .register("mail", Box::new(sender.clone()), &HashMap::new())
            .unwrap();
        let gate = Arc::new(SelfStateGate::with_ttl(db.clone(), Duration::ZERO));
        let notifier = NotifierConfig {
            sending_timeout_ms: 1000,
            ..NotifierConfig::default()
        };
        let scheduler = EventScheduler::new(
            db.clone(),
            Arc::new(IdGenerator::new(1, 1)),
            gate.clone(),
            notifier.clone(),
            ThrottlingConfig::default(),
            metrics.clone(),
        );
        let dispatcher = Dispatcher::new(db.clone(), Arc::new(registry), gate, notifier, metrics.clone());
        Self {
            db,
            metrics,
            checker,
            scheduler,
            dispatcher,
            sender,
        }
    }

    /// Contact `ops` subscribed to the `prod` tag, and a rising trigger on
    /// `servers.*.cpu`.
    fn seed(&self, ttl: i64) {
        self.db
            .save_trigger(&Trigger {
                id: "cpu".into(),
                name: "CPU load".into(),
                desc: None,
                targets: vec!["servers.*.cpu".into()],
                warn_value: Some(10.0),
                error_value: Some(20.0),
                trigger_type: TriggerType::Rising,
                expression: None,
                tags: vec!["prod".into()],
                ttl,
                ttl_state: TtlState::Nodata,
                schedule: None,
                owner: Owner::Team("ops".into()),
                is_remote: false,
                mute_new_metrics: false,
                check_interval_s: None,
            })
            .unwrap();
        self.db
            .save_contact(&Contact {
                id: "ops".into(),
                contact_type: "mail".into(),
                value: "ops@example.com".into(),
                owner: Owner::Team("ops".into()),
            })
            .unwrap();
        self.db
            .save_subscription(&Subscription {
                id: "ops-prod".into(),
                owner: Owner::Team("ops".into()),
                tags: vec!["prod".into()],
                any_tags: false,
                contacts: vec!["ops".into()],
                schedule: None,
                throttling_enabled: true,
                enabled: true,
                ignore_recoveries: false,
                ignore_warnings: false,
                plotting: PlottingConfig::default(),
                throttling: None,
            })
            .unwrap();
    }

    fn put(&self, metric: &str, ts: i64, value: f64) {
        self.db
            .save_metrics(&[MetricSample {
                name: metric.into(),
                value,
                timestamp: ts,
                retention: 60,
            }])
            .unwrap();
        self.db
            .add_pattern_metrics("servers.*.cpu", &[metric.to_string()])
            .unwrap();
    }

    /// One check, one scheduling pass and one dispatch tick at `now`.
    async fn round(&self, now: i64) -> Vec<NotificationEvent> {
        let outcome = self.checker.check("cpu", now).await.unwrap();
        self.scheduler.process_batch(now).unwrap();
        self.dispatcher.tick(now).await.unwrap();
        outcome.events
    }
}

#[tokio::test]
async fn metric_line_is_delivered_to_subscribed_contact() {
    let engine = Engine::new();
    engine.seed(600);

    let matcher = Arc::new(PatternMatcher::new(1000));
    matcher.refresh(&engine.db.patterns().unwrap());
    let config = IngestConfig {
        batch_interval_ms: 20,
        ..IngestConfig::default()
    };
    let retentions = Retentions::new(&config).unwrap();
    let (ingest, tasks) = pipeline::spawn(
        &config,
        engine.db.clone(),
        matcher,
        retentions,
        engine.metrics.clone(),
    );
    ingest
        .ingest(format!("servers.web1.cpu 25 {T0}").into_bytes())
        .await
        .unwrap();
    ingest
        .ingest(format!("servers.web1.mem 99 {T0}").into_bytes())
        .await
        .unwrap();
    drop(ingest);
    tasks.join().await;

    let events = engine.round(T0 + 10).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].metric, "servers.web1.cpu");

    let deliveries = engine.sender.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].contact_id, "ops");
    assert_eq!(deliveries[0].trigger_id, "cpu");
    assert_eq!(deliveries[0].transitions, vec![(State::Nodata, State::Error)]);

    let snap = engine.metrics.snapshot();
    assert_eq!(snap.metrics_matched, 1);
    assert_eq!(snap.notifications_enqueued, 1);
    assert_eq!(snap.notifications_sent, 1);
    assert_eq!(engine.db.events_len().unwrap(), 0);
    assert_eq!(engine.db.notification_queue_len().unwrap(), 0);
}

#[tokio::test]
async fn maintenance_hides_changes_until_it_ends() {
    let engine = Engine::new();
    engine.seed(3600);

    engine.put("servers.web1.cpu", T0, 25.0);
    engine.round(T0 + 10).await;
    assert_eq!(engine.sender.deliveries().len(), 1);

    let info = MaintenanceInfo {
        started_by: Some("admin".into()),
        started_at: Some(T0 + 20),
        ..MaintenanceInfo::default()
    };
    engine
        .db
        .set_trigger_maintenance(
            "cpu",
            Some(Maintenance {
                until: T0 + 600,
                info: info.clone(),
            }),
        )
        .unwrap();

    engine.put("servers.web1.cpu", T0 + 60, 5.0);
    assert!(engine.round(T0 + 70).await.is_empty());
    assert_eq!(engine.sender.deliveries().len(), 1);

    engine.round(T0 + 700).await;
    let deliveries = engine.sender.deliveries();
    assert_eq!(deliveries.len(), 2);
    assert_eq!(deliveries[1].transitions, vec![(State::Error, State::Ok)]);
    assert_eq!(deliveries[1].infos, vec![Some(EventInfo::MaintenanceEnd { info })]);
}

#[tokio::test]
async fn flapping_metric_is_throttled_after_ten_notifications() {
    let engine = Engine::new();
    engine.seed(3600);

    let mut last = 0;
    for k in 0..12 {
        let ts = T0 + 60 * k;
        let value = if k % 2 == 0 { 25.0 } else { 5.0 };
        engine.put("servers.web1.cpu", ts, value);
        last = ts + 10;
        assert_eq!(engine.round(last).await.len(), 1, "round {k}");
    }

    assert_eq!(engine.sender.deliveries().len(), 10);
    let queued = engine.db.queued_notifications().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].events.len(), 2);
    assert_eq!(queued[0].send_at, T0 + 600 + 10 + 1800);
    assert_eq!(engine.metrics.snapshot().notifications_coalesced, 1);

    engine.dispatcher.tick(last).await.unwrap();
    assert_eq!(engine.sender.deliveries().len(), 10);

    engine.dispatcher.tick(queued[0].send_at).await.unwrap();
    let deliveries = engine.sender.deliveries();
    assert_eq!(deliveries.len(), 11);
    assert_eq!(
        deliveries[10].transitions,
        vec![(State::Ok, State::Error), (State::Error, State::Ok)]
    );
}

#[tokio::test]
async fn failed_delivery_is_retried_later() {
    let engine = Engine::new();
    engine.seed(600);
    engine.sender.failures.store(1, Ordering::SeqCst);

    engine.put("servers.web1.cpu", T0, 25.0);
    engine.round(T0 + 10).await;
    assert!(engine.sender.deliveries().is_empty());

    let queued = engine.db.queued_notifications().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].fail_count, 1);
    assert_eq!(queued[0].send_at, T0 + 10 + 60);

    let early = engine.dispatcher.tick(T0 + 30).await.unwrap();
    assert_eq!(early.fetched, 0);

    let stats = engine.dispatcher.tick(T0 + 70).await.unwrap();
    assert_eq!(stats.sent, 1);
    assert_eq!(engine.sender.deliveries().len(), 1);
    assert_eq!(engine.metrics.snapshot().notifications_requeued, 1);
}

#[tokio::test]
async fn stale_heartbeats_pause_delivery_and_alert_admins() {
    let engine = Engine::new();
    engine.seed(600);
    engine.db.beat(FILTER, T0).unwrap();
    engine.db.beat(CHECKER, T0).unwrap();

    let admin = Contact {
        id: "admin:mail:root@example.com".into(),
        contact_type: "mail".into(),
        value: "root@example.com".into(),
        owner: Owner::Team("admin".into()),
    };
    let monitor = SelfStateMonitor::new(
        engine.db.clone(),
        SelfStateConfig {
            heartbeat_timeout_s: 60,
            ..SelfStateConfig::default()
        },
        T0,
    )
    .with_admins(engine.dispatcher.clone(), vec![admin]);

    assert!(monitor.problems(T0 + 30).is_empty());
    assert!(monitor.evaluate(T0 + 30).await.is_none());

    let problems = monitor.problems(T0 + 200);
    assert_eq!(problems.len(), 2);
    let error = monitor.evaluate(T0 + 200).await.unwrap();
    assert_eq!(error.state, SelfStateValue::Error);
    assert_eq!(error.actor, SelfStateActor::Auto);

    let alerts = engine.sender.deliveries();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].contact_id, "admin:mail:root@example.com");
    assert_eq!(alerts[0].transitions, vec![(State::Ok, State::Error)]);

    // Scheduled notifications wait while the pipeline is unhealthy.
    engine.put("servers.web1.cpu", T0 + 180, 25.0);
    engine.checker.check("cpu", T0 + 210).await.unwrap();
    engine.scheduler.process_batch(T0 + 210).unwrap();
    let paused = engine.dispatcher.tick(T0 + 210).await.unwrap();
    assert!(paused.paused);
    assert_eq!(engine.db.notification_queue_len().unwrap(), 1);

    engine.db.beat(FILTER, T0 + 250).unwrap();
    engine.db.beat(CHECKER, T0 + 250).unwrap();
    let ok = monitor.evaluate(T0 + 260).await.unwrap();
    assert_eq!(ok.state, SelfStateValue::Ok);
    assert_eq!(engine.sender.deliveries().len(), 2);

    let resumed = engine.dispatcher.tick(T0 + 260).await.unwrap();
    assert_eq!(resumed.sent, 1);
    assert_eq!(engine.sender.deliveries().len(), 3);
}

#[tokio::test]
async fn manual_error_is_kept_until_cleared() {
    let engine = Engine::new();
    let monitor = SelfStateMonitor::new(engine.db.clone(), SelfStateConfig::default(), T0);
    engine.db.beat(FILTER, T0).unwrap();
    engine.db.beat(CHECKER, T0).unwrap();

    let pinned = override_self_state(&engine.db, SelfStateValue::Error, T0).unwrap();
    assert_eq!(pinned.actor, SelfStateActor::Manual);

    assert!(monitor.evaluate(T0 + 5).await.is_none());
    let (_, state) = engine.db.get_self_state().unwrap();
    assert_eq!(state.state, SelfStateValue::Error);
    assert!(engine.dispatcher.tick(T0 + 5).await.unwrap().paused);

    let cleared = override_self_state(&engine.db, SelfStateValue::Ok, T0 + 10).unwrap();
    assert_eq!(cleared.state, SelfStateValue::Ok);
    assert_eq!(cleared.actor, SelfStateActor::Auto);
    assert!(!engine.dispatcher.tick(T0 + 10).await.unwrap().paused);
}
