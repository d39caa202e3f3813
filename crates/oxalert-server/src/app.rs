use crate::config::ServerConfig;
use crate::listener;
use crate::selfstate::SelfStateMonitor;
use anyhow::Context;
use oxalert_checker::{CheckOutcome, CheckerPool, LocalSource, MetricSource, RemoteSource, TriggerChecker};
use oxalert_common::id::IdGenerator;
use oxalert_common::metrics::CoreMetrics;
use oxalert_common::shutdown::{self, ShutdownSignal, ShutdownTrigger};
use oxalert_filter::config::Retentions;
use oxalert_filter::{PatternMatcher, PatternRefresher, PipelineTasks};
use oxalert_notify::{Dispatcher, EventScheduler, SelfStateGate, SenderRegistry};
use oxalert_storage::Database;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Every stage of the engine wired to one store.
pub struct App {
    config: ServerConfig,
    db: Database,
    metrics: Arc<CoreMetrics>,
}

/// Handle to the running services.
pub struct Running {
    trigger: ShutdownTrigger,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    pipeline: PipelineTasks,
    ingest_addr: SocketAddr,
    dispatcher: Dispatcher,
}

impl App {
    /// Opens the configured store. Fails when it is unreachable.
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        let db = config.store.open()?;
        Ok(Self::with_database(config, db))
    }

    pub fn with_database(config: ServerConfig, db: Database) -> Self {
        Self {
            config,
            db,
            metrics: Arc::new(CoreMetrics::new()),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn metrics(&self) -> Arc<CoreMetrics> {
        self.metrics.clone()
    }

    fn build_checker(&self) -> anyhow::Result<(Arc<TriggerChecker>, Option<Arc<RemoteSource>>)> {
        let remote = if self.config.remote.url.is_empty() {
            None
        } else {
            let source = RemoteSource::new(&self.config.remote)
                .context("Failed to set up remote metric source")?;
            Some(Arc::new(source))
        };
        let checker = TriggerChecker::new(
            self.db.clone(),
            Arc::new(LocalSource::new(self.db.clone())),
            remote.clone().map(|r| r as Arc<dyn MetricSource>),
            self.config.checker.clone(),
            self.metrics.clone(),
        );
        Ok((Arc::new(checker), remote))
    }

    fn build_dispatcher(&self, gate: Arc<SelfStateGate>) -> anyhow::Result<Dispatcher> {
        let notifier = &self.config.notifier;
        let registry = SenderRegistry::from_config(
            &notifier.senders,
            notifier.timezone_offset_min,
            &notifier.datetime_format,
        )
        .context("Failed to build sender registry")?;
        Ok(Dispatcher::new(
            self.db.clone(),
            Arc::new(registry),
            gate,
            notifier.clone(),
            self.metrics.clone(),
        ))
    }

    /// Runs a single check of `trigger_id` at the current time.
    pub async fn check_once(&self, trigger_id: &str) -> anyhow::Result<CheckOutcome> {
        let (checker, _) = self.build_checker()?;
        checker
            .check(trigger_id, oxalert_common::now_ts())
            .await
            .with_context(|| format!("Check of trigger '{trigger_id}' failed"))
    }

    /// Binds the listener and spawns every service.
    pub async fn start(&self) -> anyhow::Result<Running> {
        let config = &self.config;
        let (trigger, signal) = shutdown::channel();
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let matcher = Arc::new(PatternMatcher::new(config.ingest.fallback_warn_threshold));
        let mut refresher = PatternRefresher::new(
            self.db.clone(),
            matcher.clone(),
            Duration::from_millis(config.ingest.pattern_refresh_ms.max(1)),
        );
        refresher.refresh_once();
        let retentions =
            Retentions::new(&config.ingest).context("Invalid [ingest] retention pattern")?;
        let (ingest, pipeline) = oxalert_filter::pipeline::spawn(
            &config.ingest,
            self.db.clone(),
            matcher,
            retentions,
            self.metrics.clone(),
        );

        let tcp = TcpListener::bind(&config.listen.ingest_addr)
            .await
            .with_context(|| format!("Failed to bind metric listener on {}", config.listen.ingest_addr))?;
        let ingest_addr = tcp.local_addr()?;
        tasks.push((
            "listener",
            tokio::spawn(listener::serve(
                tcp,
                ingest,
                config.listen.max_line_len,
                self.metrics.clone(),
                signal.clone(),
            )),
        ));
        tasks.push(("pattern-refresher", tokio::spawn(refresher.run(signal.clone()))));

        let (checker, remote) = self.build_checker()?;
        tasks.push((
            "checker-local",
            tokio::spawn(CheckerPool::new(checker.clone(), false).run(signal.clone())),
        ));
        tasks.push((
            "checker-remote",
            tokio::spawn(CheckerPool::new(checker, true).run(signal.clone())),
        ));

        let gate = Arc::new(SelfStateGate::new(self.db.clone()));
        let dispatcher = self.build_dispatcher(gate.clone())?;
        let scheduler = EventScheduler::new(
            self.db.clone(),
            Arc::new(IdGenerator::new(config.node.machine_id, config.node.node_id)),
            gate,
            config.notifier.clone(),
            config.throttling.clone(),
            self.metrics.clone(),
        );
        tasks.push(("event-scheduler", tokio::spawn(scheduler.run(signal.clone()))));
        tasks.push(("dispatcher", tokio::spawn(dispatcher.clone().run(signal.clone()))));

        let admins = config
            .notifier
            .admin_contacts
            .iter()
            .map(|a| a.to_contact())
            .collect();
        let mut monitor = SelfStateMonitor::new(
            self.db.clone(),
            config.selfstate.clone(),
            oxalert_common::now_ts(),
        )
        .with_admins(dispatcher.clone(), admins);
        if let Some(remote) = remote {
            monitor = monitor.with_remote(remote);
        }
        tasks.push(("selfstate", tokio::spawn(monitor.run(signal.clone()))));

        tasks.push((
            "housekeeping",
            tokio::spawn(housekeeping(
                self.db.clone(),
                self.metrics.clone(),
                Duration::from_secs(config.metrics.log_interval_s.max(1)),
                signal,
            )),
        ));

        tracing::info!(ingest = %ingest_addr, services = tasks.len(), "oxalert started");
        Ok(Running {
            trigger,
            tasks,
            pipeline,
            ingest_addr,
            dispatcher,
        })
    }
}

impl Running {
    pub fn ingest_addr(&self) -> SocketAddr {
        self.ingest_addr
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Asks every service to finish its in-flight unit and waits up to
    /// `timeout`. Services still running then are aborted. Returns whether
    /// everything stopped in time.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        let started = std::time::Instant::now();
        self.trigger.trigger();
        let deadline = Instant::now() + timeout;
        let mut clean = true;

        for (name, mut handle) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(service = name, error = %e, "Service panicked"),
                Err(_) => {
                    tracing::warn!(service = name, "Service did not stop in time, aborting");
                    handle.abort();
                    clean = false;
                }
            }
        }
        if tokio::time::timeout_at(deadline, self.pipeline.join())
            .await
            .is_err()
        {
            tracing::warn!("Filter pipeline did not drain in time, abandoning pending samples");
            clean = false;
        }

        tracing::info!(
            elapsed = %crate::logging::format_elapsed(started.elapsed()),
            clean,
            "oxalert stopped"
        );
        clean
    }
}

/// Periodically logs the operator metrics and purges expired keys.
async fn housekeeping(
    db: Database,
    metrics: Arc<CoreMetrics>,
    every: Duration,
    mut shutdown: ShutdownSignal,
) {
    while !shutdown.sleep(every).await {
        if let Ok(depth) = db.events_len() {
            metrics.event_queue_depth.set(depth as i64);
        }
        if let Ok(depth) = db.notification_queue_len() {
            metrics.notification_queue_depth.set(depth as i64);
        }
        if let Ok(throttled) = db.throttled_records() {
            metrics.throttled_records.set(throttled as i64);
        }
        match serde_json::to_string(&metrics.snapshot()) {
            Ok(snapshot) => tracing::info!(metrics = %snapshot, "Metrics snapshot"),
            Err(e) => tracing::warn!(error = %e, "Failed to encode metrics snapshot"),
        }
        match db.purge_expired() {
            Ok(removed) if removed > 0 => tracing::debug!(removed, "Purged expired keys"),
            Err(e) => tracing::error!(error = %e, "Purging expired keys failed"),
            _ => {}
        }
    }
}
