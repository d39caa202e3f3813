use crate::index::PatternMatcher;
use oxalert_common::shutdown::ShutdownSignal;
use oxalert_storage::Database;
use std::sync::Arc;
use std::time::Duration;

/// Reloads the pattern list from the store and republishes the index when
/// it changed.
pub struct PatternRefresher {
    db: Database,
    matcher: Arc<PatternMatcher>,
    every: Duration,
    last: Option<Vec<String>>,
}

impl PatternRefresher {
    pub fn new(db: Database, matcher: Arc<PatternMatcher>, every: Duration) -> Self {
        Self {
            db,
            matcher,
            every,
            last: None,
        }
    }

    /// One refresh. Returns true if a new snapshot was published. Store
    /// errors keep the current snapshot.
    pub fn refresh_once(&mut self) -> bool {
        let mut patterns = match self.db.patterns() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load patterns, keeping current index");
                return false;
            }
        };
        patterns.sort();
        if self.last.as_ref() == Some(&patterns) {
            return false;
        }
        let indexed = self.matcher.refresh(&patterns);
        tracing::info!(patterns = patterns.len(), indexed, "Pattern index refreshed");
        self.last = Some(patterns);
        true
    }

    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        tracing::info!(every_ms = self.every.as_millis() as u64, "Pattern refresher started");
        loop {
            self.refresh_once();
            if shutdown.sleep(self.every).await {
                break;
            }
        }
        tracing::info!("Pattern refresher stopped");
    }
}
