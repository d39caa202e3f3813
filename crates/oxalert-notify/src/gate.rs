use oxalert_storage::Database;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Cached read of the global self-state.
///
/// The record is re-read at most once per `ttl`; an unreadable store counts
/// as closed, since nothing could be delivered or scheduled anyway.
pub struct SelfStateGate {
    db: Database,
    ttl: Duration,
    cached: Mutex<Option<(Instant, bool)>>,
}

impl SelfStateGate {
    pub fn new(db: Database) -> Self {
        Self::with_ttl(db, Duration::from_secs(1))
    }

    pub fn with_ttl(db: Database, ttl: Duration) -> Self {
        Self {
            db,
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// True while the self-state is OK.
    pub fn is_open(&self) -> bool {
        let mut cached = self
            .cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some((at, open)) = *cached {
            if at.elapsed() < self.ttl {
                return open;
            }
        }
        let open = match self.db.get_self_state() {
            Ok((_, state)) => state.is_ok(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read self-state, holding notifications");
                false
            }
        };
        *cached = Some((Instant::now(), open));
        open
    }

    /// Drops the cached value so the next read hits the store.
    pub fn invalidate(&self) {
        *self
            .cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}
