use crate::error::Result;
use crate::kv::KvStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

pub mod check;
pub mod contact;
pub mod event;
pub mod heartbeat;
pub mod lock;
pub mod maintenance;
pub mod metric;
pub mod notification;
pub mod pattern;
pub mod selfstate;
pub mod subscription;
pub mod throttling;
pub mod trigger;

pub use maintenance::TriggerMaintenance;
pub use metric::MetricSample;
pub use notification::PendingNotification;
pub use throttling::ThrottleRecord;

/// Typed access layer over a [`KvStore`].
///
/// The methods are grouped by entity in the submodules; all of them are
/// synchronous and short, so async callers invoke them directly.
#[derive(Clone)]
pub struct Database {
    kv: Arc<dyn KvStore>,
}

impl Database {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// The underlying key-value store.
    pub fn kv(&self) -> &dyn KvStore {
        self.kv.as_ref()
    }

    pub fn ping(&self) -> Result<()> {
        self.kv.ping()
    }

    pub fn purge_expired(&self) -> Result<usize> {
        self.kv.purge_expired()
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.kv.set(key, &raw, None)
    }
}
