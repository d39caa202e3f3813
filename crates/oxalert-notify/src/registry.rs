use crate::config::SenderConfig;
use crate::error::{NotifyError, Result};
use crate::sender::{LogSender, Sender};
use chrono::{FixedOffset, Offset, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// Static map `contact type -> sender`, built once at startup.
///
/// # Examples
///
/// ```
/// use oxalert_notify::registry::SenderRegistry;
///
/// let registry = SenderRegistry::default();
/// assert!(registry.has_sender("log"));
/// assert!(!registry.has_sender("pager"));
/// ```
pub struct SenderRegistry {
    senders: HashMap<String, Arc<dyn Sender>>,
    location: FixedOffset,
    datetime_format: String,
}

impl SenderRegistry {
    pub fn new(location: FixedOffset, datetime_format: &str) -> Self {
        Self {
            senders: HashMap::new(),
            location,
            datetime_format: datetime_format.to_string(),
        }
    }

    /// Builds the registry from `[[notifier.senders]]`. Only built-in types
    /// are accepted; an empty list registers the `log` sender.
    pub fn from_config(
        configs: &[SenderConfig],
        timezone_offset_min: i32,
        datetime_format: &str,
    ) -> Result<Self> {
        let location = FixedOffset::east_opt(timezone_offset_min * 60).ok_or_else(|| {
            NotifyError::InvalidConfig(format!(
                "timezone offset out of range: {timezone_offset_min} minutes"
            ))
        })?;
        let mut registry = Self::new(location, datetime_format);
        if configs.is_empty() {
            registry.register("log", Box::new(LogSender::default()), &HashMap::new())?;
            return Ok(registry);
        }
        for cfg in configs {
            let sender: Box<dyn Sender> = match cfg.sender_type.as_str() {
                "log" => Box::new(LogSender::default()),
                other => return Err(NotifyError::UnknownSenderType(other.to_string())),
            };
            registry.register(&cfg.sender_type, sender, &cfg.settings)?;
        }
        Ok(registry)
    }

    /// Initialises `sender` with `settings` and makes it available for
    /// contacts of `type_name`, replacing any previous registration.
    pub fn register(
        &mut self,
        type_name: &str,
        mut sender: Box<dyn Sender>,
        settings: &HashMap<String, String>,
    ) -> Result<()> {
        sender.init(settings, self.location, &self.datetime_format)?;
        self.senders.insert(type_name.to_string(), Arc::from(sender));
        tracing::info!(sender_type = type_name, "Sender registered");
        Ok(())
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<dyn Sender>> {
        self.senders.get(type_name).cloned()
    }

    pub fn has_sender(&self, type_name: &str) -> bool {
        self.senders.contains_key(type_name)
    }

    pub fn sender_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.senders.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for SenderRegistry {
    fn default() -> Self {
        let mut registry = Self::new(Utc.fix(), crate::config::DEFAULT_DATETIME_FORMAT);
        if let Err(e) = registry.register("log", Box::new(LogSender::default()), &HashMap::new()) {
            tracing::error!(error = %e, "Failed to register built-in log sender");
        }
        registry
    }
}
