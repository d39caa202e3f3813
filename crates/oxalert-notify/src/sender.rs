use crate::error::{NotifyError, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use oxalert_common::types::{Contact, NotificationEvent, TriggerSnapshot};
use std::collections::HashMap;

/// Delivers notifications to one kind of contact (`contact.type`).
///
/// A sender is initialised once at startup with its free-form settings and
/// is then shared by every dispatch worker. `send_events` must complete or
/// fail within the caller's timeout; the dispatcher cancels it otherwise.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Prepares the sender. `location` and `datetime_format` control how
    /// event timestamps are rendered.
    fn init(
        &mut self,
        settings: &HashMap<String, String>,
        location: FixedOffset,
        datetime_format: &str,
    ) -> Result<()>;

    /// Delivers a batch of events for one trigger to one contact.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery failed; the dispatcher retries it.
    async fn send_events(
        &self,
        events: &[NotificationEvent],
        contact: &Contact,
        trigger: &TriggerSnapshot,
        plot: Option<&[u8]>,
        throttled: bool,
    ) -> anyhow::Result<()>;
}

/// Writes deliveries to the tracing log.
///
/// Recognised settings: `level` (`info` or `warn`, default `info`).
pub struct LogSender {
    warn: bool,
    location: FixedOffset,
    datetime_format: String,
}

impl Default for LogSender {
    fn default() -> Self {
        Self {
            warn: false,
            location: Utc.fix(),
            datetime_format: crate::config::DEFAULT_DATETIME_FORMAT.to_string(),
        }
    }
}

impl LogSender {
    fn format_ts(&self, ts: i64) -> String {
        match DateTime::from_timestamp(ts, 0) {
            Some(dt) => dt
                .with_timezone(&self.location)
                .format(&self.datetime_format)
                .to_string(),
            None => ts.to_string(),
        }
    }
}

#[async_trait]
impl Sender for LogSender {
    fn init(
        &mut self,
        settings: &HashMap<String, String>,
        location: FixedOffset,
        datetime_format: &str,
    ) -> Result<()> {
        self.warn = match settings.get("level").map(String::as_str) {
            None | Some("info") => false,
            Some("warn") => true,
            Some(other) => {
                return Err(NotifyError::InvalidConfig(format!(
                    "log sender level must be 'info' or 'warn', got '{other}'"
                )))
            }
        };
        self.location = location;
        self.datetime_format = datetime_format.to_string();
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
        for event in events {
            let at = self.format_ts(event.timestamp);
            let metric = if event.is_trigger_event {
                trigger.name.as_str()
            } else {
                event.metric.as_str()
            };
            if self.warn {
                tracing::warn!(
                    contact = %contact.value,
                    trigger_id = %trigger.id,
                    metric = %metric,
                    transition = %format!("{} -> {}", event.old_state, event.state),
                    at = %at,
                    throttled,
                    plot_bytes = plot.map_or(0, |p| p.len()),
                    "Notification"
                );
            } else {
                tracing::info!(
                    contact = %contact.value,
                    trigger_id = %trigger.id,
                    metric = %metric,
                    transition = %format!("{} -> {}", event.old_state, event.state),
                    at = %at,
                    throttled,
                    plot_bytes = plot.map_or(0, |p| p.len()),
                    "Notification"
                );
            }
        }
        Ok(())
    }
}
