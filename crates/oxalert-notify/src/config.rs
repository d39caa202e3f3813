use oxalert_common::types::{Contact, Owner, ThrottlingPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// `[notifier]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default = "default_sending_timeout_ms")]
    pub sending_timeout_ms: u64,
    #[serde(default = "default_resending_timeout_s")]
    pub resending_timeout_s: i64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_plot_timeout_s")]
    pub plot_timeout_s: u64,
    #[serde(default = "default_send_workers")]
    pub send_workers: usize,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_selfstate_pause_s")]
    pub selfstate_pause_s: u64,
    #[serde(default = "default_event_batch")]
    pub event_batch: usize,
    /// Upper bound of notifications popped from the queue per tick.
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,
    #[serde(default)]
    pub admin_contacts: Vec<AdminContact>,
    /// Senders to register. When empty only the `log` sender is available.
    #[serde(default)]
    pub senders: Vec<SenderConfig>,
    /// Minutes east of UTC used when senders render timestamps.
    #[serde(default)]
    pub timezone_offset_min: i32,
    #[serde(default = "default_datetime_format")]
    pub datetime_format: String,
}

fn default_sending_timeout_ms() -> u64 {
    10
}

fn default_resending_timeout_s() -> i64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_plot_timeout_s() -> u64 {
    5
}

fn default_send_workers() -> usize {
    16
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_selfstate_pause_s() -> u64 {
    10
}

fn default_event_batch() -> usize {
    100
}

fn default_fetch_limit() -> usize {
    1000
}

fn default_datetime_format() -> String {
    DEFAULT_DATETIME_FORMAT.to_string()
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            sending_timeout_ms: default_sending_timeout_ms(),
            resending_timeout_s: default_resending_timeout_s(),
            max_retries: default_max_retries(),
            plot_timeout_s: default_plot_timeout_s(),
            send_workers: default_send_workers(),
            tick_ms: default_tick_ms(),
            selfstate_pause_s: default_selfstate_pause_s(),
            event_batch: default_event_batch(),
            fetch_limit: default_fetch_limit(),
            admin_contacts: Vec::new(),
            senders: Vec::new(),
            timezone_offset_min: 0,
            datetime_format: default_datetime_format(),
        }
    }
}

/// One `[[notifier.senders]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    #[serde(rename = "type")]
    pub sender_type: String,
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

/// A destination for self-state notifications, given inline in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminContact {
    #[serde(rename = "type")]
    pub contact_type: String,
    pub value: String,
}

impl AdminContact {
    pub fn to_contact(&self) -> Contact {
        Contact {
            id: format!("admin:{}:{}", self.contact_type, self.value),
            contact_type: self.contact_type.clone(),
            value: self.value.clone(),
            owner: Owner::Team("admin".to_string()),
        }
    }
}

/// `[throttling]` section: the policy used by subscriptions that do not
/// carry their own, plus the coalescing cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottlingConfig {
    #[serde(flatten)]
    pub policy: ThrottlingPolicy,
    #[serde(default = "default_max_events_per_notification")]
    pub max_events_per_notification: usize,
}

fn default_max_events_per_notification() -> usize {
    100
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            policy: ThrottlingPolicy::default(),
            max_events_per_notification: default_max_events_per_notification(),
        }
    }
}
