//! Key layout shared by every component that talks to the store.

pub const PATTERNS: &str = "patterns";
pub const TRIGGERS_LOCAL: &str = "triggers:local";
pub const TRIGGERS_REMOTE: &str = "triggers:remote";
pub const ANY_TAG_SUBSCRIPTIONS: &str = "any-tag-subscriptions";
pub const EVENTS: &str = "notifier-events";
pub const AUDIT: &str = "notifier-audit";
pub const NOTIFICATION_QUEUE: &str = "notifier-notifications";
pub const SELF_STATE: &str = "selfstate";
pub const THROTTLING_PREFIX: &str = "throttling:";

pub fn trigger(id: &str) -> String {
    format!("trigger:{id}")
}

pub fn trigger_index(remote: bool) -> &'static str {
    if remote {
        TRIGGERS_REMOTE
    } else {
        TRIGGERS_LOCAL
    }
}

pub fn triggers_to_check(remote: bool) -> String {
    format!("triggers-to-check:{}", if remote { "remote" } else { "local" })
}

pub fn check_data(trigger_id: &str) -> String {
    format!("check-data:{trigger_id}")
}

pub fn trigger_lock(trigger_id: &str) -> String {
    format!("trigger-lock:{trigger_id}")
}

pub fn maintenance(trigger_id: &str) -> String {
    format!("maintenance:{trigger_id}")
}

pub fn pattern_triggers(pattern: &str) -> String {
    format!("pattern-triggers:{pattern}")
}

pub fn pattern_metrics(pattern: &str) -> String {
    format!("pattern-metrics:{pattern}")
}

pub fn metric_data(metric: &str) -> String {
    format!("metric-data:{metric}")
}

pub fn metric_retention(metric: &str) -> String {
    format!("metric-retention:{metric}")
}

pub fn subscription(id: &str) -> String {
    format!("subscription:{id}")
}

pub fn tag_subscriptions(tag: &str) -> String {
    format!("tag-subscriptions:{tag}")
}

pub fn contact(id: &str) -> String {
    format!("contact:{id}")
}

pub fn pending(contact_id: &str, trigger_id: &str, tier: &str) -> String {
    format!("pending:{contact_id}:{trigger_id}:{tier}")
}

pub fn throttling(contact_id: &str, trigger_id: &str) -> String {
    format!("{THROTTLING_PREFIX}{contact_id}:{trigger_id}")
}

pub fn dedup(key: &str) -> String {
    format!("dedup:{key}")
}

pub fn heartbeat(component: &str) -> String {
    format!("heartbeat:{component}")
}
