//! Data model shared by every oxalert stage.
//!
//! Triggers, check data, notification events, subscriptions and the
//! scheduled-notification record live in [`types`]. Weekly delivery windows
//! are in [`schedule`]; [`metrics`] holds the in-process operator counters
//! and [`shutdown`] the cooperative stop signal every loop listens to.

pub mod id;
pub mod metrics;
pub mod schedule;
pub mod shutdown;
pub mod types;


/// Current unix time in seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
