//! Trigger checker.
//!
//! [`check::TriggerChecker`] evaluates one trigger against its metric window
//! and persists the resulting check data and events. [`worker::CheckerPool`]
//! schedules triggers of the local and remote partitions onto bounded task
//! pools. Metrics come from a [`source::MetricSource`]: the store-backed
//! [`source::LocalSource`] or the Graphite-compatible
//! [`source::RemoteSource`].

pub mod check;
pub mod config;
pub mod error;
pub mod expression;
pub mod source;
pub mod worker;


pub use check::{CheckOutcome, TriggerChecker};
pub use config::{CheckerConfig, RemoteConfig};
pub use error::{CheckError, Result};
pub use source::{FetchResult, LocalSource, MetricData, MetricSource, RemoteSource};
pub use worker::CheckerPool;
