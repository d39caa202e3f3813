//! Notification delivery for oxalert.
//!
//! [`scheduler::EventScheduler`] consumes checker events, matches them to
//! subscriptions and decides when each contact hears about them, applying
//! per `(contact, trigger)` throttling and coalescing. [`dispatcher::Dispatcher`]
//! drains the resulting time-keyed queue and calls the [`sender::Sender`]
//! registered for each contact type. Both stop while the global self-state
//! is ERROR.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gate;
pub mod plot;
pub mod registry;
pub mod scheduler;
pub mod sender;

#[cfg(test)]
mod tests;

pub use config::{AdminContact, NotifierConfig, SenderConfig, ThrottlingConfig};
pub use dispatcher::{DispatchStats, Dispatcher};
pub use error::{NotifyError, Result};
pub use gate::SelfStateGate;
pub use plot::PlotRenderer;
pub use registry::SenderRegistry;
pub use scheduler::EventScheduler;
pub use sender::{LogSender, Sender};
