//! oxalert server: wires the metric listener, filter pipeline, trigger
//! checkers, event scheduler, dispatcher and self-state monitor to one store.

pub mod app;
pub mod config;
pub mod listener;
pub mod logging;
pub mod seed;
pub mod selfstate;
