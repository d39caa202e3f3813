//! Metric ingestion filter.
//!
//! Raw lines flow through parse workers and match workers into a batcher
//! that persists matched samples at least once per batch interval. Matching
//! runs against a [`index::PatternIndex`] snapshot that the
//! [`refresher::PatternRefresher`] rebuilds from the store's pattern set.

pub mod config;
pub mod error;
pub mod index;
pub mod parser;
pub mod pipeline;
pub mod refresher;
pub mod tags;
pub mod wildcard;


pub use config::IngestConfig;
pub use error::{FilterError, Result};
pub use index::{PatternIndex, PatternMatcher};
pub use pipeline::{IngestHandle, MatchedSample, PipelineTasks};
pub use refresher::PatternRefresher;
