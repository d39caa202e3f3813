//! Persistence layer for oxalert.
//!
//! [`kv::KvStore`] is the abstract store the core consumes: plain keys with
//! optional expiry, sets, integer-scored sorted sets and lists, plus the
//! compare-and-set and set-if-absent primitives used for locks, throttling
//! and the self-state record. [`memory::MemoryStore`] and
//! [`sqlite::SqliteStore`] implement it; [`store::Database`] layers typed
//! accessors for every entity on top.

pub mod error;
pub mod keys;
pub mod kv;
pub mod memory;
pub mod sqlite;
pub mod store;


pub use error::{Result, StorageError};
pub use kv::KvStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::Database;
