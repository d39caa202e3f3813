use anyhow::Context;
use oxalert_checker::{CheckerConfig, RemoteConfig};
use oxalert_common::types::{Contact, Subscription, Trigger};
use oxalert_filter::IngestConfig;
use oxalert_notify::{NotifierConfig, ThrottlingConfig};
use oxalert_storage::{Database, MemoryStore, SqliteStore};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub checker: CheckerConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub throttling: ThrottlingConfig,
    #[serde(default)]
    pub selfstate: SelfStateConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl ServerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{path}'"))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file '{path}'"))?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_ingest_addr")]
    pub ingest_addr: String,
    /// Longer lines are counted as invalid and skipped.
    #[serde(default = "default_max_line_len")]
    pub max_line_len: usize,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            ingest_addr: default_ingest_addr(),
            max_line_len: default_max_line_len(),
        }
    }
}

fn default_ingest_addr() -> String {
    "0.0.0.0:2003".to_string()
}

fn default_max_line_len() -> usize {
    4096
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "data/oxalert.db".to_string()
}

impl StoreConfig {
    pub fn open(&self) -> anyhow::Result<Database> {
        let db = match self.backend {
            StoreBackend::Sqlite => {
                let store = SqliteStore::open(Path::new(&self.path))
                    .with_context(|| format!("Failed to open store at '{}'", self.path))?;
                Database::new(Arc::new(store))
            }
            StoreBackend::Memory => Database::new(Arc::new(MemoryStore::new())),
        };
        db.ping().context("Store is not reachable")?;
        Ok(db)
    }
}

/// Snowflake coordinates; each process sharing a store needs its own pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_part")]
    pub machine_id: i32,
    #[serde(default = "default_node_part")]
    pub node_id: i32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            machine_id: default_node_part(),
            node_id: default_node_part(),
        }
    }
}

fn default_node_part() -> i32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfStateConfig {
    #[serde(default = "default_selfstate_enabled")]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_timeout_s")]
    pub heartbeat_timeout_s: i64,
    #[serde(default = "default_selfstate_check_interval_s")]
    pub check_interval_s: u64,
    #[serde(default = "default_remote_failure_threshold")]
    pub remote_failure_threshold: u64,
}

impl Default for SelfStateConfig {
    fn default() -> Self {
        Self {
            enabled: default_selfstate_enabled(),
            heartbeat_timeout_s: default_heartbeat_timeout_s(),
            check_interval_s: default_selfstate_check_interval_s(),
            remote_failure_threshold: default_remote_failure_threshold(),
        }
    }
}

fn default_selfstate_enabled() -> bool {
    true
}

fn default_heartbeat_timeout_s() -> i64 {
    60
}

fn default_selfstate_check_interval_s() -> u64 {
    5
}

fn default_remote_failure_threshold() -> u64 {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "oxalert=info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_log_interval_s")]
    pub log_interval_s: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            log_interval_s: default_metrics_log_interval_s(),
        }
    }
}

fn default_metrics_log_interval_s() -> u64 {
    60
}

// ---- Seed file types (used by the `init-seed` CLI subcommand) ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub contacts: Vec<Contact>,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.listen.ingest_addr, "0.0.0.0:2003");
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.ingest.batch_capacity, 10_000);
        assert_eq!(config.checker.interval_s, 10);
        assert_eq!(config.notifier.max_retries, 3);
        assert_eq!(config.throttling.policy.tier1_threshold, 10);
        assert_eq!(config.throttling.max_events_per_notification, 100);
        assert_eq!(config.selfstate.heartbeat_timeout_s, 60);
        assert_eq!(config.log.format, LogFormat::Text);
    }

    #[test]
    fn sections_override_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            [store]
            backend = "memory"

            [throttling]
            tier1_threshold = 3
            tier2_delay_s = 600

            [notifier]
            sending_timeout_ms = 250
            admin_contacts = [{ type = "log", value = "ops" }]

            [[notifier.senders]]
            type = "log"
            settings = { level = "warn" }

            [log]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.throttling.policy.tier1_threshold, 3);
        assert_eq!(config.throttling.policy.tier2_threshold, 20);
        assert_eq!(config.throttling.policy.tier2_delay_s, 600);
        assert_eq!(config.notifier.sending_timeout_ms, 250);
        assert_eq!(config.notifier.admin_contacts[0].value, "ops");
        assert_eq!(config.notifier.senders[0].settings["level"], "warn");
        assert_eq!(config.log.format, LogFormat::Json);
        assert!(config.store.open().is_ok());
    }
}
