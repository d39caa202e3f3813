use serde::{Deserialize, Serialize};

/// `[checker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckerConfig {
    /// 0 selects CPU count × 4.
    #[serde(default)]
    pub local_workers: usize,
    #[serde(default)]
    pub remote_workers: usize,
    #[serde(default = "default_interval_s")]
    pub interval_s: u64,
    #[serde(default = "default_lock_ttl_s")]
    pub lock_ttl_s: u64,
    #[serde(default = "default_window_pad_s")]
    pub window_pad_s: i64,
    #[serde(default = "default_metrics_ttl_s")]
    pub metrics_ttl_s: i64,
    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: u32,
    #[serde(default = "default_reminder_interval_s")]
    pub reminder_interval_s: i64,
}

fn default_interval_s() -> u64 {
    10
}

fn default_lock_ttl_s() -> u64 {
    30
}

fn default_window_pad_s() -> i64 {
    600
}

fn default_metrics_ttl_s() -> i64 {
    3 * 3600
}

fn default_fetch_retries() -> u32 {
    3
}

fn default_reminder_interval_s() -> i64 {
    24 * 3600
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            local_workers: 0,
            remote_workers: 0,
            interval_s: default_interval_s(),
            lock_ttl_s: default_lock_ttl_s(),
            window_pad_s: default_window_pad_s(),
            metrics_ttl_s: default_metrics_ttl_s(),
            fetch_retries: default_fetch_retries(),
            reminder_interval_s: default_reminder_interval_s(),
        }
    }
}

impl CheckerConfig {
    pub fn local_pool_size(&self) -> usize {
        resolve_workers(self.local_workers)
    }

    pub fn remote_pool_size(&self) -> usize {
        resolve_workers(self.remote_workers)
    }
}

fn resolve_workers(configured: usize) -> usize {
    if configured > 0 {
        return configured;
    }
    std::thread::available_parallelism()
        .map(|n| n.get() * 4)
        .unwrap_or(4)
}

/// `[remote]` section: Graphite-compatible render API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Empty means the remote source is not configured.
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_remote_timeout_s")]
    pub timeout_s: u64,
}

fn default_remote_timeout_s() -> u64 {
    60
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_s: default_remote_timeout_s(),
        }
    }
}
