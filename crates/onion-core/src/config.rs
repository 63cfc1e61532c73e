//! Client configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DESIRED_GUARD_COUNT, FAILURE_THRESHOLD, MINIMUM_PATH_COUNT, MIN_SNODE_POOL_COUNT,
    ONION_REQUEST_HOPS,
};
use crate::Result;

/// A trusted bootstrap endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedUrl {
    pub url: String,
}

impl SeedUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn json_rpc_url(&self) -> String {
        format!("{}/json_rpc", self.url)
    }
}

/// Tunables for path building, failure handling and retries.
///
/// Durations are stored as milliseconds so the JSON file stays readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnionConfig {
    /// Number of paths (and guard nodes) maintained
    pub path_count: usize,
    /// Hops per path, guard included
    pub hops: usize,
    /// Path failures before the guard is evicted and the slot rebuilt
    pub path_failure_threshold: u32,
    /// Snode failures before the node is evicted
    pub snode_failure_threshold: u32,
    /// Pool size under which a seed refetch happens
    pub min_pool_size: usize,
    /// Fewer built paths than this forces a rebuild before sending
    pub min_path_count: usize,
    pub seed_urls: Vec<SeedUrl>,
    pub seed_attempts: u32,
    pub seed_min_timeout_ms: u64,
    pub seed_backoff_factor: u32,
    pub onion_fetch_attempts: u32,
    pub onion_fetch_min_timeout_ms: u64,
    pub path_build_attempts: u32,
    pub path_build_min_timeout_ms: u64,
    /// Rounds of guard probing before giving up
    pub guard_probe_rounds: u32,
    pub message_send_attempts: u32,
    pub message_retry_min_timeout_ms: u64,
    pub open_group_attempts: u32,
    pub open_group_min_timeout_ms: u64,
}

impl Default for OnionConfig {
    fn default() -> Self {
        Self {
            path_count: DESIRED_GUARD_COUNT,
            hops: ONION_REQUEST_HOPS,
            path_failure_threshold: FAILURE_THRESHOLD,
            snode_failure_threshold: FAILURE_THRESHOLD,
            min_pool_size: MIN_SNODE_POOL_COUNT,
            min_path_count: MINIMUM_PATH_COUNT,
            seed_urls: vec![
                SeedUrl::new("https://seed1.getsession.org"),
                SeedUrl::new("https://seed2.getsession.org"),
                SeedUrl::new("https://seed3.getsession.org"),
            ],
            seed_attempts: 4,
            seed_min_timeout_ms: 1_000,
            seed_backoff_factor: 2,
            onion_fetch_attempts: 4,
            onion_fetch_min_timeout_ms: 100,
            path_build_attempts: 4,
            path_build_min_timeout_ms: 1_000,
            guard_probe_rounds: 6,
            message_send_attempts: 3,
            message_retry_min_timeout_ms: 1_000,
            open_group_attempts: 3,
            open_group_min_timeout_ms: 1_000,
        }
    }
}

impl OnionConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&data)?;
        Ok(config)
    }

    /// Save to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn seed_min_timeout(&self) -> Duration {
        Duration::from_millis(self.seed_min_timeout_ms)
    }

    pub fn onion_fetch_min_timeout(&self) -> Duration {
        Duration::from_millis(self.onion_fetch_min_timeout_ms)
    }

    pub fn path_build_min_timeout(&self) -> Duration {
        Duration::from_millis(self.path_build_min_timeout_ms)
    }

    pub fn message_retry_min_timeout(&self) -> Duration {
        Duration::from_millis(self.message_retry_min_timeout_ms)
    }

    pub fn open_group_min_timeout(&self) -> Duration {
        Duration::from_millis(self.open_group_min_timeout_ms)
    }

    /// Config with every retry delay zeroed, for tests
    pub fn without_delays(mut self) -> Self {
        self.seed_min_timeout_ms = 0;
        self.onion_fetch_min_timeout_ms = 0;
        self.path_build_min_timeout_ms = 0;
        self.message_retry_min_timeout_ms = 0;
        self.open_group_min_timeout_ms = 0;
        self
    }
}
