//! Configuration types for cluster membership.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default heartbeat period in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;

/// Default election check period in milliseconds.
pub const DEFAULT_ELECTION_INTERVAL_MS: u64 = 15_000;

/// Heartbeat periods after which a silent node is considered stale.
pub const DEFAULT_STALE_MULTIPLIER: u32 = 3;

/// Default deadline for one database call in milliseconds.
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 5_000;

/// Default join token lifetime in seconds (24 hours).
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

/// Configuration for this node's cluster membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Hostname recorded for this node.
    pub hostname: String,

    /// Address other nodes use to reach this node.
    pub address: Option<String>,

    /// Port other nodes use to reach this node.
    pub port: Option<u16>,

    /// Software version recorded for this node.
    pub version: String,

    /// Heartbeat period in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Election check period in milliseconds.
    pub election_interval_ms: u64,

    /// Heartbeat periods after which a node is reaped.
    pub stale_multiplier: u32,

    /// Deadline for each database call made by the workers, in milliseconds.
    pub operation_timeout_ms: u64,

    /// Join token lifetime in seconds.
    pub token_ttl_secs: u64,

    /// Free-form labels stored with the node record.
    pub metadata: BTreeMap<String, String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            address: None,
            port: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            election_interval_ms: DEFAULT_ELECTION_INTERVAL_MS,
            stale_multiplier: DEFAULT_STALE_MULTIPLIER,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            metadata: BTreeMap::new(),
        }
    }
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

impl ClusterConfig {
    /// Create a configuration with default timings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the hostname.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set the advertised address and port.
    pub fn with_address(mut self, address: impl Into<String>, port: u16) -> Self {
        self.address = Some(address.into());
        self.port = Some(port);
        self
    }

    /// Set the recorded software version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the heartbeat period.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the election check period.
    pub fn with_election_interval(mut self, interval: Duration) -> Self {
        self.election_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the stale multiplier.
    pub fn with_stale_multiplier(mut self, multiplier: u32) -> Self {
        self.stale_multiplier = multiplier.max(1);
        self
    }

    /// Set the per-call database deadline.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the join token lifetime.
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl_secs = ttl.as_secs();
        self
    }

    /// Add a metadata label.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Heartbeat period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    /// Election check period.
    pub fn election_interval(&self) -> Duration {
        Duration::from_millis(self.election_interval_ms.max(1))
    }

    /// Age after which a node without heartbeats is reaped.
    ///
    /// Rounded up to whole seconds because heartbeats are stored in seconds.
    pub fn stale_threshold(&self) -> Duration {
        let millis = self.heartbeat_interval_ms.max(1) * u64::from(self.stale_multiplier.max(1));
        Duration::from_secs(millis.div_ceil(1000))
    }

    /// Per-call database deadline.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms.max(1))
    }

    /// Join token lifetime.
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}
