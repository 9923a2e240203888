//! Configuration schema definitions.
//!
//! Two documents are defined here: the static [`ClusterConfig`] a node starts
//! with, and the dynamic [`RoutingConfig`] the fleet shares through the KV
//! store. All types derive Serde traits for deserialization from TOML files.

use serde::{Deserialize, Serialize};

/// Root configuration for a cluster node.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Node identity used for leadership election.
    pub node: String,

    /// KV store namespace.
    pub store: StoreConfig,

    /// Shared datastore settings.
    pub datastore: DatastoreConfig,

    /// Leadership election settings.
    pub leadership: LeadershipConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node: uuid::Uuid::new_v4().to_string(),
            store: StoreConfig::default(),
            datastore: DatastoreConfig::default(),
            leadership: LeadershipConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// KV store namespace configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Key prefix under which the shared object, its lock and the leader key live.
    pub prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            prefix: "traefik".to_string(),
        }
    }
}

/// Datastore and transaction settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DatastoreConfig {
    /// TTL of the remote write lock in seconds.
    pub lock_ttl_secs: u64,

    /// Maximum time `begin` waits for the local cache to observe the lock.
    pub sync_timeout_secs: u64,

    /// Backoff for the watch loop and the sync polling.
    pub retry: BackoffConfig,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 20,
            sync_timeout_secs: 60,
            retry: BackoffConfig::default(),
        }
    }
}

/// Leadership election settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LeadershipConfig {
    /// TTL of the leader lease in seconds.
    pub lease_ttl_secs: u64,

    /// Backoff for the election loop.
    pub retry: BackoffConfig,
}

impl Default for LeadershipConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 30,
            retry: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First retry delay in milliseconds.
    pub initial_interval_ms: u64,

    /// Upper bound for a single delay in milliseconds.
    pub max_interval_ms: u64,

    /// Growth factor applied after each attempt.
    pub multiplier: f64,

    /// Jitter as a fraction of the delay (0.5 = ±50%).
    pub randomization_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 500,
            max_interval_ms: 60_000,
            multiplier: 1.5,
            randomization_factor: 0.5,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
}

/// Observability configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log line format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Full,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Dynamic routing table shared by the fleet.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RoutingConfig {
    /// Route definitions mapping requests to backends.
    pub routes: Vec<RouteConfig>,

    /// Backend server definitions.
    pub backends: Vec<BackendConfig>,
}

/// Route configuration mapping requests to backend groups.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging/metrics.
    pub name: String,

    /// Host header to match (exact match).
    pub host: Option<String>,

    /// Path prefix to match.
    pub path_prefix: Option<String>,

    /// Backend group name to forward to.
    pub backend_group: String,

    /// Route priority (higher = checked first).
    #[serde(default)]
    pub priority: u32,
}

/// Backend server configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Unique backend identifier.
    pub name: String,

    /// Backend group this server belongs to.
    pub group: String,

    /// Backend address (e.g., "127.0.0.1:3000").
    pub address: String,

    /// Weight for weighted load balancing (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_cluster_config() {
        let config: ClusterConfig = toml::from_str(r#"node = "edge-1""#).unwrap();
        assert_eq!(config.node, "edge-1");
        assert_eq!(config.store.prefix, "traefik");
        assert_eq!(config.datastore.lock_ttl_secs, 20);
        assert_eq!(config.datastore.sync_timeout_secs, 60);
        assert_eq!(config.leadership.lease_ttl_secs, 30);
    }

    #[test]
    fn test_nested_retry_section() {
        let config: ClusterConfig = toml::from_str(
            r#"
            [datastore.retry]
            initial_interval_ms = 10
            multiplier = 2.0

            [observability]
            log_format = "compact"
            "#,
        )
        .unwrap();

        assert_eq!(config.datastore.retry.initial_interval_ms, 10);
        assert_eq!(config.datastore.retry.max_interval_ms, 60_000);
        assert_eq!(config.datastore.retry.multiplier, 2.0);
        assert_eq!(config.observability.log_format, LogFormat::Compact);
        assert!(!config.node.is_empty());
    }

    #[test]
    fn test_routing_config() {
        let routing: RoutingConfig = toml::from_str(
            r#"
            [[routes]]
            name = "api"
            path_prefix = "/api"
            backend_group = "api"

            [[backends]]
            name = "api-1"
            group = "api"
            address = "10.0.0.1:8080"
            "#,
        )
        .unwrap();

        assert_eq!(routing.routes[0].priority, 0);
        assert_eq!(routing.backends[0].weight, 1);
    }
}
