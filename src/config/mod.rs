//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! node config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ClusterConfig (immutable for the process lifetime)
//!
//! routing file (TOML)
//!     → watcher.rs detects change
//!     → loader.rs + validation.rs
//!     → RoutingConfig sent to the leader, which commits it to the KV store
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - An invalid routing revision is logged and dropped, never committed

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, load_routing, ConfigError};
pub use schema::{
    BackendConfig, BackoffConfig, ClusterConfig, DatastoreConfig, LeadershipConfig, LogFormat,
    ObservabilityConfig, RouteConfig, RoutingConfig, StoreConfig,
};
pub use validation::ValidationError;
pub use watcher::RoutingWatcher;
