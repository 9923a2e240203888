//! Cluster coordination for edge routers sharing one KV store.

pub mod cluster;
pub mod config;
pub mod kv;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use cluster::{ClusterError, Datastore, Leadership, Role, Transaction};
pub use config::ClusterConfig;
pub use kv::{KvSource, MemoryStore, Store};
pub use lifecycle::Pool;
