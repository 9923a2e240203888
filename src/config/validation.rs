//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (TTLs > 0, sane backoff parameters)
//! - Check referential integrity of the routing table
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{BackoffConfig, ClusterConfig, RoutingConfig};

/// A single semantic problem in a configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a node configuration.
pub fn validate_config(config: &ClusterConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.node.trim().is_empty() {
        errors.push(ValidationError::new("node", "must not be empty"));
    }

    let prefix = &config.store.prefix;
    if prefix.is_empty() {
        errors.push(ValidationError::new("store.prefix", "must not be empty"));
    } else if prefix.ends_with('/') {
        errors.push(ValidationError::new("store.prefix", "must not end with '/'"));
    }

    if config.datastore.lock_ttl_secs == 0 {
        errors.push(ValidationError::new("datastore.lock_ttl_secs", "must be greater than 0"));
    }
    if config.datastore.sync_timeout_secs == 0 {
        errors.push(ValidationError::new("datastore.sync_timeout_secs", "must be greater than 0"));
    }
    if config.leadership.lease_ttl_secs == 0 {
        errors.push(ValidationError::new("leadership.lease_ttl_secs", "must be greater than 0"));
    }

    validate_backoff("datastore.retry", &config.datastore.retry, &mut errors);
    validate_backoff("leadership.retry", &config.leadership.retry, &mut errors);

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

fn validate_backoff(section: &str, backoff: &BackoffConfig, errors: &mut Vec<ValidationError>) {
    if backoff.initial_interval_ms == 0 {
        errors.push(ValidationError::new(
            format!("{}.initial_interval_ms", section),
            "must be greater than 0",
        ));
    }
    if backoff.initial_interval_ms > backoff.max_interval_ms {
        errors.push(ValidationError::new(
            format!("{}.max_interval_ms", section),
            "must not be below initial_interval_ms",
        ));
    }
    if backoff.multiplier < 1.0 {
        errors.push(ValidationError::new(
            format!("{}.multiplier", section),
            "must be at least 1.0",
        ));
    }
    if !(0.0..=1.0).contains(&backoff.randomization_factor) {
        errors.push(ValidationError::new(
            format!("{}.randomization_factor", section),
            "must be between 0.0 and 1.0",
        ));
    }
}

/// Validate a routing table.
pub fn validate_routing(routing: &RoutingConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let mut names = HashSet::new();
    for backend in &routing.backends {
        if !names.insert(backend.name.as_str()) {
            errors.push(ValidationError::new(
                format!("backends.{}", backend.name),
                "duplicate backend name",
            ));
        }
    }

    let groups: HashSet<&str> = routing.backends.iter().map(|b| b.group.as_str()).collect();
    for route in &routing.routes {
        if !groups.contains(route.backend_group.as_str()) {
            errors.push(ValidationError::new(
                format!("routes.{}", route.name),
                format!("backend group '{}' has no backends", route.backend_group),
            ));
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}
