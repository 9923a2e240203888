//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Datastores, transactions and elections produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Metric helpers are plain functions so callers never touch the recorder
//! - Without an installed exporter every metric update is a no-op

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::init_metrics;
