//! Metrics collection and exposition.
//!
//! # Metrics
//! - `cluster_datastore_reloads_total` (counter): reloads by result
//! - `cluster_datastore_watch_retries_total` (counter): watch re-subscriptions
//! - `cluster_transactions_total` (counter): transactions by outcome
//! - `cluster_transaction_sync_seconds` (histogram): wait for the cache to see a new lock
//! - `cluster_leadership_transitions_total` (counter): transitions by role
//! - `cluster_is_leader` (gauge): 1=leader, 0=follower
//! - `cluster_election_retries_total` (counter): candidacies restarted after an error

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and serve it on `addr`.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_reload(ok: bool) {
    let result = if ok { "ok" } else { "error" };
    counter!("cluster_datastore_reloads_total", "result" => result).increment(1);
}

pub fn record_watch_retry() {
    counter!("cluster_datastore_watch_retries_total").increment(1);
}

/// `outcome` is one of committed, aborted, failed, lock_lost, canceled, sync_timeout.
pub fn record_transaction(outcome: &'static str) {
    counter!("cluster_transactions_total", "outcome" => outcome).increment(1);
}

pub fn record_sync_wait(waited: Duration) {
    histogram!("cluster_transaction_sync_seconds").record(waited.as_secs_f64());
}

pub fn record_leadership(leader: bool) {
    let role = if leader { "leader" } else { "follower" };
    counter!("cluster_leadership_transitions_total", "role" => role).increment(1);
    gauge!("cluster_is_leader").set(if leader { 1.0 } else { 0.0 });
}

pub fn record_election_retry() {
    counter!("cluster_election_retries_total").increment(1);
}
