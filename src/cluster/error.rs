//! Cluster coordination errors.

use std::time::Duration;

use thiserror::Error;

use crate::kv::KvError;

/// Errors surfaced by the datastore, transactions and leadership.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The initial watch subscription could not be established.
    #[error("cannot watch {key}: {source}")]
    Watch {
        key: String,
        #[source]
        source: KvError,
    },

    /// A watch stream closed while the datastore was still running.
    #[error("watch on {0} closed unexpectedly")]
    WatchClosed(String),

    /// The remote lock could not be acquired.
    #[error("cannot acquire lock {key}: {source}")]
    Lock {
        key: String,
        #[source]
        source: KvError,
    },

    /// The owning context was canceled.
    #[error("operation canceled")]
    Canceled,

    /// The local cache did not observe the acquired lock in time.
    #[error("Datastore cannot sync: lock {lock} not observed after {waited:?}")]
    SyncTimeout { lock: String, waited: Duration },

    /// Commit or abort on a transaction that was already consumed.
    #[error("Transaction already used. Please begin a new one.")]
    TransactionUsed,

    /// The backend reported the transaction's lock as lost.
    #[error("lock {0} was lost before commit")]
    LockLost(String),

    /// The election candidate closed its channels without reporting an error.
    #[error("election on {0} ended unexpectedly")]
    ElectionClosed(String),

    /// `participate` was called while a campaign is already running.
    #[error("node {0} is already participating in the election")]
    AlreadyParticipating(String),

    /// A background task panicked or was aborted.
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Store(#[from] KvError),
}

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;
