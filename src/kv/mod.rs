//! KV store subsystem.
//!
//! # Data Flow
//! ```text
//! Store (backend driver: get/put/list/delete, watch, locks)
//!     → KvSource (namespaced by prefix, typed load/store via serde_json)
//!     → cluster::Datastore / cluster::KvCandidate
//! ```
//!
//! # Design Decisions
//! - Backends sit behind the `Store` and `Locker` traits; the cluster layer
//!   never talks to a driver directly
//! - Watch streams deliver the current value first, then every change
//! - A watch stream closing means the subscription is gone for good; the
//!   subscriber must establish a new one
//! - Lock values are readable through `get` like any other key

pub mod memory;
pub mod source;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use memory::{MemoryLock, MemoryStore};
pub use source::KvSource;

/// A key with its value and modification index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    pub last_index: u64,
}

/// Notification delivered on a watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub key: String,
    /// Current value, `None` when the key does not exist.
    pub value: Option<Vec<u8>>,
}

/// Options for [`Store::new_lock`].
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Lease duration; the lock is released this long after its holder stops renewing.
    pub ttl: Duration,
    /// Value stored at the lock key while held.
    pub value: Vec<u8>,
}

/// Errors that can occur during KV operations.
#[derive(Debug, Error)]
pub enum KvError {
    /// The requested key does not exist.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Unlock was called on a lock this handle does not hold.
    #[error("lock {0} is not held")]
    LockNotHeld(String),

    /// Lock acquisition was stopped before it succeeded.
    #[error("lock acquisition on {0} was canceled")]
    LockCanceled(String),

    /// The backend could not serve the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Result type for KV operations.
pub type KvResult<T> = Result<T, KvError>;

/// Stream of change notifications for a watched key.
pub type WatchStream = mpsc::Receiver<ChangeEvent>;

/// Backend driver for a KV store.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Read a key, `None` when absent.
    async fn get(&self, key: &str) -> KvResult<Option<KvPair>>;

    /// Write a key, replacing any previous value.
    async fn put(&self, key: &str, value: Vec<u8>) -> KvResult<()>;

    /// Remove a key. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> KvResult<()>;

    /// All pairs whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> KvResult<Vec<KvPair>>;

    /// Subscribe to changes of `key` until `stop` fires.
    async fn watch(&self, key: &str, stop: CancellationToken) -> KvResult<WatchStream>;

    /// Create a lock handle for `key`. The lock is not acquired yet.
    async fn new_lock(&self, key: &str, options: LockOptions) -> KvResult<Box<dyn Locker>>;
}

/// Handle on a distributed lock.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Block until the lock is acquired or `stop` fires.
    ///
    /// The returned token is canceled if the lock is lost afterwards.
    async fn lock(&mut self, stop: CancellationToken) -> KvResult<CancellationToken>;

    /// Release a held lock.
    async fn unlock(&mut self) -> KvResult<()>;
}
