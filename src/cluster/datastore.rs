//! Shared configuration object kept in sync with the KV store.
//!
//! # Layout in the store
//! ```text
//! <prefix>        JSON encoded object
//! <prefix>/lock   id of the transaction holding the write lock (Metadata)
//! ```
//!
//! # Watch loop
//! ```text
//! Watching ──notification──▶ Reloading ──ok──▶ Watching
//!     │                          │
//!     └──stream closed──┐        └──error──┐
//!                       ▼                  ▼
//!                   Retrying ──backoff, resubscribe──▶ Watching
//!
//! any state ──context canceled──▶ Stopped
//! ```

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cluster::error::{ClusterError, ClusterResult};
use crate::cluster::transaction::Transaction;
use crate::config::DatastoreConfig;
use crate::kv::{KvSource, LockOptions, WatchStream};
use crate::lifecycle::Pool;
use crate::observability::metrics;
use crate::resilience::{retry_notify, retry_notify_with_reset, ExponentialBackoff};

/// Values a [`Datastore`] can share.
pub trait Object: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Object for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Bookkeeping stored next to the object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Id of the transaction currently (or last) holding the write lock.
    pub lock: String,
}

#[derive(Debug)]
struct Snapshot<T> {
    object: Arc<T>,
    meta: Metadata,
}

pub(crate) struct Shared<T> {
    pub(crate) kv: KvSource,
    ctx: CancellationToken,
    pub(crate) lock_key: String,
    config: DatastoreConfig,
    /// Readers load this without blocking.
    snapshot: ArcSwap<Snapshot<T>>,
    /// Serializes every writer of `snapshot` (reloads and commits).
    pub(crate) local_lock: Mutex<()>,
    changes: watch::Sender<Arc<T>>,
    /// Subscription opened by the constructor, consumed by the first watch pass.
    pending_watch: StdMutex<Option<WatchStream>>,
}

/// One configuration object shared by every process using the same prefix.
///
/// Reads are served from a local cache refreshed by a background watch loop.
/// Writes go through a [`Transaction`] obtained from [`begin`](Self::begin).
pub struct Datastore<T> {
    pub(crate) shared: Arc<Shared<T>>,
}

impl<T> Clone for Datastore<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Object> Datastore<T> {
    /// Create a datastore with default settings.
    ///
    /// See [`with_config`](Self::with_config).
    pub async fn new(kv: KvSource, ctx: CancellationToken, object: T) -> ClusterResult<Self> {
        Self::with_config(kv, ctx, object, DatastoreConfig::default()).await
    }

    /// Create a datastore caching `object` until the first reload.
    ///
    /// Fails only when the watch on the lock key cannot be established. The
    /// watch loop runs until `ctx` is canceled.
    pub async fn with_config(
        kv: KvSource,
        ctx: CancellationToken,
        object: T,
        config: DatastoreConfig,
    ) -> ClusterResult<Self> {
        let shared = Shared::open(kv, ctx, object, config).await?;
        tokio::spawn(watch_changes(shared.clone()));
        Ok(Self { shared })
    }

    /// Create a datastore whose watch loop runs on `pool`.
    ///
    /// The loop stops with the pool, and [`Pool::stop`] waits for it.
    pub async fn in_pool(pool: &Pool, kv: KvSource, object: T, config: DatastoreConfig) -> ClusterResult<Self> {
        let shared = Shared::open(kv, pool.token(), object, config).await?;
        pool.spawn(watch_changes(shared.clone()));
        Ok(Self { shared })
    }

    /// Current cached object. Never touches the network.
    pub fn get(&self) -> Arc<T> {
        self.shared.snapshot.load().object.clone()
    }

    /// Current cached metadata.
    pub fn metadata(&self) -> Metadata {
        self.shared.snapshot.load().meta.clone()
    }

    /// Receiver notified whenever a reload or a local commit replaces the object.
    pub fn subscribe(&self) -> watch::Receiver<Arc<T>> {
        self.shared.changes.subscribe()
    }

    pub fn lock_key(&self) -> &str {
        &self.shared.lock_key
    }

    /// Start a write.
    ///
    /// Acquires the remote lock, then waits until the local cache has observed
    /// this transaction as the lock holder, so the caller reads the latest
    /// remote state before writing. Canceling the datastore context aborts a
    /// pending acquisition. If the cache does not catch up within the
    /// configured sync timeout, the lock is abandoned to its TTL.
    pub async fn begin(&self) -> ClusterResult<Transaction<T>> {
        let shared = &self.shared;
        if shared.ctx.is_cancelled() {
            return Err(ClusterError::Canceled);
        }
        let id = Uuid::new_v4().to_string();

        let options = LockOptions {
            ttl: Duration::from_secs(shared.config.lock_ttl_secs),
            value: id.clone().into_bytes(),
        };
        let mut locker = shared
            .kv
            .new_lock(&shared.lock_key, options)
            .await
            .map_err(|source| ClusterError::Lock { key: shared.lock_key.clone(), source })?;

        let stop = shared.ctx.child_token();
        let acquire = tokio::spawn({
            let stop = stop.clone();
            async move {
                let result = locker.lock(stop).await;
                (locker, result)
            }
        });

        let (locker, lost) = tokio::select! {
            joined = acquire => match joined? {
                (locker, Ok(lost)) => (locker, lost),
                (_, Err(_)) if shared.ctx.is_cancelled() => {
                    metrics::record_transaction("canceled");
                    return Err(ClusterError::Canceled);
                }
                (_, Err(source)) => {
                    return Err(ClusterError::Lock { key: shared.lock_key.clone(), source });
                }
            },
            _ = shared.ctx.cancelled() => {
                stop.cancel();
                metrics::record_transaction("canceled");
                return Err(ClusterError::Canceled);
            }
        };

        tracing::debug!(transaction = %id, "Lock acquired, waiting for datastore to sync");

        let started = Instant::now();
        let timeout = Duration::from_secs(shared.config.sync_timeout_secs);
        let backoff = ExponentialBackoff::from(&shared.config.retry).with_max_elapsed_time(Some(timeout));
        let synced = retry_notify(
            backoff,
            || {
                let observed = shared.snapshot.load().meta.lock == id;
                async move { if observed { Ok(()) } else { Err(()) } }
            },
            |_: &(), delay: Duration| {
                tracing::trace!(transaction = %id, retry_in = ?delay, "Datastore not synced yet");
            },
        );

        let synced = tokio::select! {
            result = synced => result,
            _ = shared.ctx.cancelled() => {
                metrics::record_transaction("canceled");
                return Err(ClusterError::Canceled);
            }
        };
        metrics::record_sync_wait(started.elapsed());

        if synced.is_err() {
            metrics::record_transaction("sync_timeout");
            tracing::warn!(transaction = %id, waited = ?started.elapsed(), "Datastore cannot sync");
            return Err(ClusterError::SyncTimeout {
                lock: id,
                waited: started.elapsed(),
            });
        }

        Ok(Transaction::new(self.clone(), id, locker, lost))
    }
}

impl<T: Object> Shared<T> {
    async fn open(kv: KvSource, ctx: CancellationToken, object: T, config: DatastoreConfig) -> ClusterResult<Arc<Self>> {
        let lock_key = kv.key("lock");
        let events = kv
            .watch(&lock_key, ctx.child_token())
            .await
            .map_err(|source| ClusterError::Watch { key: lock_key.clone(), source })?;

        let object = Arc::new(object);
        let (changes, _) = watch::channel(object.clone());

        let shared = Arc::new(Self {
            kv,
            ctx,
            lock_key,
            config,
            snapshot: ArcSwap::from_pointee(Snapshot {
                object,
                meta: Metadata::default(),
            }),
            local_lock: Mutex::new(()),
            changes,
            pending_watch: StdMutex::new(Some(events)),
        });
        tracing::debug!(prefix = %shared.kv.prefix(), "Datastore started");
        Ok(shared)
    }

    /// One subscribe-and-consume pass. `Ok` only once the context is canceled.
    async fn watch_once(self: Arc<Self>) -> ClusterResult<()> {
        let pending = self.pending_watch.lock().ok().and_then(|mut pending| pending.take());
        let mut events = match pending {
            Some(events) => events,
            None => self
                .kv
                .watch(&self.lock_key, self.ctx.child_token())
                .await
                .map_err(|source| ClusterError::Watch { key: self.lock_key.clone(), source })?,
        };

        loop {
            tokio::select! {
                _ = self.ctx.cancelled() => return Ok(()),
                event = events.recv() => match event {
                    Some(_) => self.reload().await?,
                    None => return Err(ClusterError::WatchClosed(self.lock_key.clone())),
                },
            }
        }
    }

    /// Refresh object and metadata from the store.
    async fn reload(&self) -> ClusterResult<()> {
        let _guard = self.local_lock.lock().await;

        let result = self.fetch().await;
        metrics::record_reload(result.is_ok());
        let (loaded, meta) = result?;

        let object = match loaded {
            Some(object) => Arc::new(object),
            None => self.snapshot.load().object.clone(),
        };
        tracing::trace!(key = %self.lock_key, lock = %meta.lock, "Datastore reloaded");

        self.snapshot.store(Arc::new(Snapshot {
            object: object.clone(),
            meta,
        }));
        self.changes.send_if_modified(|current| {
            if Arc::ptr_eq(current, &object) {
                false
            } else {
                *current = object;
                true
            }
        });
        Ok(())
    }

    async fn fetch(&self) -> ClusterResult<(Option<T>, Metadata)> {
        let meta = match self.kv.get(&self.lock_key).await? {
            Some(pair) => Metadata {
                lock: String::from_utf8_lossy(&pair.value).into_owned(),
            },
            None => Metadata::default(),
        };
        let object = self.kv.load_config::<T>().await?;
        Ok((object, meta))
    }

    /// Install a committed object. Callers hold `local_lock`.
    pub(crate) fn replace_object(&self, object: T) {
        let object = Arc::new(object);
        let meta = self.snapshot.load().meta.clone();
        self.snapshot.store(Arc::new(Snapshot {
            object: object.clone(),
            meta,
        }));
        self.changes.send_replace(object);
    }
}

async fn watch_changes<T: Object>(shared: Arc<Shared<T>>) {
    let ctx = shared.ctx.clone();
    let lock_key = shared.lock_key.clone();
    let backoff = ExponentialBackoff::from(&shared.config.retry);
    // A subscription that outlived the longest retry delay counts as recovered.
    let healthy_after = Duration::from_millis(shared.config.retry.max_interval_ms);

    let watching = retry_notify_with_reset(
        backoff,
        healthy_after,
        || shared.clone().watch_once(),
        |err: &ClusterError, delay: Duration| {
            metrics::record_watch_retry();
            tracing::warn!(key = %lock_key, error = %err, retry_in = ?delay, "Datastore watch failed, retrying");
        },
    );

    tokio::select! {
        _ = ctx.cancelled() => {}
        result = watching => {
            if let Err(err) = result {
                tracing::error!(key = %lock_key, error = %err, "Datastore watch gave up");
            }
        }
    }
    tracing::debug!(key = %lock_key, "Datastore watch stopped");
}

impl<T> std::fmt::Debug for Datastore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datastore")
            .field("prefix", &self.shared.kv.prefix())
            .field("lock_key", &self.shared.lock_key)
            .field("lock", &self.shared.snapshot.load().meta.lock)
            .finish()
    }
}
