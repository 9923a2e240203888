//! In-memory KV backend.
//!
//! # Responsibilities
//! - Serve get/put/list/delete from a concurrent map
//! - Fan out key changes to watch streams
//! - Provide TTL leases for locks, renewed while the holder is alive
//!
//! # Design Decisions
//! - One process-local store can be shared by many nodes through `Clone`
//! - Expired leases are purged lazily on access and eagerly by the lease task
//! - `disconnect_watchers` simulates a backend connection loss

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::kv::{ChangeEvent, KvError, KvPair, KvResult, LockOptions, Locker, Store, WatchStream};

const CHANGE_BUFFER: usize = 1024;
const WATCH_BUFFER: usize = 64;

#[derive(Debug, Clone)]
struct Record {
    value: Vec<u8>,
    index: u64,
    lease: Option<Lease>,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        self.lease.map_or(true, |lease| lease.expires_at > now)
    }
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    id: u64,
    expires_at: Instant,
}

struct Inner {
    entries: DashMap<String, Record>,
    index: AtomicU64,
    leases: AtomicU64,
    /// Key of every change, in order.
    changes: broadcast::Sender<String>,
    /// Bumped to close every open watch stream.
    generation: watch::Sender<u64>,
}

/// Process-local [`Store`] implementation.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                index: AtomicU64::new(0),
                leases: AtomicU64::new(0),
                changes,
                generation,
            }),
        }
    }

    /// Close every open watch stream, as a lost backend connection would.
    ///
    /// Subsequent `watch` calls succeed again.
    pub fn disconnect_watchers(&self) {
        self.inner.generation.send_modify(|generation| *generation += 1);
        tracing::debug!("Memory store disconnected all watchers");
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner.entries.iter().filter(|r| r.value().is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_index(&self) -> u64 {
        self.inner.index.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn publish(&self, key: &str) {
        let _ = self.inner.changes.send(key.to_string());
    }

    fn read(&self, key: &str) -> Option<KvPair> {
        let now = Instant::now();
        let expired = match self.inner.entries.get(key) {
            Some(record) if record.is_live(now) => {
                return Some(KvPair {
                    key: key.to_string(),
                    value: record.value.clone(),
                    last_index: record.index,
                });
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.purge_expired(key);
        }
        None
    }

    fn event(&self, key: &str) -> ChangeEvent {
        ChangeEvent {
            key: key.to_string(),
            value: self.read(key).map(|pair| pair.value),
        }
    }

    fn purge_expired(&self, key: &str) {
        let now = Instant::now();
        if self.inner.entries.remove_if(key, |_, record| !record.is_live(now)).is_some() {
            self.publish(key);
        }
    }

    /// Take the lease on `key`, or report when the current one expires.
    fn try_acquire(&self, key: &str, value: &[u8], ttl: Duration) -> Result<Lease, Instant> {
        let now = Instant::now();
        let entry = self.inner.entries.entry(key.to_string());
        if let Entry::Occupied(occupied) = &entry {
            if let Some(current) = occupied.get().lease {
                if current.expires_at > now {
                    return Err(current.expires_at);
                }
            }
        }

        // Only a successful acquisition consumes an index and a lease id.
        let lease = Lease {
            id: self.inner.leases.fetch_add(1, Ordering::SeqCst) + 1,
            expires_at: now + ttl,
        };
        entry.insert(Record {
            value: value.to_vec(),
            index: self.next_index(),
            lease: Some(lease),
        });

        self.publish(key);
        Ok(lease)
    }

    /// Extend a live lease. `None` when the lease is no longer the key's owner.
    fn renew(&self, key: &str, lease_id: u64, ttl: Duration) -> Option<Instant> {
        let now = Instant::now();
        let mut record = self.inner.entries.get_mut(key)?;
        let lease = record.lease.as_mut()?;
        if lease.id != lease_id || lease.expires_at <= now {
            return None;
        }
        lease.expires_at = now + ttl;
        Some(lease.expires_at)
    }

    /// Drop `key` if it is still held under `lease_id`.
    fn release(&self, key: &str, lease_id: u64) -> bool {
        let released = self
            .inner
            .entries
            .remove_if(key, |_, record| record.lease.map(|l| l.id) == Some(lease_id))
            .is_some();
        if released {
            self.publish(key);
        }
        released
    }

    /// Drop `key` if it is still held under `lease_id` and the lease lapsed.
    fn expire(&self, key: &str, lease_id: u64) {
        let now = Instant::now();
        let expired = self
            .inner
            .entries
            .remove_if(key, |_, record| {
                record.lease.map_or(false, |l| l.id == lease_id && l.expires_at <= now)
            })
            .is_some();
        if expired {
            tracing::debug!(key = %key, "Lease expired");
            self.publish(key);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.inner.entries.len())
            .field("index", &self.inner.index.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> KvResult<Option<KvPair>> {
        Ok(self.read(key))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> KvResult<()> {
        let record = Record {
            value,
            index: self.next_index(),
            lease: None,
        };
        self.inner.entries.insert(key.to_string(), record);
        self.publish(key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        if self.inner.entries.remove(key).is_some() {
            self.publish(key);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> KvResult<Vec<KvPair>> {
        let now = Instant::now();
        let mut pairs: Vec<KvPair> = self
            .inner
            .entries
            .iter()
            .filter(|r| r.key().starts_with(prefix) && r.value().is_live(now))
            .map(|r| KvPair {
                key: r.key().clone(),
                value: r.value().value.clone(),
                last_index: r.value().index,
            })
            .collect();
        pairs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(pairs)
    }

    async fn watch(&self, key: &str, stop: CancellationToken) -> KvResult<WatchStream> {
        let mut changes = self.inner.changes.subscribe();
        let mut generation = self.inner.generation.subscribe();
        generation.borrow_and_update();

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let store = self.clone();
        let key = key.to_string();

        tokio::spawn(async move {
            if tx.send(store.event(&key)).await.is_err() {
                return;
            }

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = generation.changed() => break,
                    _ = tx.closed() => break,
                    change = changes.recv() => {
                        let relevant = match change {
                            Ok(changed) => changed == key,
                            // Missed changes may include ours.
                            Err(broadcast::error::RecvError::Lagged(_)) => true,
                            Err(broadcast::error::RecvError::Closed) => break,
                        };
                        if relevant && tx.send(store.event(&key)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::trace!(key = %key, "Watch stream closed");
        });

        Ok(rx)
    }

    async fn new_lock(&self, key: &str, options: LockOptions) -> KvResult<Box<dyn Locker>> {
        Ok(Box::new(MemoryLock {
            store: self.clone(),
            key: key.to_string(),
            options,
            held: None,
        }))
    }
}

struct HeldLease {
    id: u64,
    renewal: CancellationToken,
}

/// Lock handle created by [`MemoryStore`].
///
/// The lease is renewed every third of its TTL while the handle is held.
/// Dropping a held handle stops the renewal and the lease lapses after its TTL.
pub struct MemoryLock {
    store: MemoryStore,
    key: String,
    options: LockOptions,
    held: Option<HeldLease>,
}

#[async_trait]
impl Locker for MemoryLock {
    async fn lock(&mut self, stop: CancellationToken) -> KvResult<CancellationToken> {
        if self.held.is_some() {
            return Err(KvError::Unavailable(format!("lock {} is already held by this handle", self.key)));
        }

        let lease = loop {
            if stop.is_cancelled() {
                return Err(KvError::LockCanceled(self.key.clone()));
            }

            let mut changes = self.store.inner.changes.subscribe();
            match self.store.try_acquire(&self.key, &self.options.value, self.options.ttl) {
                Ok(lease) => break lease,
                Err(expires_at) => {
                    tokio::select! {
                        _ = stop.cancelled() => return Err(KvError::LockCanceled(self.key.clone())),
                        _ = sleep_until(expires_at) => {}
                        _ = wait_for_change(&mut changes, &self.key) => {}
                    }
                }
            }
        };

        let renewal = CancellationToken::new();
        let lost = CancellationToken::new();
        tokio::spawn(keep_alive(
            self.store.clone(),
            self.key.clone(),
            lease,
            self.options.ttl,
            renewal.clone(),
            lost.clone(),
        ));

        self.held = Some(HeldLease { id: lease.id, renewal });
        Ok(lost)
    }

    async fn unlock(&mut self) -> KvResult<()> {
        let held = self.held.take().ok_or_else(|| KvError::LockNotHeld(self.key.clone()))?;
        held.renewal.cancel();

        if self.store.release(&self.key, held.id) {
            Ok(())
        } else {
            Err(KvError::LockNotHeld(self.key.clone()))
        }
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        if let Some(held) = &self.held {
            held.renewal.cancel();
        }
    }
}

async fn wait_for_change(changes: &mut broadcast::Receiver<String>, key: &str) {
    loop {
        match changes.recv().await {
            Ok(changed) if changed == key => return,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

async fn keep_alive(
    store: MemoryStore,
    key: String,
    lease: Lease,
    ttl: Duration,
    renewal: CancellationToken,
    lost: CancellationToken,
) {
    let mut expires_at = lease.expires_at;
    loop {
        tokio::select! {
            _ = renewal.cancelled() => break,
            _ = sleep(ttl / 3) => match store.renew(&key, lease.id, ttl) {
                Some(next) => expires_at = next,
                None => {
                    tracing::debug!(key = %key, "Lock lost");
                    lost.cancel();
                    return;
                }
            }
        }
    }

    // Unlocked leases are already gone; abandoned ones lapse here.
    sleep_until(expires_at).await;
    store.expire(&key, lease.id);
}
