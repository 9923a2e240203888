//! Shared utilities for integration testing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use edge_cluster::cluster::{Candidate, CandidateFactory};
use edge_cluster::config::{DatastoreConfig, LeadershipConfig};
use edge_cluster::kv::{KvError, KvPair, KvResult, KvSource, LockOptions, Locker, MemoryStore, Store, WatchStream};

pub const PREFIX: &str = "edge";

/// Datastore settings with millisecond backoff.
#[allow(dead_code)]
pub fn fast_datastore_config() -> DatastoreConfig {
    let mut config = DatastoreConfig::default();
    config.retry.initial_interval_ms = 5;
    config.retry.max_interval_ms = 20;
    config
}

#[allow(dead_code)]
pub fn fast_leadership_config() -> LeadershipConfig {
    let mut config = LeadershipConfig::default();
    config.retry.initial_interval_ms = 5;
    config.retry.max_interval_ms = 20;
    config
}

#[allow(dead_code)]
pub fn kv(store: impl Store) -> KvSource {
    KvSource::new(Arc::new(store), PREFIX)
}

/// Poll `condition` every few milliseconds until it holds or `limit` elapses.
#[allow(dead_code)]
pub async fn eventually<F: FnMut() -> bool>(limit: Duration, mut condition: F) -> bool {
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

/// Store whose watch streams stay open and deliver only what [`FrozenStore::deliver`] pushes.
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct FrozenStore {
    inner: MemoryStore,
    feeds: Arc<Mutex<Vec<mpsc::Sender<edge_cluster::kv::ChangeEvent>>>>,
}

#[allow(dead_code)]
impl FrozenStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            feeds: Arc::default(),
        }
    }

    /// Deliver the current value of `key` on every open watch stream, once.
    pub async fn deliver(&self, key: &str) {
        let feeds = self.feeds.lock().unwrap().clone();
        let value = self.inner.get(key).await.unwrap().map(|pair| pair.value);
        for feed in feeds {
            let event = edge_cluster::kv::ChangeEvent {
                key: key.to_string(),
                value: value.clone(),
            };
            let _ = feed.send(event).await;
        }
    }
}

/// Store counting how many watch streams were opened.
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct CountingStore {
    inner: MemoryStore,
    watches: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl CountingStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            watches: Arc::default(),
        }
    }

    pub fn watches(&self) -> usize {
        self.watches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for CountingStore {
    async fn get(&self, key: &str) -> KvResult<Option<KvPair>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> KvResult<()> {
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> KvResult<Vec<KvPair>> {
        self.inner.list(prefix).await
    }

    async fn watch(&self, key: &str, stop: CancellationToken) -> KvResult<WatchStream> {
        self.watches.fetch_add(1, Ordering::SeqCst);
        self.inner.watch(key, stop).await
    }

    async fn new_lock(&self, key: &str, options: LockOptions) -> KvResult<Box<dyn Locker>> {
        self.inner.new_lock(key, options).await
    }
}

#[async_trait]
impl Store for FrozenStore {
    async fn get(&self, key: &str) -> KvResult<Option<KvPair>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> KvResult<()> {
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> KvResult<Vec<KvPair>> {
        self.inner.list(prefix).await
    }

    async fn watch(&self, _key: &str, _stop: CancellationToken) -> KvResult<WatchStream> {
        let (tx, rx) = mpsc::channel(1);
        self.feeds.lock().unwrap().push(tx);
        Ok(rx)
    }

    async fn new_lock(&self, key: &str, options: LockOptions) -> KvResult<Box<dyn Locker>> {
        self.inner.new_lock(key, options).await
    }
}

/// Store that cannot establish any watch.
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct FailingWatchStore {
    inner: MemoryStore,
}

#[async_trait]
impl Store for FailingWatchStore {
    async fn get(&self, key: &str) -> KvResult<Option<KvPair>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> KvResult<()> {
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> KvResult<Vec<KvPair>> {
        self.inner.list(prefix).await
    }

    async fn watch(&self, key: &str, _stop: CancellationToken) -> KvResult<WatchStream> {
        Err(KvError::Unavailable(format!("cannot watch {}", key)))
    }

    async fn new_lock(&self, key: &str, options: LockOptions) -> KvResult<Box<dyn Locker>> {
        self.inner.new_lock(key, options).await
    }
}

/// What one `run_for_election` call emits.
#[allow(dead_code)]
#[derive(Default)]
pub struct Script {
    pub elected: Vec<bool>,
    /// Sent after the transitions; the campaign then ends.
    pub error: Option<KvError>,
}

/// Candidate replaying scripted campaigns and counting calls.
///
/// Without an error, the channels stay open until `stop`.
#[allow(dead_code)]
#[derive(Default)]
pub struct ScriptedCandidate {
    scripts: Mutex<VecDeque<Script>>,
    open: Mutex<Vec<(mpsc::UnboundedSender<bool>, mpsc::UnboundedSender<KvError>)>>,
    runs: AtomicUsize,
    resigns: AtomicUsize,
    stops: AtomicUsize,
}

#[allow(dead_code)]
impl ScriptedCandidate {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        })
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn resigns(&self) -> usize {
        self.resigns.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Factory handing out this candidate whatever the key.
    pub fn factory(self: &Arc<Self>) -> CandidateFactory {
        let candidate = self.clone();
        Arc::new(move |_: &str, _: &str, _: Duration| -> Arc<dyn Candidate> { candidate.clone() })
    }
}

impl Candidate for ScriptedCandidate {
    fn run_for_election(&self) -> (mpsc::UnboundedReceiver<bool>, mpsc::UnboundedReceiver<KvError>) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let (elected_tx, elected_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        for elected in script.elected {
            elected_tx.send(elected).unwrap();
        }
        match script.error {
            Some(err) => error_tx.send(err).unwrap(),
            None => self.open.lock().unwrap().push((elected_tx, error_tx)),
        }

        (elected_rx, error_rx)
    }

    fn resign(&self) {
        self.resigns.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.open.lock().unwrap().clear();
    }
}
