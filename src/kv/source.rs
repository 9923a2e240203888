//! Namespaced, typed access to a KV store.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::kv::{KvPair, KvResult, LockOptions, Locker, Store, WatchStream};

/// A [`Store`] handle bound to a key prefix.
///
/// The configuration object lives at the prefix itself; companion keys such
/// as `prefix/lock` and `prefix/leader` are derived with [`key`](Self::key).
#[derive(Clone)]
pub struct KvSource {
    store: Arc<dyn Store>,
    prefix: String,
}

impl KvSource {
    /// Bind `store` to `prefix`. Trailing slashes are ignored.
    pub fn new(store: Arc<dyn Store>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_end_matches('/').to_string();
        Self { store, prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Absolute key for `name` under the prefix.
    pub fn key(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }

    /// Decode the object stored at the prefix. `None` when nothing was stored yet.
    pub async fn load_config<T: DeserializeOwned>(&self) -> KvResult<Option<T>> {
        match self.store.get(&self.prefix).await? {
            Some(pair) => Ok(Some(serde_json::from_slice(&pair.value)?)),
            None => Ok(None),
        }
    }

    /// Encode `value` and store it at the prefix.
    pub async fn store_config<T: Serialize + ?Sized>(&self, value: &T) -> KvResult<()> {
        let encoded = serde_json::to_vec(value)?;
        self.store.put(&self.prefix, encoded).await
    }

    pub async fn get(&self, key: &str) -> KvResult<Option<KvPair>> {
        self.store.get(key).await
    }

    pub async fn watch(&self, key: &str, stop: CancellationToken) -> KvResult<WatchStream> {
        self.store.watch(key, stop).await
    }

    pub async fn new_lock(&self, key: &str, options: LockOptions) -> KvResult<Box<dyn Locker>> {
        self.store.new_lock(key, options).await
    }

    pub async fn list(&self, key: &str) -> KvResult<Vec<KvPair>> {
        self.store.list(key).await
    }

    pub async fn delete(&self, key: &str) -> KvResult<()> {
        self.store.delete(key).await
    }
}

impl std::fmt::Debug for KvSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvSource")
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvError, MemoryStore};
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Settings {
        name: String,
        replicas: u32,
    }

    #[tokio::test]
    async fn test_typed_load_and_store() {
        let source = KvSource::new(Arc::new(MemoryStore::new()), "edge/");
        assert_eq!(source.prefix(), "edge");
        assert_eq!(source.key("lock"), "edge/lock");
        assert_eq!(source.load_config::<Settings>().await.unwrap(), None);

        let settings = Settings { name: "web".into(), replicas: 3 };
        source.store_config(&settings).await.unwrap();
        assert_eq!(source.load_config::<Settings>().await.unwrap(), Some(settings));
    }

    #[tokio::test]
    async fn test_undecodable_value() {
        let store = Arc::new(MemoryStore::new());
        store.put("edge", b"not json".to_vec()).await.unwrap();

        let source = KvSource::new(store, "edge");
        let err = source.load_config::<Settings>().await.unwrap_err();
        assert!(matches!(err, KvError::Codec(_)));
    }
}
