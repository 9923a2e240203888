//! Single-use write handle on a [`Datastore`].

use tokio_util::sync::CancellationToken;

use crate::cluster::datastore::{Datastore, Object};
use crate::cluster::error::{ClusterError, ClusterResult};
use crate::kv::Locker;
use crate::observability::metrics;

enum State {
    Open {
        locker: Box<dyn Locker>,
        lost: CancellationToken,
    },
    Used,
}

/// Holds the datastore's remote lock until committed or aborted.
///
/// The first call to [`commit`](Self::commit) or [`abort`](Self::abort)
/// consumes the transaction whatever its outcome; later calls fail with
/// [`ClusterError::TransactionUsed`] without touching the store. Dropping an
/// open transaction abandons the lock, which lapses after its TTL.
pub struct Transaction<T> {
    datastore: Datastore<T>,
    id: String,
    state: State,
}

impl<T: Object> Transaction<T> {
    pub(crate) fn new(
        datastore: Datastore<T>,
        id: String,
        locker: Box<dyn Locker>,
        lost: CancellationToken,
    ) -> Self {
        Self {
            datastore,
            id,
            state: State::Open { locker, lost },
        }
    }

    /// Id written as the lock value.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open { .. })
    }

    /// Persist `object`, release the lock and update the local cache.
    ///
    /// The write happens before the unlock, so the next lock holder reads it.
    /// If the write fails, the lock is released on a best-effort basis.
    pub async fn commit(&mut self, object: T) -> ClusterResult<()> {
        let shared = self.datastore.shared.clone();
        let _guard = shared.local_lock.lock().await;

        let (mut locker, lost) = match std::mem::replace(&mut self.state, State::Used) {
            State::Open { locker, lost } => (locker, lost),
            State::Used => return Err(ClusterError::TransactionUsed),
        };

        if lost.is_cancelled() {
            metrics::record_transaction("lock_lost");
            return Err(ClusterError::LockLost(shared.lock_key.clone()));
        }

        if let Err(err) = shared.kv.store_config(&object).await {
            metrics::record_transaction("failed");
            if let Err(unlock_err) = locker.unlock().await {
                tracing::warn!(transaction = %self.id, error = %unlock_err, "Cannot release lock after failed commit");
            }
            return Err(err.into());
        }

        locker.unlock().await?;
        shared.replace_object(object);

        metrics::record_transaction("committed");
        tracing::debug!(transaction = %self.id, "Transaction committed");
        Ok(())
    }

    /// Release the lock without writing.
    pub async fn abort(&mut self) -> ClusterResult<()> {
        match std::mem::replace(&mut self.state, State::Used) {
            State::Open { mut locker, .. } => {
                metrics::record_transaction("aborted");
                locker.unlock().await?;
                Ok(())
            }
            State::Used => Err(ClusterError::TransactionUsed),
        }
    }
}

impl<T> Drop for Transaction<T> {
    fn drop(&mut self) {
        if matches!(self.state, State::Open { .. }) {
            tracing::warn!(transaction = %self.id, "Transaction dropped while open, lock left to expire");
        }
    }
}

impl<T> std::fmt::Debug for Transaction<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("open", &matches!(self.state, State::Open { .. }))
            .finish()
    }
}
