//! Election candidates.
//!
//! # Campaign of [`KvCandidate`]
//! ```text
//! Follower ──lock acquired──▶ Leader ──lock lost──▶ Follower (campaign again)
//!                               │
//!                               ├──resign──▶ unlock, cool down one TTL ──▶ Follower
//!                               └──stop────▶ unlock, campaign ends
//! ```
//! Any store error is sent once on the error channel and ends the campaign.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::kv::{KvError, LockOptions, Locker, Store};

/// One participant's bid for leadership over a named resource.
pub trait Candidate: Send + Sync {
    /// Start campaigning.
    ///
    /// Returns a channel of leadership transitions and a channel carrying the
    /// error that ended the campaign. Both close when the campaign ends.
    fn run_for_election(&self) -> (mpsc::UnboundedReceiver<bool>, mpsc::UnboundedReceiver<KvError>);

    /// Give up leadership if held; the campaign goes on.
    fn resign(&self);

    /// End the campaign, releasing leadership if held.
    fn stop(&self);
}

struct Campaign {
    stop: CancellationToken,
    /// Bumped on every resign request.
    resign: watch::Sender<u64>,
}

/// Candidate backed by a TTL lock at `key` whose value is the node name.
pub struct KvCandidate {
    store: Arc<dyn Store>,
    key: String,
    node: String,
    ttl: Duration,
    campaign: Mutex<Option<Campaign>>,
}

impl KvCandidate {
    pub fn new(store: Arc<dyn Store>, key: impl Into<String>, node: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            node: node.into(),
            ttl,
            campaign: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn node(&self) -> &str {
        &self.node
    }
}

impl Candidate for KvCandidate {
    fn run_for_election(&self) -> (mpsc::UnboundedReceiver<bool>, mpsc::UnboundedReceiver<KvError>) {
        let (elected_tx, elected_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let (resign, resign_rx) = watch::channel(0);

        let previous = self
            .campaign
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Campaign { stop: stop.clone(), resign });
        if let Some(previous) = previous {
            previous.stop.cancel();
        }

        tokio::spawn(campaign(CampaignTask {
            store: self.store.clone(),
            key: self.key.clone(),
            node: self.node.clone(),
            ttl: self.ttl,
            stop,
            resign: resign_rx,
            elected: elected_tx,
            errors: error_tx,
        }));

        (elected_rx, error_rx)
    }

    fn resign(&self) {
        let campaign = self.campaign.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(campaign) = campaign.as_ref() {
            campaign.resign.send_modify(|requests| *requests += 1);
        }
    }

    fn stop(&self) {
        let campaign = self.campaign.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(campaign) = campaign {
            campaign.stop.cancel();
        }
    }
}

struct CampaignTask {
    store: Arc<dyn Store>,
    key: String,
    node: String,
    ttl: Duration,
    stop: CancellationToken,
    resign: watch::Receiver<u64>,
    elected: mpsc::UnboundedSender<bool>,
    errors: mpsc::UnboundedSender<KvError>,
}

impl CampaignTask {
    fn fail(&self, err: KvError) {
        tracing::warn!(key = %self.key, node = %self.node, error = %err, "Election campaign failed");
        let _ = self.errors.send(err);
    }

    async fn release(&self, lock: &mut Box<dyn Locker>) {
        if let Err(err) = lock.unlock().await {
            tracing::warn!(key = %self.key, node = %self.node, error = %err, "Cannot release leadership lock");
        }
    }
}

async fn campaign(mut task: CampaignTask) {
    loop {
        let options = LockOptions {
            ttl: task.ttl,
            value: task.node.clone().into_bytes(),
        };
        let mut lock = match task.store.new_lock(&task.key, options).await {
            Ok(lock) => lock,
            Err(err) => return task.fail(err),
        };

        let lost = match lock.lock(task.stop.clone()).await {
            Ok(lost) => lost,
            Err(_) if task.stop.is_cancelled() => return,
            Err(err) => return task.fail(err),
        };

        // Resign requests made while following do not apply to this term;
        // requests made once `true` is out are kept until the select sees them.
        task.resign.borrow_and_update();
        if task.elected.send(true).is_err() {
            task.release(&mut lock).await;
            return;
        }

        let resigned = tokio::select! {
            biased;
            _ = task.stop.cancelled() => {
                task.release(&mut lock).await;
                return;
            }
            Ok(()) = task.resign.changed() => {
                task.release(&mut lock).await;
                true
            }
            _ = lost.cancelled() => false,
        };

        if task.elected.send(false).is_err() {
            return;
        }

        if resigned {
            tokio::select! {
                _ = task.stop.cancelled() => return,
                _ = tokio::time::sleep(task.ttl) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use tokio::time::timeout;

    fn candidate(store: &MemoryStore, node: &str) -> KvCandidate {
        KvCandidate::new(Arc::new(store.clone()), "edge/leader", node, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_single_candidate_is_elected() {
        let store = MemoryStore::new();
        let node = candidate(&store, "edge-1");

        let (mut elected, _errors) = node.run_for_election();
        assert_eq!(timeout(Duration::from_secs(1), elected.recv()).await.unwrap(), Some(true));
        assert_eq!(store.get("edge/leader").await.unwrap().unwrap().value, b"edge-1");

        node.stop();
        assert_eq!(timeout(Duration::from_secs(1), elected.recv()).await.unwrap(), None);
        assert!(store.get("edge/leader").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resign_hands_over() {
        let store = MemoryStore::new();
        let first = candidate(&store, "edge-1");
        let second = candidate(&store, "edge-2");

        let (mut first_elected, _e1) = first.run_for_election();
        assert_eq!(first_elected.recv().await, Some(true));

        let (mut second_elected, _e2) = second.run_for_election();
        first.resign();

        assert_eq!(first_elected.recv().await, Some(false));
        assert_eq!(second_elected.recv().await, Some(true));
        assert_eq!(store.get("edge/leader").await.unwrap().unwrap().value, b"edge-2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resign_right_after_election_is_honored() {
        for _ in 0..200 {
            let store = MemoryStore::new();
            let node = candidate(&store, "edge-1");

            let (mut elected, _errors) = node.run_for_election();
            assert_eq!(elected.recv().await, Some(true));
            node.resign();

            let next = timeout(Duration::from_secs(1), elected.recv()).await.unwrap();
            assert_eq!(next, Some(false));
            node.stop();
        }
    }

    #[tokio::test]
    async fn test_resign_while_following_is_ignored() {
        let store = MemoryStore::new();
        let leader = candidate(&store, "edge-1");
        let follower = candidate(&store, "edge-2");

        let (mut leader_elected, _e1) = leader.run_for_election();
        assert_eq!(leader_elected.recv().await, Some(true));

        let (mut follower_elected, _e2) = follower.run_for_election();
        tokio::time::sleep(Duration::from_millis(10)).await;
        follower.resign();

        leader.stop();
        assert_eq!(timeout(Duration::from_secs(1), follower_elected.recv()).await.unwrap(), Some(true));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(follower_elected.try_recv(), Err(mpsc::error::TryRecvError::Empty));
        assert_eq!(store.get("edge/leader").await.unwrap().unwrap().value, b"edge-2");
        follower.stop();
    }

    #[tokio::test]
    async fn test_stop_after_lock_vanished_ends_campaign() {
        let store = MemoryStore::new();
        let node = candidate(&store, "edge-1");

        let (mut elected, mut errors) = node.run_for_election();
        assert_eq!(elected.recv().await, Some(true));

        // Unlock fails with LockNotHeld; the campaign still ends cleanly.
        store.delete("edge/leader").await.unwrap();
        node.stop();

        assert_eq!(timeout(Duration::from_secs(1), elected.recv()).await.unwrap(), None);
        assert_eq!(errors.recv().await.map(|err| err.to_string()), None);
    }
}
