//! Leadership election for a fleet sharing one KV prefix.
//!
//! ```text
//! NotParticipating ──participate──▶ Candidate ──▶ Leader | Follower
//!                                       ▲               │
//!                                       └──error: backoff, run again
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cluster::candidate::{Candidate, KvCandidate};
use crate::cluster::error::{ClusterError, ClusterResult};
use crate::config::{ClusterConfig, LeadershipConfig};
use crate::kv::KvSource;
use crate::lifecycle::Pool;
use crate::observability::metrics;
use crate::resilience::{retry_notify_with_reset, ExponentialBackoff};

/// Builds the candidate for `(key, node, ttl)`.
pub type CandidateFactory = Arc<dyn Fn(&str, &str, Duration) -> Arc<dyn Candidate> + Send + Sync>;

/// Outcome of a leadership transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

impl From<bool> for Role {
    fn from(elected: bool) -> Self {
        if elected { Role::Leader } else { Role::Follower }
    }
}

struct Inner {
    kv: KvSource,
    node: String,
    config: LeadershipConfig,
    factory: CandidateFactory,
    candidate: Mutex<Option<Arc<dyn Candidate>>>,
    leader: AtomicBool,
}

/// This node's participation in the election at `<prefix>/leader`.
#[derive(Clone)]
pub struct Leadership {
    inner: Arc<Inner>,
}

impl Leadership {
    /// Participate through a [`KvCandidate`] on the same store.
    pub fn new(kv: KvSource, node: impl Into<String>, config: LeadershipConfig) -> Self {
        let store = kv.store();
        let factory: CandidateFactory = Arc::new(move |key: &str, node: &str, ttl: Duration| {
            Arc::new(KvCandidate::new(store.clone(), key, node, ttl)) as Arc<dyn Candidate>
        });
        Self::with_candidate_factory(kv, node, config, factory)
    }

    pub fn from_config(kv: KvSource, config: &ClusterConfig) -> Self {
        Self::new(kv, config.node.clone(), config.leadership.clone())
    }

    pub fn with_candidate_factory(
        kv: KvSource,
        node: impl Into<String>,
        config: LeadershipConfig,
        factory: CandidateFactory,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                kv,
                node: node.into(),
                config,
                factory,
                candidate: Mutex::new(None),
                leader: AtomicBool::new(false),
            }),
        }
    }

    pub fn node(&self) -> &str {
        &self.inner.node
    }

    pub fn leader_key(&self) -> String {
        self.inner.kv.key("leader")
    }

    /// Whether the last transition made this node the leader.
    pub fn is_leader(&self) -> bool {
        self.inner.leader.load(Ordering::SeqCst)
    }

    /// Join the election on `pool`.
    ///
    /// Returns the stream of transitions, in the order the candidate reported
    /// them. Candidate errors are logged and the candidacy is re-established
    /// with backoff; the stream ends when the pool stops. A node participates
    /// at most once.
    pub fn participate(&self, pool: &Pool) -> ClusterResult<mpsc::UnboundedReceiver<Role>> {
        let candidate = {
            let mut slot = self.inner.candidate.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return Err(ClusterError::AlreadyParticipating(self.inner.node.clone()));
            }
            let ttl = Duration::from_secs(self.inner.config.lease_ttl_secs);
            let candidate = (self.inner.factory)(&self.leader_key(), &self.inner.node, ttl);
            *slot = Some(candidate.clone());
            candidate
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = self.inner.clone();

        pool.go(move |stop| async move {
            tracing::info!(node = %inner.node, key = %inner.kv.key("leader"), "Joining leadership election");

            let backoff = ExponentialBackoff::from(&inner.config.retry);
            let healthy_after = Duration::from_millis(inner.config.retry.max_interval_ms);
            let elections = retry_notify_with_reset(
                backoff,
                healthy_after,
                || inner.clone().run(candidate.clone(), stop.clone(), events_tx.clone()),
                |err: &ClusterError, delay: Duration| {
                    metrics::record_election_retry();
                    tracing::error!(node = %inner.node, error = %err, retry_in = ?delay, "Leadership election error, retrying");
                },
            );

            tokio::select! {
                result = elections => {
                    if let Err(err) = result {
                        tracing::error!(node = %inner.node, error = %err, "Cannot elect leadership");
                    }
                }
                _ = stop.cancelled() => candidate.stop(),
            }
            tracing::debug!(node = %inner.node, "Left leadership election");
        });

        Ok(events_rx)
    }

    /// Give up leadership if this node participates; no-op otherwise.
    pub fn resign(&self) {
        let candidate = self.inner.candidate.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(candidate) = candidate {
            tracing::info!(node = %self.inner.node, "Resigning leadership");
            candidate.resign();
        }
    }
}

impl Inner {
    /// One candidacy. `Ok` only when stopped.
    async fn run(
        self: Arc<Self>,
        candidate: Arc<dyn Candidate>,
        stop: CancellationToken,
        events: mpsc::UnboundedSender<Role>,
    ) -> ClusterResult<()> {
        let (mut elected, mut errors) = candidate.run_for_election();

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    candidate.stop();
                    return Ok(());
                }
                transition = elected.recv() => match transition {
                    Some(is_elected) => self.on_election(is_elected, &events),
                    None => {
                        return match errors.try_recv() {
                            Ok(err) => Err(err.into()),
                            Err(_) => Err(ClusterError::ElectionClosed(self.kv.key("leader"))),
                        };
                    }
                },
                Some(err) = errors.recv() => return Err(err.into()),
            }
        }
    }

    fn on_election(&self, elected: bool, events: &mpsc::UnboundedSender<Role>) {
        self.leader.store(elected, Ordering::SeqCst);
        metrics::record_leadership(elected);
        if elected {
            tracing::info!(node = %self.node, "Node elected leader");
        } else {
            tracing::info!(node = %self.node, "Node elected follower");
        }
        let _ = events.send(Role::from(elected));
    }
}

impl std::fmt::Debug for Leadership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Leadership")
            .field("node", &self.inner.node)
            .field("leader", &self.is_leader())
            .finish()
    }
}
