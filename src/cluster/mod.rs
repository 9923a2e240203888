//! Cluster coordination subsystem.
//!
//! # Data Flow
//! ```text
//! Datastore<T> (datastore.rs)
//!     watch <prefix>/lock → reload <prefix> → local snapshot → get() / subscribe()
//!     begin() → lock <prefix>/lock → wait for snapshot to see the lock → Transaction
//!
//! Transaction<T> (transaction.rs)
//!     commit(object) → put <prefix> → unlock → replace snapshot
//!
//! Leadership (leadership.rs)
//!     participate(pool) → Candidate (candidate.rs) on <prefix>/leader → Role events
//! ```
//!
//! # Design Decisions
//! - Readers never wait on the network or on writers
//! - The lock value doubles as a sync marker: once the local snapshot carries
//!   the id of a freshly acquired lock, every earlier write has been observed
//! - Background loops retry with backoff until their context is canceled

pub mod candidate;
pub mod datastore;
pub mod error;
pub mod leadership;
pub mod transaction;

pub use candidate::{Candidate, KvCandidate};
pub use datastore::{Datastore, Metadata, Object};
pub use error::{ClusterError, ClusterResult};
pub use leadership::{CandidateFactory, Leadership, Role};
pub use transaction::Transaction;
