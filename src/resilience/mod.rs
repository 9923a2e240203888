//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Operation against the KV store fails:
//!     → backoff.rs (next delay, or give up past the elapsed cap)
//!     → retries.rs (notify, sleep, run the operation again)
//! ```
//!
//! # Design Decisions
//! - Background loops retry without bound; only caller-facing waits are capped
//! - A long healthy run before a failure starts the delays over
//! - Jittered backoff keeps a fleet from reconnecting in lockstep
//! - Cancellation is done by dropping the retry future

pub mod backoff;
pub mod retries;

pub use backoff::ExponentialBackoff;
pub use retries::{retry_notify, retry_notify_with_reset};
