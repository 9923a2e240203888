//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Create datastores → Join the election
//!
//! Background work (pool.rs):
//!     pool.go(task) → task runs with a child cancellation token
//!
//! Shutdown (signals.rs):
//!     SIGTERM/SIGINT → pool.stop() → every task returns → Exit
//! ```
//!
//! # Design Decisions
//! - Cancellation is cooperative; tasks check their token at select points
//! - Stopping the pool waits for tasks, so no loop outlives shutdown

pub mod pool;
pub mod signals;

pub use pool::Pool;
pub use signals::shutdown_signal;
