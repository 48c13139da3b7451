//! flock-state — status stores of the Flock control plane.
//!
//! # Architecture
//!
//! ```text
//!   StateStore (redb)             in-memory, lock per store
//!   ├── compositions              ├── HistoryStore<T>
//!   ├── distributions             ├── RatingStore
//!   └── isolates                  └── CompatibilityStore
//! ```
//!
//! The redb-backed [`StateStore`] keeps what must survive a restart:
//! compositions (unique by name), top distributions handed across
//! processes, and node-tier isolates. History, ratings and compatibilities
//! are runtime knowledge consulted by placement criteria; each store is
//! guarded by its own mutex so RPC handlers and timers can mutate them
//! concurrently.

pub mod error;
pub mod history;
pub mod ratings;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use history::{HistoryEntry, HistoryStore, epoch_millis};
pub use ratings::{CompatibilityStore, FLAG_THRESHOLD, RatingStore};
pub use store::{DistributionStore, StateStore};
