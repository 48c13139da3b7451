//! flockd — one Flock node in one process.
//!
//! ```text
//!  bus signals ─► IsolateMonitor ─┐            ┌─► NodeAgent ─► NodeComposer
//!  factory signals ─► catalog ────┼─► EventSink ─► ActionQueue ─► executor
//!  timer ticks ───────────────────┘   (rules)                    └─► IsolateMonitor ─► Forker
//!  LostIsolateWatch ─ping─► Forker, ─isolate-lost─► bus
//! ```
//!
//! Services are started in the order they are registered and stopped in
//! reverse: monitor, factories, actions, heartbeat, watch, timer.

pub mod catalog;
pub mod daemon;
pub mod node;
pub mod services;

pub use catalog::{FactoryAnnouncement, FactoryCatalog};
pub use daemon::{Daemon, EventSink, load_composition, node_rules};
pub use node::{LaunchConfig, NodeAgent, TIMER_ACTION};
pub use services::{FnService, Service, ServiceRegistry};
