//! flock-liveness — is an isolate still there?
//!
//! # Architecture
//!
//! ```text
//! spawn_heartbeat ──heartbeat──► bus ──► PeerDirectory
//!
//! LostIsolateWatch ──ping──► Forker (LocalForker → Pinger)
//!        │                               ├── ProcessTable (kill(pid, 0))
//!        │                               └── LivenessCheck (HTTP GET, bounded)
//!        └──isolate-lost──► bus ──► IsolateMonitor ──► LifecycleTracker
//!                                       ▲
//!            isolate-ready / isolate-stopping / platform-stopping
//! ```
//!
//! A ping answers ALIVE, DEAD or STUCK. DEAD means the process is gone and
//! only needs a respawn; STUCK means it exists but does not answer, so it
//! is killed before the loss is announced.

pub mod error;
pub mod forker;
pub mod heartbeat;
pub mod monitor;
pub mod ping;
pub mod signals;
pub mod watch;

pub use error::{LivenessError, LivenessResult};
pub use forker::{Forker, LocalForker};
pub use heartbeat::{PeerDirectory, PeerRecord, spawn_heartbeat};
pub use monitor::{IsolateMonitor, MonitorCallback, MonitorEvent};
pub use ping::{BoxFuture, HttpCheck, OsProcessTable, Pinger, LivenessCheck, ProcessTable};
pub use signals::{HeartbeatPayload, IsolateSignal, send_lost, send_ready, send_stopping};
pub use watch::{LostIsolateWatch, WatchConfig};
