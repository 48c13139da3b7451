//! flock-core — shared types of the Flock control plane.
//!
//! Pure data: components, compositions, isolates, distributions, actions,
//! the forker wire codes, and the `flock.toml` configuration. No async, no
//! I/O beyond reading a config file.

pub mod config;
pub mod error;
pub mod forker;
pub mod types;

pub use config::{FlockConfig, parse_duration};
pub use error::{CoreError, CoreResult};
pub use forker::{IsolateDescriptor, PingResult, StartCode};
pub use types::*;
