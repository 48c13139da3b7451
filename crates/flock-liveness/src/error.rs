use thiserror::Error;

use flock_bus::BusError;

pub type LivenessResult<T> = Result<T, LivenessError>;

#[derive(Debug, Error)]
pub enum LivenessError {
    /// No route to the addressed peer.
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("{operation} timed out for isolate {uid}")]
    Timeout { uid: String, operation: &'static str },

    #[error("unknown isolate: {0}")]
    UnknownIsolate(String),

    #[error("failed to spawn isolate {uid}: {reason}")]
    Spawn { uid: String, reason: String },

    /// The platform is shutting down; no new isolate is started.
    #[error("platform stopping, isolate {0} not started")]
    PlatformStopping(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}
