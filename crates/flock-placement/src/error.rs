//! Placement errors.
//!
//! Only structural failures reach the caller of a whole batch; a missing
//! factory excludes its component and the batch goes on.

use thiserror::Error;

use flock_core::CoreError;
use flock_state::StateError;

pub type PlacementResult<T> = Result<T, PlacementError>;

#[derive(Debug, Error)]
pub enum PlacementError {
    /// A composition or distribution with this name or uid is already stored.
    #[error("placement conflict: {0} is already in use")]
    PlacementConflict(String),

    #[error("no repository provides factory {factory} for component {component}")]
    FactoryNotFound { component: String, factory: String },

    /// A mandatory bundle could not be installed; the isolate cannot boot.
    #[error("failed to install bundle {bundle} for isolate {isolate}: {reason}")]
    BundleInstallFailure {
        isolate: String,
        bundle: String,
        reason: String,
    },

    #[error("unknown distribution: {0}")]
    UnknownDistribution(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("state store: {0}")]
    State(StateError),
}

impl From<StateError> for PlacementError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Conflict(name) => PlacementError::PlacementConflict(name),
            other => PlacementError::State(other),
        }
    }
}
