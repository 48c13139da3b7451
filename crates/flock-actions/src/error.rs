//! Action pipeline errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ActionError {
    /// A handler failed. Logged by the executor; the queue goes on.
    #[error("action {kind} on {isolate} failed: {reason}")]
    ActionExecution {
        kind: String,
        isolate: String,
        reason: String,
    },

    #[error("action queue closed")]
    QueueClosed,

    #[error("action queue already has a consumer")]
    ConsumerTaken,
}

pub type ActionResult<T> = Result<T, ActionError>;

impl ActionError {
    pub fn execution(action: &flock_core::Action, reason: impl ToString) -> Self {
        ActionError::ActionExecution {
            kind: action.kind.clone(),
            isolate: action.isolate.clone(),
            reason: reason.to_string(),
        }
    }
}
