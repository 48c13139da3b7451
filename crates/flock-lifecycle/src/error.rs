//! State machine definition errors.
//!
//! Handling an event never fails: undefined transitions are logged no-ops.

use thiserror::Error;

pub type FsmResult<T> = Result<T, FsmError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FsmError {
    #[error("state already defined: {0}")]
    DuplicateState(String),

    #[error("unknown state: {0}")]
    UnknownState(String),

    #[error("transition already defined: ({state}, {event})")]
    DuplicateTransition { state: String, event: String },
}
