//! Errors raised while building core types.

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("composition name can't be empty")]
    EmptyName,

    #[error("duplicate component in composition: {0}")]
    DuplicateComponent(String),

    #[error("invalid duration: {0}")]
    InvalidDuration(String),
}
