use thiserror::Error;

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Error)]
pub enum BusError {
    /// Nobody is listening on the addressed route.
    #[error("no route for {subject} ({audience})")]
    Unreachable { subject: String, audience: String },
}
