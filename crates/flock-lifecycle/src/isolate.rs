//! Isolate lifecycle: states, events and the transition table.
//!
//! ```text
//!   WAITING   ─requested─► REQUESTED ─starting─► STARTING ─ready─► READY
//!   REQUESTED ─gone──────► WAITING                 STARTING ─gone──► GONE
//!   READY     ─stopping──► STOPPING ─gone──► GONE  READY    ─gone──► GONE
//! ```
//!
//! The ready signal of a fast isolate can overtake the start acknowledgment,
//! so REQUESTED accepts `ready` directly and READY absorbs a late `starting`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::FsmResult;
use crate::fsm::Definition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolateState {
    Waiting,
    Requested,
    Starting,
    Ready,
    Stopping,
    Gone,
}

impl IsolateState {
    pub fn is_terminal(self) -> bool {
        self == IsolateState::Gone
    }
}

impl fmt::Display for IsolateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolateState::Waiting => "WAITING",
            IsolateState::Requested => "REQUESTED",
            IsolateState::Starting => "STARTING",
            IsolateState::Ready => "READY",
            IsolateState::Stopping => "STOPPING",
            IsolateState::Gone => "GONE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolateEvent {
    Requested,
    Starting,
    Ready,
    Stopping,
    Gone,
}

impl fmt::Display for IsolateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolateEvent::Requested => "requested",
            IsolateEvent::Starting => "starting",
            IsolateEvent::Ready => "ready",
            IsolateEvent::Stopping => "stopping",
            IsolateEvent::Gone => "gone",
        };
        f.write_str(name)
    }
}

/// Build the isolate lifecycle table.
pub fn isolate_lifecycle() -> FsmResult<Arc<Definition<IsolateState, IsolateEvent>>> {
    use IsolateEvent as E;
    use IsolateState as S;

    let definition = Definition::builder("isolate")
        .states(&[
            S::Waiting,
            S::Requested,
            S::Starting,
            S::Ready,
            S::Stopping,
            S::Gone,
        ])?
        .transition(S::Waiting, E::Requested, S::Requested)?
        // Placement request failed: start over.
        .transition(S::Requested, E::Gone, S::Waiting)?
        .transition(S::Requested, E::Starting, S::Starting)?
        .transition(S::Requested, E::Ready, S::Ready)?
        .transition(S::Starting, E::Ready, S::Ready)?
        .transition(S::Starting, E::Gone, S::Gone)?
        .transition(S::Ready, E::Starting, S::Ready)?
        .transition(S::Ready, E::Ready, S::Ready)?
        .transition(S::Ready, E::Stopping, S::Stopping)?
        .transition(S::Ready, E::Gone, S::Gone)?
        .transition(S::Stopping, E::Stopping, S::Stopping)?
        .transition(S::Stopping, E::Gone, S::Gone)?
        .transition(S::Gone, E::Gone, S::Gone)?
        .build(S::Waiting)?;
    Ok(Arc::new(definition))
}
