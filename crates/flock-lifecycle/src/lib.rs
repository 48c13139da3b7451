//! flock-lifecycle — isolate lifecycle tracking.
//!
//! [`fsm`] is a small, generic state machine runtime; [`isolate`] defines
//! the isolate lifecycle table on top of it and [`tracker`] keeps one
//! machine per isolate uid, serializing events per uid.

pub mod error;
pub mod fsm;
pub mod isolate;
pub mod tracker;

pub use error::{FsmError, FsmResult};
pub use fsm::{Definition, StateMachine, Step};
pub use isolate::{IsolateEvent, IsolateState, isolate_lifecycle};
pub use tracker::{ArchivedIsolate, IsolateStep, LifecycleTracker};
