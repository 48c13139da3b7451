//! flock-actions — from domain events to executed actions.
//!
//! ```text
//! DomainEvent ──► RuleEngine ──► [Action, ..] ──push──► ActionQueue (FIFO)
//!                                                           │ single consumer
//!                                                           ▼
//!                                                    ActionExecutor
//!                                                 kind → handler | fallback
//! ```
//!
//! Actions run strictly one at a time in arrival order. A failing or
//! panicking handler is logged and counted; the consumer moves on.

pub mod error;
pub mod event;
pub mod executor;
pub mod queue;
pub mod rules;

pub use error::{ActionError, ActionResult};
pub use event::DomainEvent;
pub use executor::{ActionExecutor, BoxFuture, Handler, handler};
pub use queue::{ActionQueue, QueueStats};
pub use rules::{ANY_ISOLATE, Rule, RuleEngine, kinds};
