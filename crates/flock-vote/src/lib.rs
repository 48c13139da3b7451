//! flock-vote — the voting engine behind isolate placement.
//!
//! Electors (placement criteria) fill a [`Ballot`] per round or force the
//! result with a coup; a [`VoteKind`] turns the ballots into a
//! [`RoundOutcome`]; the [`VoteEngine`] chains rounds until a candidate is
//! elected. Coups and runoffs are plain enum variants, matched by callers.

pub mod ballot;
pub mod engine;
pub mod kind;

pub use ballot::Ballot;
pub use engine::{ElectionResult, Elector, Round, Verdict, VoteEngine};
pub use kind::{Approval, Majority, RoundOutcome, VoteKind};
