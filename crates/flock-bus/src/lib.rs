//! flock-bus — subject and audience routed signals.
//!
//! Heartbeats, lifecycle signals and stop signals all travel over a
//! [`Bus`]. The in-process [`LocalBus`] is what a single `flockd` uses;
//! any transport can implement the same trait.

pub mod bus;
pub mod error;

pub use bus::{
    Audience, Bus, LocalBus, Member, Message, Subscription, listen, subject_matches, subjects,
};
pub use error::{BusError, BusResult};
