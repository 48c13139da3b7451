//! Generic finite state machine.
//!
//! A [`Definition`] is built once (states, transitions, start state) and
//! shared; each [`StateMachine`] instance only carries its current state.
//! Events with no transition from the current state leave it unchanged and
//! are reported as [`Step::Undefined`].

use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{FsmError, FsmResult};

/// Bounds shared by state and event types.
pub trait Symbol: Copy + Eq + Hash + Ord + Debug + Send + Sync + 'static {}

impl<T> Symbol for T where T: Copy + Eq + Hash + Ord + Debug + Send + Sync + 'static {}

/// Outcome of handling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step<S, E> {
    /// The machine moved to a different state.
    Moved { from: S, event: E, to: S },
    /// A defined transition that loops on the current state.
    Stayed { state: S, event: E },
    /// No transition for this event in the current state.
    Undefined { state: S, event: E },
}

impl<S: Copy, E> Step<S, E> {
    /// State after the step.
    pub fn state(&self) -> S {
        match self {
            Step::Moved { to, .. } => *to,
            Step::Stayed { state, .. } | Step::Undefined { state, .. } => *state,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Step::Undefined { .. })
    }
}

/// Immutable description of a state machine.
#[derive(Debug)]
pub struct Definition<S, E> {
    name: String,
    start: S,
    states: BTreeSet<S>,
    transitions: HashMap<(S, E), S>,
}

impl<S: Symbol, E: Symbol> Definition<S, E> {
    pub fn builder(name: &str) -> DefinitionBuilder<S, E> {
        DefinitionBuilder {
            name: name.to_string(),
            states: BTreeSet::new(),
            transitions: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> S {
        self.start
    }

    pub fn states(&self) -> impl Iterator<Item = S> + '_ {
        self.states.iter().copied()
    }

    /// Target of `(state, event)`, if defined.
    pub fn target(&self, state: S, event: E) -> Option<S> {
        self.transitions.get(&(state, event)).copied()
    }
}

pub struct DefinitionBuilder<S, E> {
    name: String,
    states: BTreeSet<S>,
    transitions: HashMap<(S, E), S>,
}

impl<S: Symbol, E: Symbol> DefinitionBuilder<S, E> {
    pub fn state(mut self, state: S) -> FsmResult<Self> {
        if !self.states.insert(state) {
            return Err(FsmError::DuplicateState(format!("{state:?}")));
        }
        Ok(self)
    }

    pub fn states(self, states: &[S]) -> FsmResult<Self> {
        states.iter().try_fold(self, |builder, state| builder.state(*state))
    }

    pub fn transition(mut self, from: S, event: E, to: S) -> FsmResult<Self> {
        for state in [from, to] {
            if !self.states.contains(&state) {
                return Err(FsmError::UnknownState(format!("{state:?}")));
            }
        }
        if self.transitions.insert((from, event), to).is_some() {
            return Err(FsmError::DuplicateTransition {
                state: format!("{from:?}"),
                event: format!("{event:?}"),
            });
        }
        Ok(self)
    }

    pub fn build(self, start: S) -> FsmResult<Definition<S, E>> {
        if !self.states.contains(&start) {
            return Err(FsmError::UnknownState(format!("{start:?}")));
        }
        Ok(Definition {
            name: self.name,
            start,
            states: self.states,
            transitions: self.transitions,
        })
    }
}

/// One running instance of a [`Definition`].
#[derive(Debug, Clone)]
pub struct StateMachine<S, E> {
    definition: Arc<Definition<S, E>>,
    state: S,
}

impl<S: Symbol, E: Symbol> StateMachine<S, E> {
    pub fn new(definition: Arc<Definition<S, E>>) -> Self {
        let state = definition.start();
        Self { definition, state }
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn handle(&mut self, event: E) -> Step<S, E> {
        let from = self.state;
        match self.definition.target(from, event) {
            Some(to) if to == from => {
                debug!(fsm = %self.definition.name, state = ?from, ?event, "absorbed event");
                Step::Stayed { state: from, event }
            }
            Some(to) => {
                self.state = to;
                debug!(fsm = %self.definition.name, ?from, ?event, ?to, "transition");
                Step::Moved { from, event, to }
            }
            None => {
                warn!(
                    fsm = %self.definition.name,
                    state = ?from,
                    ?event,
                    "no transition, event ignored"
                );
                Step::Undefined { state: from, event }
            }
        }
    }
}
