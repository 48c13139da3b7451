//! Rule engine: domain events → actions.
//!
//! Rules are registered by event name at setup. An event without a rule
//! goes to the fallback, which by default produces nothing.

use std::collections::HashMap;
use std::sync::Arc;

use flock_core::Action;
use serde_json::json;
use tracing::debug;

use crate::event::DomainEvent;

pub type Rule = Arc<dyn Fn(&DomainEvent) -> Vec<Action> + Send + Sync>;

/// Action kinds produced by the default rules.
pub mod kinds {
    pub const INSTANTIATE: &str = "instantiate";
    pub const REDISTRIBUTE: &str = "redistribute";
    pub const INSTANTIATE_WAITING: &str = "instantiate-waiting";
    pub const COMPONENTS_GONE: &str = "components-gone";
}

/// Target of actions that concern no isolate in particular.
pub const ANY_ISOLATE: &str = "*";

pub struct RuleEngine {
    rules: HashMap<String, Rule>,
    fallback: Rule,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new(Arc::new(|event: &DomainEvent| {
            debug!(event = event.name(), "no rule for event");
            Vec::new()
        }))
    }
}

impl RuleEngine {
    pub fn new(fallback: Rule) -> Self {
        Self {
            rules: HashMap::new(),
            fallback,
        }
    }

    /// Engine with the standard reactions to agent and factory events.
    pub fn with_default_rules() -> Self {
        let mut engine = Self::default();
        engine.register(
            "agent-ready",
            Arc::new(|event: &DomainEvent| match event {
                DomainEvent::AgentReady { isolate, node } => {
                    vec![Action::new(isolate, kinds::INSTANTIATE, json!({ "node": node }))]
                }
                _ => Vec::new(),
            }),
        );
        engine.register(
            "agent-lost",
            Arc::new(|event: &DomainEvent| match event {
                DomainEvent::AgentLost { isolate, node } => {
                    vec![Action::new(isolate, kinds::REDISTRIBUTE, json!({ "node": node }))]
                }
                _ => Vec::new(),
            }),
        );
        engine.register(
            "factory-registered",
            Arc::new(|event: &DomainEvent| match event {
                DomainEvent::FactoryRegistered { factory, language } => vec![Action::new(
                    ANY_ISOLATE,
                    kinds::INSTANTIATE_WAITING,
                    json!({ "factory": factory, "language": language }),
                )],
                _ => Vec::new(),
            }),
        );
        engine.register(
            "factory-unregistered",
            Arc::new(|event: &DomainEvent| match event {
                DomainEvent::FactoryUnregistered { factory, language } => vec![Action::new(
                    ANY_ISOLATE,
                    kinds::COMPONENTS_GONE,
                    json!({ "factory": factory, "language": language }),
                )],
                _ => Vec::new(),
            }),
        );
        engine
    }

    /// Register (or replace) the rule for an event name.
    pub fn register(&mut self, name: &str, rule: Rule) {
        self.rules.insert(name.to_string(), rule);
    }

    pub fn evaluate(&self, event: &DomainEvent) -> Vec<Action> {
        let rule = self.rules.get(event.name()).unwrap_or(&self.fallback);
        let actions = rule(event);
        debug!(event = event.name(), actions = actions.len(), "rule evaluated");
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rules() {
        let engine = RuleEngine::with_default_rules();
        let actions = engine.evaluate(&DomainEvent::AgentLost {
            isolate: "iso1".to_string(),
            node: "n1".to_string(),
        });
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, kinds::REDISTRIBUTE);
        assert_eq!(actions[0].payload["node"], "n1");

        let actions = engine.evaluate(&DomainEvent::FactoryRegistered {
            factory: "f".to_string(),
            language: "python".to_string(),
        });
        assert_eq!(actions[0].isolate, ANY_ISOLATE);
        assert_eq!(actions[0].kind, kinds::INSTANTIATE_WAITING);
    }

    #[test]
    fn unknown_events_use_the_fallback() {
        let engine = RuleEngine::with_default_rules();
        assert!(engine.evaluate(&DomainEvent::Timer { tick: 1 }).is_empty());

        let mut engine = RuleEngine::new(Arc::new(|event: &DomainEvent| {
            vec![Action::new(ANY_ISOLATE, event.name(), serde_json::Value::Null)]
        }));
        assert_eq!(engine.evaluate(&DomainEvent::Timer { tick: 2 })[0].kind, "timer");

        engine.register("timer", Arc::new(|_: &DomainEvent| Vec::new()));
        assert!(engine.evaluate(&DomainEvent::Timer { tick: 3 }).is_empty());
    }
}
