//! Domain events fed to the rule engine.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum DomainEvent {
    AgentReady { isolate: String, node: String },
    AgentLost { isolate: String, node: String },
    FactoryRegistered { factory: String, language: String },
    FactoryUnregistered { factory: String, language: String },
    Timer { tick: u64 },
}

impl DomainEvent {
    /// Rule name the event is dispatched under.
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::AgentReady { .. } => "agent-ready",
            DomainEvent::AgentLost { .. } => "agent-lost",
            DomainEvent::FactoryRegistered { .. } => "factory-registered",
            DomainEvent::FactoryUnregistered { .. } => "factory-unregistered",
            DomainEvent::Timer { .. } => "timer",
        }
    }
}
