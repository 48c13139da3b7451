//! Shared types used across Flock crates.
//!
//! Components and isolates compare by name: a component is unique within a
//! composition, an isolate is unique on its node. Collections use ordered
//! maps and sets so that serialized distributions are byte-stable.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

/// Name of a node (machine hosting isolates).
pub type NodeName = String;

/// Unique identifier of a running isolate.
pub type IsolateUid = String;

/// Name of the node bucket receiving components no criterion grouped.
pub const UNDEFINED_NODE: &str = "undefined";

// ── Component ─────────────────────────────────────────────────────

/// A component to place, as described by a composition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    /// Factory used to instantiate the component.
    pub factory: String,
    /// Implementation language ("python", "java", ...).
    pub language: String,
    /// Bundle expected to provide the factory.
    #[serde(default)]
    pub bundle_name: Option<String>,
    /// Version requirement on the providing bundle.
    #[serde(default)]
    pub bundle_version: Option<String>,
    /// Forced node, if pinned by configuration.
    #[serde(default)]
    pub node: Option<NodeName>,
    /// Forced isolate name, if pinned by configuration.
    #[serde(default)]
    pub isolate: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    /// Field name → name of the wired component.
    #[serde(default)]
    pub wires: BTreeMap<String, String>,
}

impl Component {
    pub fn new(name: &str, factory: &str, language: &str) -> Self {
        Self {
            name: name.to_string(),
            factory: factory.to_string(),
            language: language.to_string(),
            bundle_name: None,
            bundle_version: None,
            node: None,
            isolate: None,
            properties: BTreeMap::new(),
            wires: BTreeMap::new(),
        }
    }

    pub fn on_node(mut self, node: &str) -> Self {
        self.node = Some(node.to_string());
        self
    }

    pub fn in_isolate(mut self, isolate: &str) -> Self {
        self.isolate = Some(isolate.to_string());
        self
    }
}

impl PartialEq for Component {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Component {}

impl Hash for Component {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl PartialOrd for Component {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Component {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

// ── Composition ───────────────────────────────────────────────────

/// A named, immutable set of components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Composition {
    name: String,
    components: Vec<Component>,
}

impl Composition {
    /// Build a composition, rejecting empty names and duplicate components.
    pub fn new(name: &str, components: Vec<Component>) -> CoreResult<Self> {
        if name.trim().is_empty() {
            return Err(CoreError::EmptyName);
        }
        let mut seen = BTreeSet::new();
        for component in &components {
            if !seen.insert(component.name.as_str()) {
                return Err(CoreError::DuplicateComponent(component.name.clone()));
            }
        }
        Ok(Self {
            name: name.to_string(),
            components,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }
}

// ── Isolate ───────────────────────────────────────────────────────

/// A concrete isolate, once an election round committed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Isolate {
    /// Assigned once the isolate has been requested from a forker.
    pub uid: Option<IsolateUid>,
    pub name: String,
    pub language: Option<String>,
    pub node: NodeName,
    pub components: BTreeSet<Component>,
}

impl Isolate {
    pub fn new(name: &str, language: Option<&str>, node: &str) -> Self {
        Self {
            uid: None,
            name: name.to_string(),
            language: language.map(str::to_string),
            node: node.to_string(),
            components: BTreeSet::new(),
        }
    }

    /// Runtime kind used to boot an isolate of this language.
    pub fn kind(&self) -> &'static str {
        isolate_kind(self.language.as_deref())
    }

    pub fn factories(&self) -> BTreeSet<&str> {
        self.components.iter().map(|c| c.factory.as_str()).collect()
    }
}

/// Runtime kind for an implementation language.
pub fn isolate_kind(language: Option<&str>) -> &'static str {
    match language {
        Some("java") => "osgi",
        Some(lang) if lang.starts_with("python") => "pelix",
        _ => "boot",
    }
}

/// Whether an isolate language can host a component language.
pub fn language_compatible(isolate: Option<&str>, component: &str) -> bool {
    isolate.is_none_or(|lang| lang == component)
}

// ── Distributions ─────────────────────────────────────────────────

/// Node → components placed on it (top tier).
pub type NodeDistribution = BTreeMap<NodeName, BTreeSet<Component>>;

/// Isolate name → component names hosted by it (node tier).
pub type IsolateDistribution = BTreeMap<String, BTreeSet<String>>;

/// Distribution of a whole composition, as handed across processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopDistribution {
    pub name: String,
    pub nodes: NodeDistribution,
}

impl TopDistribution {
    /// Content-derived identifier: identical distributions share a uid.
    pub fn content_uid(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        for (node, components) in &self.nodes {
            hasher.update(b"\0");
            hasher.update(node.as_bytes());
            for component in components {
                hasher.update(b"\x01");
                hasher.update(component.name.as_bytes());
            }
        }
        let digest = hex::encode(hasher.finalize());
        format!("dist-{}", &digest[..16])
    }

    pub fn node_of(&self, component: &str) -> Option<&str> {
        self.nodes
            .iter()
            .find(|(_, components)| components.iter().any(|c| c.name == component))
            .map(|(node, _)| node.as_str())
    }
}

// ── Bundles ───────────────────────────────────────────────────────

/// An artifact providing component factories.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Bundle {
    pub name: String,
    pub version: String,
    pub language: String,
    /// Whether the isolate may boot without it.
    #[serde(default)]
    pub optional: bool,
}

// ── Actions ───────────────────────────────────────────────────────

/// A unit of work derived from a domain event by the rule engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Isolate the action targets.
    pub isolate: String,
    /// Kind tag used to select the handler.
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Action {
    pub fn new(isolate: &str, kind: &str, payload: serde_json::Value) -> Self {
        Self {
            isolate: isolate.to_string(),
            kind: kind.to_string(),
            payload,
        }
    }
}
