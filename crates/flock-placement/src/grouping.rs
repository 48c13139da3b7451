//! Tier-1 grouping criteria: which node hosts which component.
//!
//! Criteria run in order. Each one receives the components nobody grouped
//! yet plus the groups built so far, moves the components it has an
//! opinion about into node buckets and returns the rest.

use std::collections::BTreeSet;
use std::sync::Arc;

use flock_core::{Component, NodeDistribution};
use flock_state::HistoryStore;
use tracing::debug;

pub trait GroupingCriterion: Send + Sync {
    fn name(&self) -> &str;

    /// Group some of `components` into `groups`; return the ungrouped rest.
    fn group(
        &self,
        components: BTreeSet<Component>,
        groups: &mut NodeDistribution,
    ) -> BTreeSet<Component>;
}

/// Components with a forced node go to that node.
#[derive(Debug, Default)]
pub struct ConfiguredNodeCriterion;

impl GroupingCriterion for ConfiguredNodeCriterion {
    fn name(&self) -> &str {
        "configured-node"
    }

    fn group(
        &self,
        components: BTreeSet<Component>,
        groups: &mut NodeDistribution,
    ) -> BTreeSet<Component> {
        let (pinned, rest): (BTreeSet<_>, BTreeSet<_>) =
            components.into_iter().partition(|c| c.node.is_some());
        for component in pinned {
            let node = component.node.clone().unwrap_or_default();
            debug!(component = %component.name, %node, "component pinned to node");
            groups.entry(node).or_default().insert(component);
        }
        rest
    }
}

/// Components found in the latest top distribution go back to their node.
pub struct HistoryNodeCriterion {
    history: Arc<HistoryStore<NodeDistribution>>,
}

impl HistoryNodeCriterion {
    pub fn new(history: Arc<HistoryStore<NodeDistribution>>) -> Self {
        Self { history }
    }
}

impl GroupingCriterion for HistoryNodeCriterion {
    fn name(&self) -> &str {
        "history-node"
    }

    fn group(
        &self,
        components: BTreeSet<Component>,
        groups: &mut NodeDistribution,
    ) -> BTreeSet<Component> {
        let Some(latest) = self.history.latest() else {
            return components;
        };
        let mut rest = BTreeSet::new();
        for component in components {
            let previous = latest
                .snapshot
                .iter()
                .find(|(_, hosted)| hosted.contains(&component))
                .map(|(node, _)| node.clone());
            match previous {
                Some(node) => {
                    groups.entry(node).or_default().insert(component);
                }
                None => {
                    rest.insert(component);
                }
            }
        }
        rest
    }
}

/// Components join the first node already holding their language.
#[derive(Debug, Default)]
pub struct LanguageGroupCriterion;

impl GroupingCriterion for LanguageGroupCriterion {
    fn name(&self) -> &str {
        "language-group"
    }

    fn group(
        &self,
        components: BTreeSet<Component>,
        groups: &mut NodeDistribution,
    ) -> BTreeSet<Component> {
        let mut rest = BTreeSet::new();
        for component in components {
            let node = groups
                .iter()
                .find(|(_, hosted)| hosted.iter().any(|c| c.language == component.language))
                .map(|(node, _)| node.clone());
            match node {
                Some(node) => {
                    groups.entry(node).or_default().insert(component);
                }
                None => {
                    rest.insert(component);
                }
            }
        }
        rest
    }
}
