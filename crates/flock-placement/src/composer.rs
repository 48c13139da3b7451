//! Top and node composers.
//!
//! The top composer splits a composition across nodes and hands the result
//! over through the distribution store. A node composer places the
//! components it receives into isolates of its node and keeps the crash
//! bookkeeping that later placements consult.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use flock_core::{
    Bundle, Component, Composition, Isolate, IsolateDistribution, NodeDistribution, TopDistribution,
    config::PlacementConfig,
};
use flock_state::{CompatibilityStore, DistributionStore, HistoryStore, RatingStore, StateStore};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::distributor::{
    IsolateDistributor, IsolateElector, NodeDistributor, vote_engine_from_config,
};
use crate::electors::{
    CompatibilityElector, ConfiguredIsolateElector, HistoryElector, ReliabilityElector,
};
use crate::error::{PlacementError, PlacementResult};
use crate::resolver::FactoryResolver;

// ── Top composer ──────────────────────────────────────────────────

pub struct TopComposer {
    store: StateStore,
    distributor: NodeDistributor,
    history: Arc<HistoryStore<NodeDistribution>>,
}

impl TopComposer {
    pub fn new(
        store: StateStore,
        distributor: NodeDistributor,
        history: Arc<HistoryStore<NodeDistribution>>,
    ) -> Self {
        Self {
            store,
            distributor,
            history,
        }
    }

    /// Distribute a new composition across nodes.
    ///
    /// Returns the uid under which the distribution was stored.
    pub fn instantiate(
        &self,
        composition: &Composition,
    ) -> PlacementResult<(String, TopDistribution)> {
        self.store.put_composition(composition)?;
        let distribution = TopDistribution {
            name: composition.name().to_string(),
            nodes: self.distributor.distribute(composition.components().iter().cloned()),
        };
        let uid = distribution.content_uid();
        if let Err(e) = self.store.store(&uid, &distribution) {
            // Keep the name free for a retry.
            let _ = self.store.remove_composition(composition.name());
            return Err(e.into());
        }
        self.record_history()?;
        info!(
            %uid,
            composition = composition.name(),
            nodes = distribution.nodes.len(),
            "composition instantiated"
        );
        Ok((uid, distribution))
    }

    /// Forget a distribution and its composition. Returns false if unknown.
    pub fn stop(&self, uid: &str) -> PlacementResult<bool> {
        let Some(distribution) = self.store.load(uid)? else {
            return Ok(false);
        };
        self.store.remove(uid)?;
        self.store.remove_composition(&distribution.name)?;
        self.record_history()?;
        info!(%uid, composition = %distribution.name, "composition stopped");
        Ok(true)
    }

    /// Adopt a distribution computed elsewhere. A uid already in use is a conflict.
    pub fn reload(&self, uid: &str, distribution: &TopDistribution) -> PlacementResult<()> {
        if self.store.load(uid)?.is_some() {
            return Err(PlacementError::PlacementConflict(uid.to_string()));
        }
        self.store.store(uid, distribution)?;
        self.record_history()?;
        info!(%uid, composition = %distribution.name, "distribution reloaded");
        Ok(())
    }

    /// Recompute the node assignment of a stored distribution.
    pub fn redistribute(&self, uid: &str) -> PlacementResult<TopDistribution> {
        let current = self
            .store
            .load(uid)?
            .ok_or_else(|| PlacementError::UnknownDistribution(uid.to_string()))?;
        let components: Vec<Component> = current.nodes.values().flatten().cloned().collect();
        let distribution = TopDistribution {
            name: current.name.clone(),
            nodes: self.distributor.distribute(components),
        };
        if distribution != current {
            info!(%uid, composition = %current.name, "distribution changed");
            self.store.store(uid, &distribution)?;
        }
        self.record_history()?;
        Ok(distribution)
    }

    pub fn distributions(&self) -> PlacementResult<Vec<(String, TopDistribution)>> {
        let mut result = Vec::new();
        for uid in self.store.list_uids()? {
            if let Some(distribution) = self.store.load(&uid)? {
                result.push((uid, distribution));
            }
        }
        Ok(result)
    }

    /// Snapshot every stored distribution, merged per node.
    fn record_history(&self) -> PlacementResult<()> {
        let mut merged = NodeDistribution::new();
        for (_, distribution) in self.distributions()? {
            for (node, components) in distribution.nodes {
                merged.entry(node).or_default().extend(components);
            }
        }
        self.history.store(merged);
        Ok(())
    }
}

// ── Node composer ─────────────────────────────────────────────────

/// Runtime knowledge shared by a node's placement criteria.
#[derive(Clone)]
pub struct PlacementStores {
    pub ratings: Arc<RatingStore>,
    pub compatibilities: Arc<CompatibilityStore>,
    pub history: Arc<HistoryStore<IsolateDistribution>>,
}

impl PlacementStores {
    pub fn new(default_rating: u8) -> Self {
        Self {
            ratings: Arc::new(RatingStore::new(default_rating)),
            compatibilities: Arc::new(CompatibilityStore::new(default_rating)),
            history: Arc::new(HistoryStore::new()),
        }
    }
}

/// Result of a node-level placement.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodePlacement {
    /// Running isolates that received components.
    pub updated: Vec<Isolate>,
    /// Isolates to start.
    pub new: Vec<Isolate>,
    /// Components whose factory no repository provides.
    pub missing: Vec<String>,
}

pub struct NodeComposer {
    node: String,
    store: StateStore,
    resolver: FactoryResolver,
    distributor: IsolateDistributor,
    stores: PlacementStores,
    history_elector: Arc<HistoryElector>,
    history_retention: Duration,
    counter: AtomicU32,
}

impl NodeComposer {
    pub fn new(
        node: &str,
        store: StateStore,
        resolver: FactoryResolver,
        stores: PlacementStores,
        config: &PlacementConfig,
        history_retention: Duration,
    ) -> Self {
        let history_elector = Arc::new(HistoryElector::new(Arc::clone(&stores.history)));
        let electors: Vec<IsolateElector> = vec![
            Arc::new(ConfiguredIsolateElector),
            Arc::new(CompatibilityElector::new(Arc::clone(&stores.compatibilities))),
            Arc::new(ReliabilityElector::new(Arc::clone(&stores.ratings))),
            Arc::clone(&history_elector) as IsolateElector,
        ];
        Self {
            node: node.to_string(),
            store,
            resolver,
            distributor: IsolateDistributor::new(vote_engine_from_config(config), electors),
            stores,
            history_elector,
            history_retention,
            counter: AtomicU32::new(0),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn stores(&self) -> &PlacementStores {
        &self.stores
    }

    pub fn isolates(&self) -> PlacementResult<Vec<Isolate>> {
        Ok(self.store.list_isolates(&self.node)?)
    }

    /// Bundles an isolate must install to host its components.
    pub fn bundles(&self, isolate: &Isolate) -> Vec<Bundle> {
        let bundles: BTreeSet<Bundle> = isolate
            .components
            .iter()
            .filter_map(|c| self.resolver.resolve(c).ok())
            .collect();
        bundles.into_iter().collect()
    }

    /// Place `components` on this node.
    pub fn instantiate(&self, components: &[Component]) -> PlacementResult<NodePlacement> {
        let mut missing = Vec::new();
        let mut resolved = BTreeSet::new();
        for component in components {
            match self.resolver.resolve(component) {
                Ok(_) => {
                    resolved.insert(component.clone());
                }
                Err(e @ PlacementError::FactoryNotFound { .. }) => {
                    warn!(
                        node = %self.node,
                        component = %component.name,
                        error = %e,
                        "component excluded"
                    );
                    missing.push(component.name.clone());
                }
                Err(e) => return Err(e),
            }
        }
        if resolved.is_empty() {
            return Ok(NodePlacement {
                missing,
                ..NodePlacement::default()
            });
        }

        let existing = self.isolates()?;
        let mut plan = self.distributor.distribute(&resolved, &existing);

        let mut used: BTreeSet<String> = plan
            .candidates
            .iter()
            .filter_map(|c| c.name().map(str::to_string))
            .collect();
        for slot in plan.new.clone() {
            let candidate = &mut plan.candidates[slot];
            let name = candidate
                .ensure_name(|language| self.next_name(language, &used))
                .to_string();
            used.insert(name);
        }

        let mut placement = NodePlacement {
            missing,
            ..NodePlacement::default()
        };
        for (slot, candidate) in plan.candidates.iter().enumerate() {
            let isolate = candidate.to_isolate(&self.node);
            match existing.get(slot) {
                Some(before) if before.components == isolate.components => continue,
                Some(_) if isolate.components.is_empty() => {
                    self.store.remove_isolate(&self.node, &isolate.name)?;
                    debug!(node = %self.node, isolate = %isolate.name, "isolate emptied");
                    continue;
                }
                _ => self.store.put_isolate(&isolate)?,
            }
            if plan.updated.contains(&slot) {
                placement.updated.push(isolate);
            } else if plan.new.contains(&slot) {
                placement.new.push(isolate);
            }
        }

        self.record_history()?;
        info!(
            node = %self.node,
            updated = placement.updated.len(),
            new = placement.new.len(),
            missing = placement.missing.len(),
            "components placed"
        );
        Ok(placement)
    }

    /// Re-run the placement of components already on this node.
    ///
    /// With unchanged inputs the result is the current distribution.
    pub fn redistribute(&self, components: &[Component]) -> PlacementResult<IsolateDistribution> {
        self.instantiate(components)?;
        self.isolate_distribution()
    }

    /// Remove components from their isolates. Returns the isolates left empty.
    pub fn kill(&self, names: &[String]) -> PlacementResult<Vec<String>> {
        let mut emptied = Vec::new();
        for mut isolate in self.isolates()? {
            let before = isolate.components.len();
            isolate.components.retain(|c| !names.contains(&c.name));
            if isolate.components.len() == before {
                continue;
            }
            if isolate.components.is_empty() {
                self.store.remove_isolate(&self.node, &isolate.name)?;
                emptied.push(isolate.name.clone());
            } else {
                self.store.put_isolate(&isolate)?;
            }
        }
        self.record_history()?;
        info!(
            node = %self.node,
            killed = names.len(),
            emptied = emptied.len(),
            "components killed"
        );
        Ok(emptied)
    }

    /// Crash bookkeeping for a lost isolate. Returns its components.
    pub fn isolate_lost(&self, name: &str) -> PlacementResult<Vec<Component>> {
        let Some(isolate) = self.store.get_isolate(&self.node, name)? else {
            debug!(node = %self.node, isolate = %name, "lost isolate unknown here");
            return Ok(Vec::new());
        };
        self.store.remove_isolate(&self.node, name)?;

        let factories: Vec<String> = isolate.factories().into_iter().map(str::to_string).collect();
        let names: Vec<String> = isolate.components.iter().map(|c| c.name.clone()).collect();
        self.stores.ratings.on_crash(&factories);
        self.stores.compatibilities.on_crash(&factories);
        self.history_elector.on_crash(&names);
        warn!(node = %self.node, isolate = %name, components = names.len(), "isolate lost");
        Ok(isolate.components.into_iter().collect())
    }

    /// Lost isolate: record the crash, then place its components again.
    pub fn handle_lost(&self, name: &str) -> PlacementResult<NodePlacement> {
        let components = self.isolate_lost(name)?;
        if components.is_empty() {
            return Ok(NodePlacement::default());
        }
        self.instantiate(&components)
    }

    /// Periodic tick: healthy isolates earn trust, old history goes away.
    pub fn on_timer(&self) -> PlacementResult<()> {
        let isolates = self.isolates()?;
        let groups: Vec<Vec<String>> = isolates
            .iter()
            .map(|i| i.factories().into_iter().map(str::to_string).collect())
            .collect();
        let factories: Vec<String> = groups.iter().flatten().cloned().collect();
        self.stores.ratings.on_timer(&factories);
        self.stores.compatibilities.on_timer(&groups);
        let pruned = self.stores.history.prune_older_than(self.history_retention);
        if pruned > 0 {
            debug!(node = %self.node, pruned, "history pruned");
        }
        Ok(())
    }

    pub fn isolate_distribution(&self) -> PlacementResult<IsolateDistribution> {
        Ok(self
            .isolates()?
            .into_iter()
            .map(|i| {
                let names = i.components.iter().map(|c| c.name.clone()).collect();
                (i.name, names)
            })
            .collect())
    }

    fn record_history(&self) -> PlacementResult<()> {
        self.stores.history.store(self.isolate_distribution()?);
        Ok(())
    }

    fn next_name(&self, language: Option<&str>, used: &BTreeSet<String>) -> String {
        let language = language.unwrap_or("any");
        loop {
            let index = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
            let name = format!("{}-{}-auto{:02}", self.node, language, index);
            if !used.contains(&name) {
                return name;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::{ConfiguredNodeCriterion, GroupingCriterion, HistoryNodeCriterion};
    use crate::resolver::StaticRepository;
    use flock_core::Bundle;

    fn component(name: &str) -> Component {
        Component::new(name, &format!("factory.{name}"), "python")
    }

    fn repository(names: &[&str]) -> FactoryResolver {
        let mut repo = StaticRepository::new("python");
        for name in names {
            repo = repo.with_factory(
                &format!("factory.{name}"),
                Bundle {
                    name: format!("pkg.{name}"),
                    version: "1.0.0".to_string(),
                    language: "python".to_string(),
                    optional: false,
                },
            );
        }
        FactoryResolver::new(vec![Arc::new(repo)])
    }

    fn node_composer(store: StateStore, names: &[&str]) -> NodeComposer {
        NodeComposer::new(
            "n1",
            store,
            repository(names),
            PlacementStores::new(50),
            &PlacementConfig::default(),
            Duration::from_secs(3600),
        )
    }

    fn top_composer(store: StateStore) -> TopComposer {
        let history = Arc::new(HistoryStore::new());
        let criteria: Vec<Arc<dyn GroupingCriterion>> = vec![
            Arc::new(ConfiguredNodeCriterion),
            Arc::new(HistoryNodeCriterion::new(Arc::clone(&history))),
        ];
        TopComposer::new(store, NodeDistributor::new(criteria, "undefined"), history)
    }

    #[test]
    fn duplicate_composition_is_a_conflict() {
        let composer = top_composer(StateStore::open_in_memory().unwrap());
        let composition = Composition::new("app", vec![component("a")]).unwrap();
        composer.instantiate(&composition).unwrap();
        let err = composer.instantiate(&composition).unwrap_err();
        assert!(matches!(err, PlacementError::PlacementConflict(name) if name == "app"));
    }

    #[test]
    fn top_distribution_lifecycle() {
        let composer = top_composer(StateStore::open_in_memory().unwrap());
        let composition =
            Composition::new("app", vec![component("a").on_node("n1"), component("b")]).unwrap();
        let (uid, distribution) = composer.instantiate(&composition).unwrap();
        assert_eq!(distribution.node_of("a"), Some("n1"));
        assert_eq!(distribution.node_of("b"), Some("undefined"));

        let again = composer.redistribute(&uid).unwrap();
        assert_eq!(again, distribution);
        assert_eq!(again.content_uid(), uid);

        let err = composer.reload(&uid, &distribution).unwrap_err();
        assert!(matches!(err, PlacementError::PlacementConflict(_)));

        assert!(composer.stop(&uid).unwrap());
        assert!(!composer.stop(&uid).unwrap());
        assert!(composer.distributions().unwrap().is_empty());
        assert!(matches!(
            composer.redistribute(&uid),
            Err(PlacementError::UnknownDistribution(_))
        ));
    }

    #[test]
    fn missing_factory_excludes_only_that_component() {
        let composer = node_composer(StateStore::open_in_memory().unwrap(), &["a", "b"]);
        let placement = composer
            .instantiate(&[component("a"), component("b"), component("ghost")])
            .unwrap();
        assert_eq!(placement.missing, vec!["ghost".to_string()]);
        let placed: usize = placement.new.iter().map(|i| i.components.len()).sum();
        assert_eq!(placed, 2);
    }

    #[test]
    fn new_isolates_get_generated_names() {
        let composer = node_composer(StateStore::open_in_memory().unwrap(), &["a"]);
        let placement = composer.instantiate(&[component("a")]).unwrap();
        assert_eq!(placement.new.len(), 1);
        assert_eq!(placement.new[0].name, "n1-python-auto01");
        assert_eq!(placement.new[0].kind(), "pelix");
    }

    #[test]
    fn redistribution_is_stable() {
        let composer = node_composer(StateStore::open_in_memory().unwrap(), &["a", "b", "c"]);
        let components = vec![component("a"), component("b"), component("c").in_isolate("pinned")];
        composer.instantiate(&components).unwrap();

        let first = composer.redistribute(&components).unwrap();
        let second = composer.redistribute(&components).unwrap();
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
        assert!(first["pinned"].contains("c"));
    }

    #[test]
    fn lost_isolate_feeds_crash_bookkeeping() {
        let composer = node_composer(StateStore::open_in_memory().unwrap(), &["a", "b"]);
        let placement = composer.instantiate(&[component("a"), component("b")]).unwrap();
        let lost = placement.new[0].name.clone();
        let hosted = placement.new[0].components.len();

        let replaced = composer.handle_lost(&lost).unwrap();
        assert_eq!(composer.stores().ratings.get("factory.a"), 45);
        let placed: usize = replaced
            .new
            .iter()
            .chain(replaced.updated.iter())
            .map(|i| i.components.len())
            .sum();
        assert_eq!(placed, hosted);
        assert!(replaced.new.iter().all(|i| i.name != lost));
    }

    #[test]
    fn kill_removes_components_and_empty_isolates() {
        let composer = node_composer(StateStore::open_in_memory().unwrap(), &["a"]);
        let placement = composer.instantiate(&[component("a")]).unwrap();
        let emptied = composer.kill(&["a".to_string()]).unwrap();
        assert_eq!(emptied, vec![placement.new[0].name.clone()]);
        assert!(composer.isolates().unwrap().is_empty());
    }

    #[test]
    fn pin_never_overwrites_an_isolate_of_another_language() {
        let store = StateStore::open_in_memory().unwrap();
        let mut java = Isolate::new("iso1", Some("java"), "n1");
        java.components.insert(Component::new("j", "factory.j", "java"));
        store.put_isolate(&java).unwrap();

        let composer = node_composer(store, &["a"]);
        let placement = composer.instantiate(&[component("a").in_isolate("iso1")]).unwrap();
        assert!(placement.updated.is_empty());
        assert_eq!(placement.new.len(), 1);
        assert_ne!(placement.new[0].name, "iso1");

        let isolates = composer.isolates().unwrap();
        let iso1 = isolates.iter().find(|i| i.name == "iso1").unwrap();
        assert_eq!(iso1.language.as_deref(), Some("java"));
        assert!(iso1.components.iter().any(|c| c.name == "j"));
        assert_eq!(isolates.len(), 2);
    }
}
