//! Two-tier distribution.
//!
//! ```text
//!   components ──► NodeDistributor ──► node → components
//!                  (grouping criteria,   │
//!                   leftovers → default) ▼
//!                              IsolateDistributor (one vote per component)
//!                                        │
//!                                        ▼
//!                              isolate → components
//! ```

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::sync::Arc;

use flock_core::{Component, Isolate, NodeDistribution, config::PlacementConfig};
use flock_vote::{Approval, Elector, VoteEngine};
use tracing::{debug, info, warn};

use crate::candidate::{EligibleIsolate, hosts_language};
use crate::grouping::GroupingCriterion;

pub type IsolateElector = Arc<dyn Elector<EligibleIsolate, Component>>;

/// Approval engine tuned by the `[placement]` section.
pub fn vote_engine_from_config(config: &PlacementConfig) -> VoteEngine<EligibleIsolate> {
    let defaults = Approval::default();
    let kind = Approval {
        winners: config.approval_winners.unwrap_or(defaults.winners),
        max_votes: config.approval_max_votes.unwrap_or(defaults.max_votes),
        penalty: config.approval_penalty.unwrap_or(defaults.penalty),
        exclusion: config.approval_exclusion.unwrap_or(defaults.exclusion),
    };
    VoteEngine::new(Arc::new(kind), config.max_rounds.unwrap_or(3))
}

// ── Tier 1 ────────────────────────────────────────────────────────

pub struct NodeDistributor {
    criteria: Vec<Arc<dyn GroupingCriterion>>,
    default_node: String,
}

impl NodeDistributor {
    pub fn new(criteria: Vec<Arc<dyn GroupingCriterion>>, default_node: &str) -> Self {
        Self {
            criteria,
            default_node: default_node.to_string(),
        }
    }

    pub fn default_node(&self) -> &str {
        &self.default_node
    }

    /// Assign every component to exactly one node.
    pub fn distribute<I: IntoIterator<Item = Component>>(&self, components: I) -> NodeDistribution {
        let mut groups = NodeDistribution::new();
        let mut remaining: BTreeSet<Component> = components.into_iter().collect();

        for criterion in &self.criteria {
            if remaining.is_empty() {
                break;
            }
            let before = remaining.len();
            remaining = criterion.group(remaining, &mut groups);
            debug!(
                criterion = criterion.name(),
                grouped = before - remaining.len(),
                "grouping criterion applied"
            );
        }

        if !remaining.is_empty() {
            info!(
                count = remaining.len(),
                node = %self.default_node,
                "ungrouped components assigned to default node"
            );
            groups.entry(self.default_node.clone()).or_default().extend(remaining);
        }
        groups
    }
}

// ── Tier 2 ────────────────────────────────────────────────────────

/// Outcome of one isolate distribution run.
#[derive(Debug, Clone)]
pub struct IsolatePlan {
    /// Every candidate still in play after the run, by slot.
    pub candidates: Vec<EligibleIsolate>,
    /// Slots of pre-existing isolates that received components.
    pub updated: Vec<usize>,
    /// Slots of isolates created during the run.
    pub new: Vec<usize>,
}

impl IsolatePlan {
    pub fn updated(&self) -> impl Iterator<Item = &EligibleIsolate> {
        self.updated.iter().filter_map(|slot| self.candidates.get(*slot))
    }

    pub fn new_isolates(&self) -> impl Iterator<Item = &EligibleIsolate> {
        self.new.iter().filter_map(|slot| self.candidates.get(*slot))
    }
}

pub struct IsolateDistributor {
    engine: VoteEngine<EligibleIsolate>,
    electors: Vec<IsolateElector>,
    runs: std::sync::atomic::AtomicU64,
}

impl IsolateDistributor {
    pub fn new(engine: VoteEngine<EligibleIsolate>, electors: Vec<IsolateElector>) -> Self {
        Self {
            engine,
            electors,
            runs: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Place `components` among `existing` isolates of one node, creating
    /// new candidates when no existing isolate wins.
    pub fn distribute(
        &self,
        components: &BTreeSet<Component>,
        existing: &[Isolate],
    ) -> IsolatePlan {
        let run = self.runs.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
        let mut candidates: Vec<EligibleIsolate> = existing
            .iter()
            .enumerate()
            .map(|(slot, isolate)| EligibleIsolate::wrap(slot, isolate))
            .collect();
        let existing_count = candidates.len();
        for candidate in &mut candidates {
            candidate.hide(components);
        }

        // BTreeSet iteration is already sorted by component name.
        for component in components {
            let mut matching: Vec<usize> = candidates
                .iter()
                .filter(|c| hosts_language(c.language(), &component.language))
                .map(EligibleIsolate::slot)
                .collect();
            matching.sort_by(|a, b| {
                let name = |slot: &usize| candidates[*slot].name().unwrap_or_default().to_string();
                name(a).cmp(&name(b))
            });
            for slot in &matching {
                candidates[*slot].unhide(component);
            }

            let neutral = EligibleIsolate::neutral(candidates.len());
            let mut pool: Vec<EligibleIsolate> = matching
                .iter()
                .map(|slot| candidates[*slot].clone())
                .collect();
            pool.push(neutral.clone());

            let subject = unpin_if_foreign(component, &candidates, &matching);
            let vote_name = format!("distribution {run}-{}", component.name);
            let result = self.engine.vote(
                &vote_name,
                pool,
                &*subject,
                &self.electors,
                Some(neutral.clone()),
            );
            let mut winner = result.winner().cloned().unwrap_or(neutral);
            if let Some(proposed) = winner.proposed_name() {
                if candidates.iter().any(|c| c.name() == Some(proposed)) {
                    warn!(
                        component = %component.name,
                        isolate = proposed,
                        "isolate name taken, rename refused"
                    );
                    winner.reject_rename();
                }
            }

            let slot = if winner.slot() == candidates.len() {
                candidates.push(winner);
                candidates.len() - 1
            } else {
                let slot = winner.slot();
                if let Some(proposed) = winner.proposed_name() {
                    candidates[slot].propose_rename(proposed);
                }
                slot
            };

            let elected = &mut candidates[slot];
            elected.accept_rename(&component.language);
            elected.add_component(component);
            debug!(
                component = %component.name,
                isolate = ?elected.name(),
                slot,
                "component placed"
            );

            for other in matching.into_iter().filter(|s| *s != slot) {
                candidates[other].reject_rename();
                candidates[other].hide([component]);
            }
        }

        let updated = (0..existing_count)
            .filter(|slot| !candidates[*slot].added().is_empty())
            .collect();
        let new = (existing_count..candidates.len()).collect();
        IsolatePlan {
            candidates,
            updated,
            new,
        }
    }
}

/// A pin naming an isolate of another language is dropped for the vote, so
/// the component goes through a normal election instead of a name clash.
fn unpin_if_foreign<'a>(
    component: &'a Component,
    candidates: &[EligibleIsolate],
    matching: &[usize],
) -> Cow<'a, Component> {
    let Some(pin) = component.isolate.as_deref() else {
        return Cow::Borrowed(component);
    };
    let foreign = candidates
        .iter()
        .find(|c| c.name() == Some(pin) && !matching.contains(&c.slot()));
    match foreign {
        Some(isolate) => {
            warn!(
                component = %component.name,
                language = %component.language,
                isolate = pin,
                isolate_language = ?isolate.language(),
                "pinned isolate hosts another language, pin ignored"
            );
            let mut unpinned = component.clone();
            unpinned.isolate = None;
            Cow::Owned(unpinned)
        }
        None => Cow::Borrowed(component),
    }
}
