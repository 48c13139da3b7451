//! Tier-2 electors: which isolate of a node hosts a component.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use flock_core::{Component, IsolateDistribution};
use flock_state::{CompatibilityStore, HistoryStore, RatingStore};
use flock_vote::{Ballot, Elector, Verdict};
use tracing::{debug, info};

use crate::candidate::EligibleIsolate;

/// Compatibility assumed for a pair never rated: between an empty named
/// isolate (90) and the previous host (95).
const UNKNOWN_PAIR: u8 = 92;
const EMPTY_ISOLATE: u8 = 90;
const PREVIOUS_HOST: u8 = 95;

// ── Configured isolate ────────────────────────────────────────────

/// A component pinned to an isolate name forces that isolate, or a fresh
/// candidate proposing that name.
#[derive(Debug, Default)]
pub struct ConfiguredIsolateElector;

impl Elector<EligibleIsolate, Component> for ConfiguredIsolateElector {
    fn name(&self) -> &str {
        "configured-isolate"
    }

    fn vote(
        &self,
        candidates: &[EligibleIsolate],
        subject: &Component,
        _ballot: &mut Ballot<EligibleIsolate>,
    ) -> Verdict<EligibleIsolate> {
        let Some(pin) = subject.isolate.as_deref() else {
            return Verdict::Cast;
        };
        if let Some(existing) = candidates.iter().find(|c| c.name() == Some(pin)) {
            return Verdict::Coup(existing.clone());
        }
        match candidates.iter().find(|c| c.is_neutral()) {
            Some(neutral) => Verdict::Coup(neutral.proposing(pin)),
            None => Verdict::Cast,
        }
    }
}

// ── Compatibility ─────────────────────────────────────────────────

/// Votes for isolates whose components get along with the subject.
pub struct CompatibilityElector {
    compatibilities: Arc<CompatibilityStore>,
}

impl CompatibilityElector {
    pub fn new(compatibilities: Arc<CompatibilityStore>) -> Self {
        Self { compatibilities }
    }
}

impl Elector<EligibleIsolate, Component> for CompatibilityElector {
    fn name(&self) -> &str {
        "compatibility"
    }

    fn vote(
        &self,
        candidates: &[EligibleIsolate],
        subject: &Component,
        ballot: &mut Ballot<EligibleIsolate>,
    ) -> Verdict<EligibleIsolate> {
        let mut scored: Vec<(u8, &EligibleIsolate)> = Vec::new();
        let mut neutral = None;

        for candidate in candidates {
            let hosted = candidate.components();
            if hosted.is_empty() {
                if candidate.name().is_none() {
                    neutral = Some(candidate);
                } else {
                    scored.push((EMPTY_ISOLATE, candidate));
                }
                continue;
            }
            let others: Vec<&Component> =
                hosted.iter().filter(|c| c.name != subject.name).collect();
            if others.is_empty() {
                scored.push((PREVIOUS_HOST, candidate));
                continue;
            }
            let worst = others
                .iter()
                .map(|c| {
                    self.compatibilities
                        .rating(&subject.factory, &c.factory)
                        .unwrap_or(UNKNOWN_PAIR)
                })
                .min()
                .unwrap_or(UNKNOWN_PAIR);
            scored.push((worst, candidate));
        }

        scored.sort_by(|a, b| b.0.cmp(&a.0));
        for (score, candidate) in scored {
            if score >= 50 {
                ballot.append_for(candidate);
            } else if score < 30 {
                ballot.append_against(candidate);
            }
        }
        if ballot.for_candidates().is_empty() {
            if let Some(neutral) = neutral {
                ballot.append_for(neutral);
            }
        }
        Verdict::Cast
    }
}

// ── Reliability ───────────────────────────────────────────────────

/// Groups components of similar stability; unstable components are kept
/// away from shared isolates.
pub struct ReliabilityElector {
    ratings: Arc<RatingStore>,
}

impl ReliabilityElector {
    const MAX_DISTANCE: f64 = 20.0;
    const UNKNOWN_RATING: u8 = 90;

    pub fn new(ratings: Arc<RatingStore>) -> Self {
        Self { ratings }
    }
}

impl Elector<EligibleIsolate, Component> for ReliabilityElector {
    fn name(&self) -> &str {
        "reliability"
    }

    fn vote(
        &self,
        candidates: &[EligibleIsolate],
        subject: &Component,
        ballot: &mut Ballot<EligibleIsolate>,
    ) -> Verdict<EligibleIsolate> {
        let rating = f64::from(self.ratings.get(&subject.factory));
        let unstable = self.ratings.is_unstable(&subject.factory);
        let mut distances: Vec<(f64, &EligibleIsolate)> = Vec::new();

        for candidate in candidates {
            let hosted = candidate.components();
            if hosted.is_empty() {
                let distance = if candidate.name().is_none() { 20.0 } else { 5.0 };
                distances.push((distance, candidate));
            } else if hosted.len() == 1 && hosted.contains(subject) {
                distances.push((0.0, candidate));
            } else if unstable {
                ballot.append_against(candidate);
            } else if rating > 20.0 {
                let factories: Vec<&str> = hosted.iter().map(|c| c.factory.as_str()).collect();
                if let Some(mean) = self.ratings.mean(&factories, Self::UNKNOWN_RATING) {
                    let distance = (mean - rating).abs();
                    if distance < Self::MAX_DISTANCE {
                        distances.push((distance, candidate));
                    }
                }
            }
        }

        distances.sort_by(|a, b| a.0.total_cmp(&b.0));
        for (_, candidate) in distances {
            ballot.append_for(candidate);
        }
        Verdict::Cast
    }
}

// ── History ───────────────────────────────────────────────────────

/// Keeps components that crashed together apart, and prefers the isolate a
/// component occupied in the latest snapshot.
pub struct HistoryElector {
    crashes: Mutex<Vec<BTreeSet<String>>>,
    history: Arc<HistoryStore<IsolateDistribution>>,
}

impl HistoryElector {
    pub fn new(history: Arc<HistoryStore<IsolateDistribution>>) -> Self {
        Self {
            crashes: Mutex::new(Vec::new()),
            history,
        }
    }

    /// Record that `components` crashed together. A single component
    /// carries no grouping information.
    pub fn on_crash(&self, components: &[String]) {
        if components.len() < 2 {
            return;
        }
        let crash: BTreeSet<String> = components.iter().cloned().collect();
        let mut crashes = self.crashes();
        crashes.retain(|old| !crash.is_subset(old));
        crashes.push(crash);
        info!(crashes = crashes.len(), "crash recorded in history");
    }

    pub fn crash_sets(&self) -> Vec<BTreeSet<String>> {
        self.crashes().clone()
    }

    fn crashes(&self) -> std::sync::MutexGuard<'_, Vec<BTreeSet<String>>> {
        self.crashes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn previous_isolate(&self, component: &str) -> Option<String> {
        let latest = self.history.latest()?;
        latest
            .snapshot
            .iter()
            .find(|(_, hosted)| hosted.contains(component))
            .map(|(isolate, _)| isolate.clone())
    }
}

impl Elector<EligibleIsolate, Component> for HistoryElector {
    fn name(&self) -> &str {
        "history"
    }

    fn vote(
        &self,
        candidates: &[EligibleIsolate],
        subject: &Component,
        ballot: &mut Ballot<EligibleIsolate>,
    ) -> Verdict<EligibleIsolate> {
        let crashes = self.crash_sets();
        let mut neutral = None;
        let mut contents: Vec<(BTreeSet<String>, &EligibleIsolate)> = Vec::new();
        for candidate in candidates {
            if candidate.is_neutral() {
                neutral = Some(candidate);
                continue;
            }
            let others: BTreeSet<String> = candidate
                .components()
                .iter()
                .filter(|c| c.name != subject.name)
                .map(|c| c.name.clone())
                .collect();
            contents.push((others, candidate));
        }
        contents.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.1.name().cmp(&b.1.name())));

        let mut preference: Vec<(usize, &EligibleIsolate)> = Vec::new();
        for (others, candidate) in contents {
            let mut future = others.clone();
            future.insert(subject.name.clone());
            if !others.is_empty() && crashes.iter().any(|crash| future.is_superset(crash)) {
                debug!(
                    component = %subject.name,
                    isolate = ?candidate.name(),
                    "known bad grouping"
                );
                ballot.append_against(candidate);
            } else {
                preference.push((others.len(), candidate));
            }
        }
        preference.sort_by(|a, b| b.0.cmp(&a.0));

        if let Some(previous) = self.previous_isolate(&subject.name) {
            let previous_host = preference
                .iter()
                .find(|(_, c)| c.name() == Some(previous.as_str()));
            if let Some((_, candidate)) = previous_host {
                ballot.append_for(candidate);
            }
        }
        for (_, candidate) in &preference {
            ballot.append_for(candidate);
        }
        if preference.is_empty() {
            if let Some(neutral) = neutral {
                ballot.append_for(neutral);
            }
        }
        Verdict::Cast
    }
}
