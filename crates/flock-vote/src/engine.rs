//! Multi-round election engine.
//!
//! ```text
//!   candidates ──► electors fill ballots ──► VoteKind::analyze
//!        ▲              │ Coup(c)                 │
//!        │              └────► CoupOverride ◄─────┤
//!        └──── NextRound(reduced pool) ◄──────────┤
//!                                  Elected(w) ◄───┘
//! ```
//!
//! Rounds stop on an election, a coup, an empty runoff pool, or after
//! `max_rounds`; the caller's default candidate is used when nobody won.

use std::fmt::Debug;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::ballot::Ballot;
use crate::kind::{RoundOutcome, VoteKind};

/// What an elector did with its ballot.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict<C> {
    /// Ballot filled (possibly left blank).
    Cast,
    /// Force this candidate as the winner, ending the round.
    Coup(C),
}

/// A criterion taking part in elections about subjects of type `S`.
pub trait Elector<C, S>: Send + Sync {
    fn name(&self) -> &str;

    fn vote(&self, candidates: &[C], subject: &S, ballot: &mut Ballot<C>) -> Verdict<C>;
}

/// Record of one round, for inspection and logging.
#[derive(Debug, Clone, Serialize)]
pub struct Round<C> {
    pub candidates: Vec<C>,
    pub ballots: Vec<Ballot<C>>,
    pub outcome: RoundOutcome<C>,
}

/// Final result of an election.
#[derive(Debug, Clone, Serialize)]
pub struct ElectionResult<C> {
    pub name: String,
    pub kind: &'static str,
    /// Elected candidates, best first. Holds the default when nobody won.
    pub winners: Vec<C>,
    pub coup: bool,
    pub rounds: Vec<Round<C>>,
}

impl<C> ElectionResult<C> {
    pub fn winner(&self) -> Option<&C> {
        self.winners.first()
    }
}

pub struct VoteEngine<C> {
    kind: Arc<dyn VoteKind<C>>,
    max_rounds: u32,
}

impl<C> Clone for VoteEngine<C> {
    fn clone(&self) -> Self {
        Self {
            kind: Arc::clone(&self.kind),
            max_rounds: self.max_rounds,
        }
    }
}

impl<C: PartialEq + Clone + Debug> VoteEngine<C> {
    pub fn new(kind: Arc<dyn VoteKind<C>>, max_rounds: u32) -> Self {
        Self {
            kind,
            max_rounds: max_rounds.max(1),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind.name()
    }

    /// Elect among `candidates` for `subject`.
    pub fn vote<S>(
        &self,
        name: &str,
        candidates: Vec<C>,
        subject: &S,
        electors: &[Arc<dyn Elector<C, S>>],
        default: Option<C>,
    ) -> ElectionResult<C> {
        let mut result = ElectionResult {
            name: name.to_string(),
            kind: self.kind.name(),
            winners: Vec::new(),
            coup: false,
            rounds: Vec::new(),
        };
        let mut pool = candidates;

        for round in 1..=self.max_rounds {
            let mut ballots = Vec::with_capacity(electors.len());
            let mut coup = None;
            for elector in electors {
                let mut ballot = Ballot::new(elector.name());
                match elector.vote(&pool, subject, &mut ballot) {
                    Verdict::Cast => {
                        ballot.lock();
                        ballots.push(ballot);
                    }
                    Verdict::Coup(claimant) => {
                        info!(vote = %name, elector = elector.name(), ?claimant, "coup override");
                        coup = Some(claimant);
                        break;
                    }
                }
            }

            let outcome = match coup {
                Some(claimant) => {
                    ballots.clear();
                    RoundOutcome::CoupOverride(claimant)
                }
                None => self.kind.analyze(&pool, &ballots),
            };
            debug!(vote = %name, round, candidates = pool.len(), ?outcome, "round analyzed");
            result.rounds.push(Round {
                candidates: pool.clone(),
                ballots,
                outcome: outcome.clone(),
            });

            match outcome {
                RoundOutcome::Elected(winners) if !winners.is_empty() => {
                    result.winners = winners;
                    return result;
                }
                RoundOutcome::Elected(_) => break,
                RoundOutcome::CoupOverride(claimant) => {
                    result.coup = true;
                    result.winners = vec![claimant];
                    return result;
                }
                RoundOutcome::NextRound(next) if next.is_empty() => break,
                RoundOutcome::NextRound(next) => pool = next,
            }
        }

        debug!(vote = %name, ?default, "no winner, using default");
        result.winners = default.into_iter().collect();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::{Approval, Majority};

    struct Prefers(&'static str, &'static str);

    impl Elector<&'static str, ()> for Prefers {
        fn name(&self) -> &str {
            self.0
        }

        fn vote(
            &self,
            candidates: &[&'static str],
            _: &(),
            ballot: &mut Ballot<&'static str>,
        ) -> Verdict<&'static str> {
            if candidates.contains(&self.1) {
                ballot.append_for(&self.1);
            }
            Verdict::Cast
        }
    }

    struct Blank;

    impl Elector<&'static str, ()> for Blank {
        fn name(&self) -> &str {
            "blank"
        }

        fn vote(
            &self,
            _: &[&'static str],
            _: &(),
            _: &mut Ballot<&'static str>,
        ) -> Verdict<&'static str> {
            Verdict::Cast
        }
    }

    struct Forces(&'static str);

    impl Elector<&'static str, ()> for Forces {
        fn name(&self) -> &str {
            "forces"
        }

        fn vote(
            &self,
            _: &[&'static str],
            _: &(),
            _: &mut Ballot<&'static str>,
        ) -> Verdict<&'static str> {
            Verdict::Coup(self.0)
        }
    }

    type Electors = Vec<Arc<dyn Elector<&'static str, ()>>>;

    fn electors(list: Electors) -> Electors {
        list
    }

    #[test]
    fn coup_discards_other_ballots() {
        let engine = VoteEngine::new(Arc::new(Majority), 3);
        let electors = electors(vec![
            Arc::new(Prefers("e1", "iso2")),
            Arc::new(Forces("iso1")),
            Arc::new(Prefers("e3", "iso3")),
        ]);
        let result = engine.vote("pin", vec!["iso1", "iso2", "iso3"], &(), &electors, None);
        assert!(result.coup);
        assert_eq!(result.winner(), Some(&"iso1"));
        assert!(result.rounds[0].ballots.is_empty());
    }

    #[test]
    fn runoff_reaches_a_winner() {
        let engine = VoteEngine::new(Arc::new(Majority), 3);
        // Round 1: a=2, b=2, c=1 → runoff between a and b; the c voter falls
        // back on its second choice in round 2.
        struct Ranked(&'static str, Vec<&'static str>);
        impl Elector<&'static str, ()> for Ranked {
            fn name(&self) -> &str {
                self.0
            }
            fn vote(
                &self,
                candidates: &[&'static str],
                _: &(),
                ballot: &mut Ballot<&'static str>,
            ) -> Verdict<&'static str> {
                for choice in &self.1 {
                    if candidates.contains(choice) {
                        ballot.append_for(choice);
                    }
                }
                Verdict::Cast
            }
        }
        let electors = electors(vec![
            Arc::new(Ranked("1", vec!["a"])),
            Arc::new(Ranked("2", vec!["a"])),
            Arc::new(Ranked("3", vec!["b"])),
            Arc::new(Ranked("4", vec!["b"])),
            Arc::new(Ranked("5", vec!["c", "b"])),
        ]);
        let result = engine.vote("runoff", vec!["a", "b", "c"], &(), &electors, None);
        assert_eq!(result.rounds.len(), 2);
        assert_eq!(result.winner(), Some(&"b"));
        assert!(!result.coup);
    }

    #[test]
    fn exhausted_rounds_fall_back_to_default() {
        let engine = VoteEngine::new(Arc::new(Approval::default()), 2);
        let electors = electors(vec![Arc::new(Blank), Arc::new(Blank)]);
        let result = engine.vote("idle", vec!["a", "b", "c"], &(), &electors, Some("neutral"));
        assert_eq!(result.rounds.len(), 2);
        assert_eq!(result.winners, vec!["neutral"]);
    }

    #[test]
    fn approval_elects_several() {
        let engine = VoteEngine::new(
            Arc::new(Approval {
                winners: 2,
                ..Approval::default()
            }),
            3,
        );
        let electors = electors(vec![
            Arc::new(Prefers("e1", "a")),
            Arc::new(Prefers("e2", "c")),
            Arc::new(Prefers("e3", "c")),
        ]);
        let result = engine.vote("multi", vec!["a", "b", "c"], &(), &electors, None);
        assert_eq!(result.winners, vec!["c", "a"]);
        assert_eq!(engine.kind(), "approval");
    }
}
