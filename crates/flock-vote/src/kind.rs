//! Vote kinds: how a round's ballots turn into an outcome.

use std::fmt::Debug;

use serde::Serialize;
use tracing::debug;

use crate::ballot::Ballot;

/// Result of one election round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RoundOutcome<C> {
    /// The round committed these candidates, best first.
    Elected(Vec<C>),
    /// One elector forced the winner; every ballot was discarded.
    CoupOverride(C),
    /// No decision; run another round over this reduced pool.
    NextRound(Vec<C>),
}

/// A pluggable election strategy over the shared ballot format.
pub trait VoteKind<C>: Send + Sync {
    fn name(&self) -> &'static str;

    /// Analyze the locked ballots of a round over `candidates`.
    fn analyze(&self, candidates: &[C], ballots: &[Ballot<C>]) -> RoundOutcome<C>;
}

/// Candidates sorted by descending score, then descending `tie_break`;
/// remaining ties keep pool order.
fn ranked<C: Clone>(candidates: &[C], scores: &[i64], tie_break: &[i64]) -> Vec<(C, i64)> {
    let mut ranked: Vec<(usize, i64)> = scores.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| {
        b.1.cmp(&a.1)
            .then(tie_break[b.0].cmp(&tie_break[a.0]))
            .then(a.0.cmp(&b.0))
    });
    ranked
        .into_iter()
        .map(|(index, score)| (candidates[index].clone(), score))
        .collect()
}

fn top_two<C: Clone>(ranked: &[(C, i64)]) -> Vec<C> {
    ranked.iter().take(2).map(|(c, _)| c.clone()).collect()
}

// ── Majority ──────────────────────────────────────────────────────

/// Single-winner absolute majority.
///
/// Each ballot votes for its first listed candidate of the pool. With
/// `total` voting ballots, a candidate wins outright with at least
/// `total / 2 + 1` votes; otherwise the two best go to a runoff.
#[derive(Debug, Clone, Copy, Default)]
pub struct Majority;

impl<C: PartialEq + Clone + Debug> VoteKind<C> for Majority {
    fn name(&self) -> &'static str {
        "majority"
    }

    fn analyze(&self, candidates: &[C], ballots: &[Ballot<C>]) -> RoundOutcome<C> {
        let mut scores = vec![0i64; candidates.len()];
        let mut total = 0i64;
        for ballot in ballots {
            let choice = ballot
                .for_candidates()
                .iter()
                .find_map(|c| candidates.iter().position(|candidate| candidate == c));
            if let Some(index) = choice {
                scores[index] += 1;
                total += 1;
            }
        }

        let ranked = ranked(candidates, &scores, &vec![0; candidates.len()]);
        let majority = total / 2 + 1;
        match ranked.first() {
            Some((winner, votes)) if total > 0 && *votes >= majority => {
                debug!(?winner, votes, total, "elected by majority");
                RoundOutcome::Elected(vec![winner.clone()])
            }
            _ => {
                debug!(total, majority, "no majority, runoff");
                RoundOutcome::NextRound(top_two(&ranked))
            }
        }
    }
}

// ── Approval ──────────────────────────────────────────────────────

/// Multi-winner approval vote.
///
/// Each ballot approves at most `max_votes` of its "for" candidates (one
/// point each). Every "against" costs `penalty` points; a candidate
/// receiving `exclusion` or more against-votes is excluded. The `winners`
/// best positive scores are elected; equal scores go to the candidate
/// placed first on more ballots.
#[derive(Debug, Clone, Copy)]
pub struct Approval {
    pub winners: usize,
    pub max_votes: usize,
    pub penalty: i64,
    pub exclusion: usize,
}

impl Default for Approval {
    fn default() -> Self {
        Self {
            winners: 1,
            max_votes: 3,
            penalty: 5,
            exclusion: 2,
        }
    }
}

impl<C: PartialEq + Clone + Debug> VoteKind<C> for Approval {
    fn name(&self) -> &'static str {
        "approval"
    }

    fn analyze(&self, candidates: &[C], ballots: &[Ballot<C>]) -> RoundOutcome<C> {
        let position = |c: &C| candidates.iter().position(|candidate| candidate == c);
        let mut scores = vec![0i64; candidates.len()];
        let mut rejections = vec![0usize; candidates.len()];
        let mut firsts = vec![0i64; candidates.len()];

        for ballot in ballots {
            if let Some(index) = ballot.for_candidates().iter().find_map(position) {
                firsts[index] += 1;
            }
            for index in ballot
                .for_candidates()
                .iter()
                .filter_map(position)
                .take(self.max_votes.max(1))
            {
                scores[index] += 1;
            }
            for index in ballot.against().iter().filter_map(position) {
                scores[index] -= self.penalty;
                rejections[index] += 1;
            }
        }

        let excluded = |index: usize| self.exclusion > 0 && rejections[index] >= self.exclusion;
        let kept: Vec<usize> = (0..candidates.len()).filter(|i| !excluded(*i)).collect();
        let kept_candidates: Vec<C> = kept.iter().map(|i| candidates[*i].clone()).collect();
        let kept_scores: Vec<i64> = kept.iter().map(|i| scores[*i]).collect();
        let kept_firsts: Vec<i64> = kept.iter().map(|i| firsts[*i]).collect();
        let ranked = ranked(&kept_candidates, &kept_scores, &kept_firsts);

        let elected: Vec<C> = ranked
            .iter()
            .filter(|(_, score)| *score > 0)
            .take(self.winners.max(1))
            .map(|(c, _)| c.clone())
            .collect();

        if elected.is_empty() {
            debug!(
                excluded = candidates.len() - kept.len(),
                "no approved candidate, runoff"
            );
            RoundOutcome::NextRound(top_two(&ranked))
        } else {
            debug!(?elected, "elected by approval");
            RoundOutcome::Elected(elected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ballot(for_candidates: &[&'static str], against: &[&'static str]) -> Ballot<&'static str> {
        let mut ballot = Ballot::new("e");
        for c in for_candidates {
            ballot.append_for(c);
        }
        for c in against {
            ballot.append_against(c);
        }
        ballot.lock();
        ballot
    }

    #[test]
    fn majority_ignores_blank_ballots() {
        let ballots = vec![
            ballot(&["x"], &[]),
            ballot(&["x"], &[]),
            ballot(&["x"], &[]),
            ballot(&[], &[]),
            ballot(&[], &[]),
        ];
        let outcome = Majority.analyze(&["x", "y", "z"], &ballots);
        assert_eq!(outcome, RoundOutcome::Elected(vec!["x"]));
    }

    #[test]
    fn majority_split_goes_to_runoff() {
        let ballots = vec![
            ballot(&["x"], &[]),
            ballot(&["x"], &[]),
            ballot(&["y"], &[]),
            ballot(&["y"], &[]),
            ballot(&["z"], &[]),
        ];
        let outcome = Majority.analyze(&["x", "y", "z"], &ballots);
        assert_eq!(outcome, RoundOutcome::NextRound(vec!["x", "y"]));
    }

    #[test]
    fn majority_without_votes_keeps_two_candidates() {
        let outcome = Majority.analyze(&["x", "y", "z"], &[ballot(&[], &["x"])]);
        assert_eq!(outcome, RoundOutcome::NextRound(vec!["x", "y"]));
    }

    #[test]
    fn majority_ignores_candidates_outside_pool() {
        let outcome = Majority.analyze(&["x"], &[ballot(&["w", "x"], &[])]);
        assert_eq!(outcome, RoundOutcome::Elected(vec!["x"]));
    }

    #[test]
    fn approval_caps_votes_per_elector() {
        let kind = Approval {
            winners: 2,
            max_votes: 1,
            ..Approval::default()
        };
        let ballots = vec![ballot(&["a", "b"], &[]), ballot(&["b", "a"], &[]), ballot(&["b"], &[])];
        let outcome = kind.analyze(&["a", "b", "c"], &ballots);
        assert_eq!(outcome, RoundOutcome::Elected(vec!["b", "a"]));
    }

    #[test]
    fn approval_penalty_and_exclusion() {
        let kind = Approval::default();
        let ballots = vec![
            ballot(&["a"], &["b"]),
            ballot(&["b"], &[]),
            ballot(&["b"], &[]),
            ballot(&["c"], &["b"]),
        ];
        // b: 2 approvals, 2 rejections → excluded
        let outcome = kind.analyze(&["a", "b", "c"], &ballots);
        assert_eq!(outcome, RoundOutcome::Elected(vec!["a"]));
    }

    #[test]
    fn approval_ties_go_to_first_choices() {
        let ballots = vec![
            ballot(&["b", "a"], &[]),
            ballot(&["b", "a"], &[]),
            ballot(&["a", "b"], &[]),
        ];
        let outcome = Approval::default().analyze(&["a", "b"], &ballots);
        assert_eq!(outcome, RoundOutcome::Elected(vec!["b"]));
    }

    #[test]
    fn approval_without_positive_score_is_a_runoff() {
        let kind = Approval::default();
        let outcome = kind.analyze(&["a", "b", "c"], &[ballot(&[], &["c"])]);
        assert_eq!(outcome, RoundOutcome::NextRound(vec!["a", "b"]));
    }
}
