//! One elector's preferences in a round.

use serde::Serialize;

/// Ordered "for" and "against" lists filled by one elector.
///
/// A candidate appears at most once across both lists. Once locked, the
/// ballot ignores further changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ballot<C> {
    elector: String,
    for_candidates: Vec<C>,
    against: Vec<C>,
    locked: bool,
}

impl<C: PartialEq + Clone> Ballot<C> {
    pub fn new(elector: &str) -> Self {
        Self {
            elector: elector.to_string(),
            for_candidates: Vec::new(),
            against: Vec::new(),
            locked: false,
        }
    }

    pub fn elector(&self) -> &str {
        &self.elector
    }

    fn listed(&self, candidate: &C) -> bool {
        self.for_candidates.contains(candidate) || self.against.contains(candidate)
    }

    pub fn append_for(&mut self, candidate: &C) {
        if !self.locked && !self.listed(candidate) {
            self.for_candidates.push(candidate.clone());
        }
    }

    pub fn append_against(&mut self, candidate: &C) {
        if !self.locked && !self.listed(candidate) {
            self.against.push(candidate.clone());
        }
    }

    /// Replace the "for" list at once. Duplicates and candidates already
    /// voted against are dropped.
    pub fn set_for<I: IntoIterator<Item = C>>(&mut self, candidates: I) {
        if self.locked {
            return;
        }
        self.for_candidates.clear();
        for candidate in candidates {
            if !self.listed(&candidate) {
                self.for_candidates.push(candidate);
            }
        }
    }

    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn for_candidates(&self) -> &[C] {
        &self.for_candidates
    }

    pub fn against(&self) -> &[C] {
        &self.against
    }

    /// The elector abstained.
    pub fn is_blank(&self) -> bool {
        self.for_candidates.is_empty() && self.against.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_listed_once() {
        let mut ballot = Ballot::new("e");
        ballot.append_for(&"a");
        ballot.append_for(&"a");
        ballot.append_against(&"a");
        ballot.append_against(&"b");
        ballot.append_for(&"b");
        assert_eq!(ballot.for_candidates(), &["a"]);
        assert_eq!(ballot.against(), &["b"]);
    }

    #[test]
    fn locked_ballot_is_frozen() {
        let mut ballot = Ballot::new("e");
        ballot.append_for(&1);
        ballot.lock();
        ballot.append_for(&2);
        ballot.set_for(vec![3, 4]);
        assert_eq!(ballot.for_candidates(), &[1]);
        assert!(ballot.is_locked());
    }

    #[test]
    fn set_for_replaces_list() {
        let mut ballot = Ballot::new("e");
        ballot.append_for(&1);
        ballot.append_against(&9);
        ballot.set_for(vec![2, 9, 2, 3]);
        assert_eq!(ballot.for_candidates(), &[2, 3]);
        assert!(!ballot.is_blank());
        assert!(Ballot::<u8>::new("x").is_blank());
    }
}
