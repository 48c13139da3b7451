//! Isolates as election candidates.
//!
//! An [`EligibleIsolate`] is either a running isolate wrapped for the vote or
//! a fresh, neutral candidate. Candidates are identified by a slot number
//! unique within one distribution run, since fresh candidates have no name
//! until the round commits.
//!
//! The components being placed are hidden from every candidate before the
//! run; each one is unhidden from the isolate that hosted it just before
//! its own election, so electors can recognize a previous host.

use std::collections::BTreeSet;

use flock_core::{Component, Isolate, IsolateUid, language_compatible};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct EligibleIsolate {
    slot: usize,
    uid: Option<IsolateUid>,
    name: Option<String>,
    proposed_name: Option<String>,
    language: Option<String>,
    components: BTreeSet<Component>,
    visible: BTreeSet<Component>,
    added: BTreeSet<Component>,
}

impl PartialEq for EligibleIsolate {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot
    }
}

impl EligibleIsolate {
    /// A fresh candidate with no name, language or component.
    pub fn neutral(slot: usize) -> Self {
        Self {
            slot,
            uid: None,
            name: None,
            proposed_name: None,
            language: None,
            components: BTreeSet::new(),
            visible: BTreeSet::new(),
            added: BTreeSet::new(),
        }
    }

    /// Wrap an existing isolate.
    pub fn wrap(slot: usize, isolate: &Isolate) -> Self {
        Self {
            slot,
            uid: isolate.uid.clone(),
            name: Some(isolate.name.clone()),
            proposed_name: None,
            language: isolate.language.clone(),
            components: isolate.components.clone(),
            visible: isolate.components.clone(),
            added: BTreeSet::new(),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn proposed_name(&self) -> Option<&str> {
        self.proposed_name.as_deref()
    }

    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    /// Components currently visible to electors.
    pub fn components(&self) -> &BTreeSet<Component> {
        &self.visible
    }

    /// Components added during this run.
    pub fn added(&self) -> &BTreeSet<Component> {
        &self.added
    }

    /// Unnamed and empty: the "new isolate" option of a vote.
    pub fn is_neutral(&self) -> bool {
        self.name.is_none() && self.visible.is_empty()
    }

    pub fn hosts(&self, component: &str) -> bool {
        self.visible.iter().any(|c| c.name == component)
    }

    pub fn hide<'a, I: IntoIterator<Item = &'a Component>>(&mut self, components: I) {
        for component in components {
            self.visible.remove(component);
        }
    }

    /// Show `component` again if this isolate hosted it before the run.
    pub fn unhide(&mut self, component: &Component) {
        if let Some(original) = self.components.get(component) {
            self.visible.insert(original.clone());
        }
    }

    /// Propose a name for an unnamed candidate. Returns false if the
    /// candidate is already named or another name is already proposed.
    pub fn propose_rename(&mut self, name: &str) -> bool {
        if self.name.is_some() || self.proposed_name.is_some() {
            return false;
        }
        self.proposed_name = Some(name.to_string());
        true
    }

    /// Copy of this candidate carrying a proposed name.
    pub fn proposing(&self, name: &str) -> Self {
        let mut candidate = self.clone();
        candidate.propose_rename(name);
        candidate
    }

    /// Take the proposed name, if any. A candidate already named keeps its name.
    ///
    /// The hosted language should match the subject's; a mismatch is logged
    /// and the rename goes on.
    pub fn accept_rename(&mut self, subject_language: &str) -> Option<&str> {
        if self.name.is_some() {
            self.proposed_name = None;
            return self.name();
        }
        let proposed = self.proposed_name.take()?;
        if !language_compatible(self.language(), subject_language) {
            warn!(
                isolate = %proposed,
                isolate_language = ?self.language,
                subject_language,
                "language mismatch on isolate rename, accepting anyway"
            );
        }
        self.name = Some(proposed);
        self.name()
    }

    pub fn reject_rename(&mut self) {
        self.proposed_name = None;
    }

    /// Give an unnamed candidate the name returned by `generate`.
    pub fn ensure_name<F: FnOnce(Option<&str>) -> String>(&mut self, generate: F) -> &str {
        if self.name.is_none() {
            self.name = Some(generate(self.language.as_deref()));
        }
        self.name.as_deref().unwrap_or_default()
    }

    pub fn add_component(&mut self, component: &Component) {
        if self.language.is_none() {
            self.language = Some(component.language.clone());
        }
        self.components.insert(component.clone());
        self.visible.insert(component.clone());
        self.added.insert(component.clone());
    }

    /// The isolate as it stands after the run.
    pub fn to_isolate(&self, node: &str) -> Isolate {
        Isolate {
            uid: self.uid.clone(),
            name: self.name.clone().unwrap_or_default(),
            language: self.language.clone(),
            node: node.to_string(),
            components: self.visible.clone(),
        }
    }
}

/// Whether an isolate of `isolate_language` may host a `component_language`
/// component. Python flavours share isolates.
pub fn hosts_language(isolate_language: Option<&str>, component_language: &str) -> bool {
    match isolate_language {
        None => true,
        Some(language) if language == component_language => true,
        Some(language) => {
            language.starts_with("python") && component_language.starts_with("python")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(name: &str) -> Component {
        Component::new(name, &format!("factory.{name}"), "python")
    }

    #[test]
    fn rename_negotiation() {
        let mut candidate = EligibleIsolate::neutral(0);
        assert!(candidate.propose_rename("iso1"));
        assert!(!candidate.propose_rename("iso2"));
        assert_eq!(candidate.accept_rename("python"), Some("iso1"));
        assert!(!candidate.propose_rename("iso3"));
    }

    #[test]
    fn rejected_rename_keeps_candidate_unnamed() {
        let mut candidate = EligibleIsolate::neutral(0).proposing("iso1");
        candidate.reject_rename();
        assert_eq!(candidate.accept_rename("python"), None);
        assert!(candidate.is_neutral());
    }

    #[test]
    fn language_mismatch_is_lenient() {
        let mut candidate = EligibleIsolate::neutral(0);
        candidate.add_component(&Component::new("j", "factory.j", "java"));
        candidate.propose_rename("iso1");
        assert_eq!(candidate.accept_rename("python"), Some("iso1"));
    }

    #[test]
    fn hide_and_unhide_previous_components() {
        let mut isolate = Isolate::new("iso1", Some("python"), "node-1");
        isolate.components.insert(component("a"));
        isolate.components.insert(component("b"));
        let mut candidate = EligibleIsolate::wrap(0, &isolate);

        candidate.hide([&component("a"), &component("b")]);
        assert!(candidate.components().is_empty());
        assert!(!candidate.is_neutral());

        candidate.unhide(&component("a"));
        candidate.unhide(&component("z"));
        assert!(candidate.hosts("a"));
        assert_eq!(candidate.components().len(), 1);
    }

    #[test]
    fn candidates_compare_by_slot() {
        assert_eq!(EligibleIsolate::neutral(1), EligibleIsolate::neutral(1).proposing("x"));
        assert_ne!(EligibleIsolate::neutral(1), EligibleIsolate::neutral(2));
    }

    #[test]
    fn python_flavours_share_isolates() {
        assert!(hosts_language(None, "java"));
        assert!(hosts_language(Some("python3"), "python"));
        assert!(!hosts_language(Some("java"), "python"));
    }
}
