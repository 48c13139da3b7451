//! Per-uid isolate lifecycle tracking.
//!
//! A record is created by the first `requested` event of a uid and archived
//! once it reaches GONE. Each record sits behind its own lock: events for
//! one uid apply in the order callers acquire it, while different uids
//! progress in parallel. The map lock is only held to look a record up.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tracing::{debug, info};

use crate::error::FsmResult;
use crate::fsm::{Definition, StateMachine, Step};
use crate::isolate::{IsolateEvent, IsolateState, isolate_lifecycle};

const DEFAULT_ARCHIVE_LIMIT: usize = 256;

pub type IsolateStep = Step<IsolateState, IsolateEvent>;

#[derive(Debug)]
struct Record {
    fsm: StateMachine<IsolateState, IsolateEvent>,
    created_at: Instant,
    archived: bool,
}

/// A finished isolate, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedIsolate {
    pub uid: String,
    pub state: IsolateState,
    pub lifetime_ms: u128,
}

pub struct LifecycleTracker {
    definition: Arc<Definition<IsolateState, IsolateEvent>>,
    records: Mutex<HashMap<String, Arc<Mutex<Record>>>>,
    archive: Mutex<VecDeque<ArchivedIsolate>>,
    archive_limit: usize,
}

impl LifecycleTracker {
    pub fn new() -> FsmResult<Self> {
        Ok(Self::with_definition(isolate_lifecycle()?))
    }

    pub fn with_definition(definition: Arc<Definition<IsolateState, IsolateEvent>>) -> Self {
        Self {
            definition,
            records: Mutex::new(HashMap::new()),
            archive: Mutex::new(VecDeque::new()),
            archive_limit: DEFAULT_ARCHIVE_LIMIT,
        }
    }

    /// Apply `event` to the isolate `uid`.
    ///
    /// Returns `None` when the uid is unknown and the event cannot open a
    /// record (anything but `requested`).
    pub fn handle(&self, uid: &str, event: IsolateEvent) -> Option<IsolateStep> {
        let record = match self.record(uid, event) {
            Some(record) => record,
            None => {
                debug!(%uid, %event, "event for unknown isolate ignored");
                return None;
            }
        };

        let mut record = lock(&record);
        let step = record.fsm.handle(event);
        if let Step::Moved { from, to, .. } = step {
            info!(%uid, %from, %to, "isolate state changed");
        }
        if record.fsm.state().is_terminal() && !record.archived {
            record.archived = true;
            let lifetime_ms = record.created_at.elapsed().as_millis();
            drop(record);
            self.archive(uid, lifetime_ms);
        }
        Some(step)
    }

    pub fn state(&self, uid: &str) -> Option<IsolateState> {
        let record = lock(&self.records).get(uid).cloned()?;
        let state = lock(&record).fsm.state();
        Some(state)
    }

    /// Live uids currently in `state`, sorted.
    pub fn uids_in(&self, state: IsolateState) -> Vec<String> {
        let mut uids: Vec<String> = self
            .live()
            .into_iter()
            .filter(|(_, s)| *s == state)
            .map(|(uid, _)| uid)
            .collect();
        uids.sort();
        uids
    }

    /// Every live uid with its state.
    pub fn live(&self) -> Vec<(String, IsolateState)> {
        let records: Vec<(String, Arc<Mutex<Record>>)> = lock(&self.records)
            .iter()
            .map(|(uid, record)| (uid.clone(), Arc::clone(record)))
            .collect();
        records
            .into_iter()
            .map(|(uid, record)| {
                let state = lock(&record).fsm.state();
                (uid, state)
            })
            .collect()
    }

    /// Finished isolates, oldest first.
    pub fn archived(&self) -> Vec<ArchivedIsolate> {
        lock(&self.archive).iter().cloned().collect()
    }

    fn record(&self, uid: &str, event: IsolateEvent) -> Option<Arc<Mutex<Record>>> {
        let mut records = lock(&self.records);
        if let Some(record) = records.get(uid) {
            return Some(Arc::clone(record));
        }
        if event != IsolateEvent::Requested {
            return None;
        }
        let record = Arc::new(Mutex::new(Record {
            fsm: StateMachine::new(Arc::clone(&self.definition)),
            created_at: Instant::now(),
            archived: false,
        }));
        records.insert(uid.to_string(), Arc::clone(&record));
        Some(record)
    }

    fn archive(&self, uid: &str, lifetime_ms: u128) {
        lock(&self.records).remove(uid);
        let mut archive = lock(&self.archive);
        if archive.len() >= self.archive_limit {
            archive.pop_front();
        }
        archive.push_back(ArchivedIsolate {
            uid: uid.to_string(),
            state: IsolateState::Gone,
            lifetime_ms,
        });
        debug!(%uid, "isolate archived");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use IsolateEvent::*;

    #[test]
    fn record_opens_on_requested() {
        let tracker = LifecycleTracker::new().unwrap();
        assert!(tracker.handle("iso-1", Ready).is_none());
        assert_eq!(tracker.state("iso-1"), None);

        let step = tracker.handle("iso-1", Requested).unwrap();
        assert_eq!(step.state(), IsolateState::Requested);
        assert_eq!(tracker.uids_in(IsolateState::Requested), vec!["iso-1"]);
    }

    #[test]
    fn skipped_starting_matches_full_sequence() {
        let tracker = LifecycleTracker::new().unwrap();
        for event in [Requested, Ready] {
            tracker.handle("fast", event);
        }
        for event in [Requested, Starting, Ready] {
            tracker.handle("slow", event);
        }
        assert_eq!(tracker.state("fast"), Some(IsolateState::Ready));
        assert_eq!(tracker.state("fast"), tracker.state("slow"));
    }

    #[test]
    fn gone_archives_the_record() {
        let tracker = LifecycleTracker::new().unwrap();
        for event in [Requested, Starting, Ready, Stopping, Gone] {
            tracker.handle("iso-1", event);
        }
        assert_eq!(tracker.state("iso-1"), None);
        let archived = tracker.archived();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].uid, "iso-1");

        // A late duplicate does not reopen the record.
        assert!(tracker.handle("iso-1", Gone).is_none());
    }

    #[test]
    fn failed_request_keeps_record_waiting() {
        let tracker = LifecycleTracker::new().unwrap();
        tracker.handle("iso-1", Requested);
        tracker.handle("iso-1", Gone);
        assert_eq!(tracker.state("iso-1"), Some(IsolateState::Waiting));
        assert!(tracker.archived().is_empty());
    }

    #[test]
    fn concurrent_uids_progress_independently() {
        let tracker = Arc::new(LifecycleTracker::new().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    let uid = format!("iso-{i}");
                    for event in [Requested, Starting, Ready] {
                        tracker.handle(&uid, event);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.uids_in(IsolateState::Ready).len(), 8);
    }
}
