//! Predicate Decisions and Gating
//!
//! Predicate nodes publish boolean verdicts keyed by message id. A gated
//! node consults a [`DecisionMap`] built over the full set of predicates
//! named in its `when` clause: the aggregate is `Accepted` only when every
//! predicate returned true, and a single `false` settles the aggregate
//! immediately without waiting for the rest.
//!
//! [`Gate`] is the holding area in front of a gated node. Joined work
//! parks there until its message id's aggregate settles, then is released
//! for execution (accepted) or retired without running (rejected).

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::graph::ports::Ready;

/// One predicate's verdict for one message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredicateResult {
    pub msg_id: u64,
    pub value: bool,
}

/// Aggregate state of a `when` clause for one message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Undecided,
    Accepted,
    Rejected,
}

#[derive(Debug)]
struct DecisionEntry {
    seen: FxHashSet<usize>,
    verdict: Verdict,
}

/// Conjunction of predicate verdicts, keyed by message id. Verdicts are
/// sticky: once an aggregate settles it never changes, and late votes for
/// a settled id are dropped.
#[derive(Debug)]
pub(crate) struct DecisionMap {
    predicates: Vec<String>,
    entries: Mutex<FxHashMap<u64, DecisionEntry>>,
}

impl DecisionMap {
    pub fn new(predicates: Vec<String>) -> Self {
        Self {
            predicates,
            entries: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn predicates(&self) -> &[String] {
        &self.predicates
    }

    fn slot(&self, predicate: &str) -> Option<usize> {
        self.predicates.iter().position(|p| p == predicate)
    }

    /// Record one predicate's vote. Returns the aggregate after the vote.
    pub fn record(&self, predicate: &str, result: PredicateResult) -> Verdict {
        let Some(slot) = self.slot(predicate) else {
            return Verdict::Undecided;
        };
        let mut entries = self.entries.lock();
        let entry = entries.entry(result.msg_id).or_insert_with(|| DecisionEntry {
            seen: FxHashSet::default(),
            verdict: Verdict::Undecided,
        });
        if entry.verdict != Verdict::Undecided {
            return entry.verdict;
        }
        if !result.value {
            entry.verdict = Verdict::Rejected;
        } else {
            entry.seen.insert(slot);
            if entry.seen.len() == self.predicates.len() {
                entry.verdict = Verdict::Accepted;
            }
        }
        entry.verdict
    }

    pub fn verdict(&self, msg_id: u64) -> Verdict {
        self.entries
            .lock()
            .get(&msg_id)
            .map_or(Verdict::Undecided, |e| e.verdict)
    }

    /// Drop a settled id's bookkeeping once its work has been released.
    pub fn forget(&self, msg_id: u64) {
        self.entries.lock().remove(&msg_id);
    }
}

/// Holds joined work until its message id's verdict settles.
#[derive(Debug)]
pub(crate) struct Gate {
    decisions: DecisionMap,
    parked: Mutex<FxHashMap<u64, Vec<Ready>>>,
}

/// Work released by the gate, with the verdict it settled under.
#[derive(Debug)]
pub(crate) enum Released {
    Run(Ready),
    /// Rejected work still claims its position so later re-deliveries
    /// cannot run it.
    Retire(Ready),
}

impl Gate {
    pub fn new(predicates: Vec<String>) -> Self {
        Self {
            decisions: DecisionMap::new(predicates),
            parked: Mutex::new(FxHashMap::default()),
        }
    }

    /// Offer joined work. Settled ids release immediately; undecided ids
    /// park.
    pub fn admit(&self, ready: Ready) -> Option<Released> {
        let msg_id = ready.trigger.id;
        match self.decisions.verdict(msg_id) {
            Verdict::Accepted => Some(Released::Run(ready)),
            Verdict::Rejected => Some(Released::Retire(ready)),
            Verdict::Undecided => {
                self.parked.lock().entry(msg_id).or_default().push(ready);
                None
            }
        }
    }

    /// Record a vote, releasing any parked work the vote settles.
    pub fn on_decision(
        &self,
        predicate: &str,
        result: PredicateResult,
    ) -> SmallVec<[Released; 2]> {
        let verdict = self.decisions.record(predicate, result);
        let mut released = SmallVec::new();
        if verdict == Verdict::Undecided {
            return released;
        }
        if let Some(parked) = self.parked.lock().remove(&result.msg_id) {
            for ready in parked {
                released.push(match verdict {
                    Verdict::Accepted => Released::Run(ready),
                    Verdict::Rejected => Released::Retire(ready),
                    Verdict::Undecided => unreachable!(),
                });
            }
        }
        released
    }

    /// Work still parked on undecided verdicts. Reported at shutdown.
    pub fn residual(&self) -> usize {
        self.parked.lock().values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::message::Message;
    use crate::model::{ProductMap, ProductStore};
    use std::sync::Arc;

    fn ready(id: u64) -> Ready {
        let base = ProductStore::base("Source");
        let store = base.make_child(0, "event", "Source", ProductMap::new());
        Ready {
            trigger: Message {
                store,
                eom: None,
                id,
                original_id: None,
            },
            stores: SmallVec::new(),
        }
    }

    #[test]
    fn conjunction_needs_every_predicate() {
        let map = DecisionMap::new(vec!["hot".into(), "calm".into()]);
        let vote = |value| PredicateResult { msg_id: 1, value };
        assert_eq!(map.record("hot", vote(true)), Verdict::Undecided);
        assert_eq!(map.record("calm", vote(true)), Verdict::Accepted);
    }

    #[test]
    fn false_short_circuits_and_sticks() {
        let map = DecisionMap::new(vec!["hot".into(), "calm".into()]);
        assert_eq!(
            map.record("hot", PredicateResult { msg_id: 1, value: false }),
            Verdict::Rejected
        );
        // A late true vote cannot flip a settled verdict.
        assert_eq!(
            map.record("calm", PredicateResult { msg_id: 1, value: true }),
            Verdict::Rejected
        );
    }

    #[test]
    fn gate_parks_until_settled() {
        let gate = Gate::new(vec!["hot".into()]);
        assert!(gate.admit(ready(5)).is_none());
        assert_eq!(gate.residual(), 1);

        let released = gate.on_decision("hot", PredicateResult { msg_id: 5, value: true });
        assert_eq!(released.len(), 1);
        assert!(matches!(released[0], Released::Run(_)));
        assert_eq!(gate.residual(), 0);
    }

    #[test]
    fn rejected_work_is_released_for_retirement() {
        let gate = Gate::new(vec!["hot".into()]);
        assert!(gate.admit(ready(6)).is_none());
        let released = gate.on_decision("hot", PredicateResult { msg_id: 6, value: false });
        assert!(matches!(released[0], Released::Retire(_)));

        // A settled id releases later admissions immediately.
        assert!(matches!(gate.admit(ready(6)), Some(Released::Retire(_))));
    }
}
