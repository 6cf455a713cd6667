use std::collections::BTreeMap;

use super::EvId;

/// The timer structure: an ordered map keyed by absolute millisecond
/// deadline. Insert, remove and minimum-deadline lookup are all O(log n);
/// ties are broken by event identity so two events may share a deadline.
#[derive(Debug, Default)]
pub struct TimerTree {
    tree: BTreeMap<(u64, EvId), ()>,
}

impl TimerTree {
    pub fn new() -> TimerTree {
        TimerTree::default()
    }

    pub fn insert(&mut self, deadline: u64, id: EvId) {
        self.tree.insert((deadline, id), ());
    }

    /// Removing requires the deadline the event was registered with; the
    /// event record keeps it while `timer_set` is up.
    pub fn remove(&mut self, deadline: u64, id: EvId) {
        self.tree.remove(&(deadline, id));
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn min_deadline(&self) -> Option<u64> {
        self.tree.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Detach and return every event whose deadline has passed, in
    /// deadline order.
    pub fn expire(&mut self, now: u64) -> Vec<EvId> {
        let mut expired = Vec::new();
        while let Some(&(deadline, id)) = self.tree.keys().next() {
            if deadline > now {
                break;
            }
            self.tree.remove(&(deadline, id));
            expired.push(id);
        }
        expired
    }
}
