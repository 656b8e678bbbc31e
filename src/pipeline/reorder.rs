//! Commit frontier tracking
//!
//! Every event read from the source is registered here in source order.
//! Completions can arrive in any order; the commit frontier only moves to
//! the highest position whose predecessors have all completed.

use crate::event::ResumePosition;
use std::collections::BTreeMap;

/// Tracks which registered positions have reached a terminal state
#[derive(Debug, Default)]
pub struct CommitTracker {
    committed: Option<ResumePosition>,
    pending: BTreeMap<ResumePosition, bool>,
}

impl CommitTracker {
    /// Create a tracker whose frontier starts at `committed`
    pub fn new(committed: Option<ResumePosition>) -> Self {
        Self {
            committed,
            pending: BTreeMap::new(),
        }
    }

    /// Register a newly received position
    ///
    /// Positions at or below the committed frontier are ignored.
    pub fn register(&mut self, position: ResumePosition) {
        if self.committed.map_or(true, |c| position > c) {
            self.pending.entry(position).or_insert(false);
        }
    }

    /// Mark a registered position as complete
    ///
    /// Returns false if the position was not registered.
    pub fn complete(&mut self, position: ResumePosition) -> bool {
        match self.pending.get_mut(&position) {
            Some(done) => {
                *done = true;
                true
            }
            None => false,
        }
    }

    /// Highest position that can be committed, if beyond the current frontier
    ///
    /// # Examples
    ///
    /// ```
    /// use streamhook::event::ResumePosition;
    /// use streamhook::pipeline::CommitTracker;
    ///
    /// let mut tracker = CommitTracker::new(None);
    /// for p in [1, 2, 3] {
    ///     tracker.register(ResumePosition(p));
    /// }
    /// tracker.complete(ResumePosition(1));
    /// tracker.complete(ResumePosition(3));
    /// assert_eq!(tracker.ready(), Some(ResumePosition(1)));
    /// tracker.complete(ResumePosition(2));
    /// assert_eq!(tracker.ready(), Some(ResumePosition(3)));
    /// ```
    pub fn ready(&self) -> Option<ResumePosition> {
        self.pending
            .iter()
            .take_while(|(_, done)| **done)
            .last()
            .map(|(position, _)| *position)
    }

    /// Record that `position` has been durably committed
    pub fn commit(&mut self, position: ResumePosition) {
        self.pending = self.pending.split_off(&ResumePosition(position.value().saturating_add(1)));
        if position.value() == u64::MAX {
            self.pending.clear();
        }
        self.committed = Some(self.committed.map_or(position, |c| c.max(position)));
    }

    /// Last committed position
    pub fn committed(&self) -> Option<ResumePosition> {
        self.committed
    }

    /// Registered positions that have not completed yet
    pub fn in_flight(&self) -> usize {
        self.pending.values().filter(|done| !**done).count()
    }

    /// Registered positions not yet committed
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True if nothing is waiting to be committed
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
