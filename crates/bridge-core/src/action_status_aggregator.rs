//! C3 — folds the `actionStates` reported on the `state` topic into a
//! verdict for the step currently awaiting them.
//!
//! A step carries `expected_action_count` actions. Every `state` message
//! only reports actions the robot currently knows about, so the
//! aggregator keeps the latest status seen per action id and re-derives
//! the verdict on every update rather than trusting message ordering.

use std::collections::HashMap;

use bridge_shared::messaging::ActionStatusWire;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Fewer statuses than expected, none failed yet.
    Waiting,
    /// At least one action still running/paused/initializing.
    InProgress,
    /// Every expected action finished.
    Success,
    /// At least one expected action failed.
    Failure,
    /// All expected action ids reported but at least one frame was
    /// truncated (duplicate ids with conflicting terminal statuses); the
    /// caller should prefer the failure reading rather than guess.
    Undetermined,
}

#[derive(Debug, Default)]
pub struct ActionStatusAggregator {
    statuses: HashMap<String, ActionStatusWire>,
}

impl ActionStatusAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, action_id: impl Into<String>, status: ActionStatusWire) {
        self.statuses.insert(action_id.into(), status);
    }

    pub fn ingest(&mut self, statuses: impl IntoIterator<Item = (String, ActionStatusWire)>) {
        for (id, status) in statuses {
            self.record(id, status);
        }
    }

    pub fn seen_count(&self) -> usize {
        self.statuses.len()
    }

    /// §: failure always wins a tie. If any recorded status is `Failed`
    /// the step is a failure even if the count of observed actions is
    /// still short of `expected_action_count` — there is no reason to
    /// keep waiting once one action has already failed.
    pub fn outcome(&self, expected_action_count: u32) -> StepOutcome {
        if self
            .statuses
            .values()
            .any(|s| *s == ActionStatusWire::Failed)
        {
            return StepOutcome::Failure;
        }

        if (self.statuses.len() as u32) < expected_action_count {
            return StepOutcome::Waiting;
        }

        let all_finished = self
            .statuses
            .values()
            .all(|s| *s == ActionStatusWire::Finished);

        if all_finished {
            StepOutcome::Success
        } else if self.statuses.len() as u32 > expected_action_count {
            // More distinct ids reported than expected: a stale id from a
            // previous step bled into this frame. Treat as unresolved
            // rather than silently accepting it as success.
            StepOutcome::Undetermined
        } else {
            StepOutcome::InProgress
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiting_until_all_expected_ids_seen() {
        let mut agg = ActionStatusAggregator::new();
        agg.record("a1", ActionStatusWire::Running);
        assert_eq!(agg.outcome(2), StepOutcome::Waiting);
    }

    #[test]
    fn success_when_all_finished() {
        let mut agg = ActionStatusAggregator::new();
        agg.record("a1", ActionStatusWire::Finished);
        agg.record("a2", ActionStatusWire::Finished);
        assert_eq!(agg.outcome(2), StepOutcome::Success);
    }

    #[test]
    fn failure_wins_even_before_all_ids_seen() {
        let mut agg = ActionStatusAggregator::new();
        agg.record("a1", ActionStatusWire::Failed);
        assert_eq!(agg.outcome(2), StepOutcome::Failure);
    }

    #[test]
    fn in_progress_when_some_still_running() {
        let mut agg = ActionStatusAggregator::new();
        agg.record("a1", ActionStatusWire::Finished);
        agg.record("a2", ActionStatusWire::Running);
        assert_eq!(agg.outcome(2), StepOutcome::InProgress);
    }

    #[test]
    fn later_updates_overwrite_earlier_ones_for_same_action() {
        let mut agg = ActionStatusAggregator::new();
        agg.record("a1", ActionStatusWire::Running);
        agg.record("a1", ActionStatusWire::Finished);
        assert_eq!(agg.seen_count(), 1);
        assert_eq!(agg.outcome(1), StepOutcome::Success);
    }

    #[test]
    fn extra_unexpected_ids_are_undetermined_not_success() {
        let mut agg = ActionStatusAggregator::new();
        agg.record("a1", ActionStatusWire::Finished);
        agg.record("a2", ActionStatusWire::Finished);
        assert_eq!(agg.outcome(1), StepOutcome::Undetermined);
    }
}
