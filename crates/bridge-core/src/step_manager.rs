//! C4 — drives one order's steps to completion in sequence.
//!
//! All of an order's nodes are released to the robot up front (see
//! `order_builder`), so "sequential" here means the bridge only looks at
//! the action ids belonging to the *current* step when deciding whether
//! it finished; actions reported for later steps are buffered by the
//! aggregator they eventually belong to rather than discarded.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bridge_shared::errors::BridgeResult;
use bridge_shared::messaging::{ActionStatusWire, CommandStore};
use bridge_shared::models::{StepExecution, StepExecutionStatus};
use uuid::Uuid;

use crate::action_status_aggregator::{ActionStatusAggregator, StepOutcome};

#[derive(Debug, Clone)]
pub struct StepRuntime {
    pub step_execution_id: Uuid,
    pub step_order: i32,
    pub action_ids: Vec<String>,
    pub expected_action_count: u32,
    pub timeout: Duration,
    /// Mirrors `OrderStep::wait_for_completion`. When `false` the engine
    /// resolves this step to `Finished`/`Success` as soon as it is
    /// dispatched, without consulting the aggregator at all.
    pub wait_for_completion: bool,
}

struct StepProgress {
    runtime: StepRuntime,
    aggregator: ActionStatusAggregator,
    started_at: Instant,
}

/// Owns the in-memory progress of one `OrderExecution`. Persisted state
/// (the `StepExecution` rows) is the source of truth across restarts;
/// this struct is the live working set while the order is in flight.
pub struct StepManager {
    order_execution_id: Uuid,
    steps: Vec<StepRuntime>,
    current_index: usize,
    progress: Option<StepProgress>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepManagerEvent {
    StepSucceeded,
    StepFailed,
    StepTimedOut,
    OrderComplete,
}

impl StepManager {
    pub fn new(order_execution_id: Uuid, steps: Vec<StepRuntime>) -> Self {
        let mut manager = Self {
            order_execution_id,
            steps,
            current_index: 0,
            progress: None,
        };
        manager.start_current();
        manager
    }

    fn start_current(&mut self) {
        self.progress = self.steps.get(self.current_index).map(|runtime| StepProgress {
            runtime: runtime.clone(),
            aggregator: ActionStatusAggregator::new(),
            started_at: Instant::now(),
        });
    }

    pub fn current_step(&self) -> Option<&StepRuntime> {
        self.progress.as_ref().map(|p| &p.runtime)
    }

    /// Routes a `(action_id, status)` pair into the current step's
    /// aggregator if it belongs there; statuses for steps that have
    /// already resolved are ignored since the robot keeps echoing them
    /// in later `state` frames.
    pub fn ingest_action_status(&mut self, action_id: &str, status: ActionStatusWire) {
        if let Some(progress) = &mut self.progress {
            if progress.runtime.action_ids.iter().any(|id| id == action_id) {
                progress.aggregator.record(action_id, status);
            }
        }
    }

    /// Evaluates the current step's aggregator, returning an event if it
    /// has resolved. A step that has neither succeeded, failed, nor timed
    /// out yet returns `None` and the caller should keep waiting.
    pub fn poll(&mut self) -> Option<StepManagerEvent> {
        let progress = self.progress.as_ref()?;

        if progress.started_at.elapsed() >= progress.runtime.timeout {
            return Some(StepManagerEvent::StepTimedOut);
        }

        match progress.aggregator.outcome(progress.runtime.expected_action_count) {
            StepOutcome::Success => Some(StepManagerEvent::StepSucceeded),
            StepOutcome::Failure => Some(StepManagerEvent::StepFailed),
            StepOutcome::Waiting | StepOutcome::InProgress | StepOutcome::Undetermined => None,
        }
    }

    /// Advances past the current step. Returns `OrderComplete` once there
    /// is no next step to start.
    pub fn advance(&mut self) -> StepManagerEvent {
        self.current_index += 1;
        self.start_current();
        if self.progress.is_some() {
            StepManagerEvent::StepSucceeded
        } else {
            StepManagerEvent::OrderComplete
        }
    }

    pub async fn persist_step_outcome(
        &self,
        store: &dyn CommandStore,
        step_execution_id: Uuid,
        status: StepExecutionStatus,
        result: Option<String>,
    ) -> BridgeResult<()> {
        store
            .transition_step_execution(step_execution_id, status, result)
            .await
    }

    pub fn order_execution_id(&self) -> Uuid {
        self.order_execution_id
    }
}

/// Builds the runtime step list for a freshly dispatched order: one entry
/// per step, action ids drawn from the order's nodes in step order.
///
/// `step_meta_by_step` carries each step's `(wait_for_completion,
/// timeout_seconds)` override, keyed by `step_order`; a step missing from
/// the map waits for completion and takes `default_timeout`.
pub fn build_step_runtimes(
    step_executions: &[StepExecution],
    action_ids_by_step: &HashMap<i32, Vec<String>>,
    step_meta_by_step: &HashMap<i32, (bool, Option<Duration>)>,
    default_timeout: Duration,
) -> Vec<StepRuntime> {
    step_executions
        .iter()
        .map(|step| {
            let (wait_for_completion, timeout_override) = step_meta_by_step
                .get(&step.step_order)
                .copied()
                .unwrap_or((true, None));
            StepRuntime {
                step_execution_id: step.step_execution_id,
                step_order: step.step_order,
                action_ids: action_ids_by_step
                    .get(&step.step_order)
                    .cloned()
                    .unwrap_or_default(),
                expected_action_count: step.expected_action_count,
                timeout: timeout_override.unwrap_or(default_timeout),
                wait_for_completion,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(step_order: i32, action_ids: Vec<&str>) -> StepRuntime {
        StepRuntime {
            step_execution_id: Uuid::new_v4(),
            step_order,
            action_ids: action_ids.into_iter().map(String::from).collect(),
            expected_action_count: 1,
            timeout: Duration::from_secs(300),
            wait_for_completion: true,
        }
    }

    #[test]
    fn resolves_success_only_for_current_step_actions() {
        let mut manager = StepManager::new(
            Uuid::new_v4(),
            vec![runtime(1, vec!["a1"]), runtime(2, vec!["a2"])],
        );

        manager.ingest_action_status("a2", ActionStatusWire::Finished);
        assert_eq!(manager.poll(), None);

        manager.ingest_action_status("a1", ActionStatusWire::Finished);
        assert_eq!(manager.poll(), Some(StepManagerEvent::StepSucceeded));
    }

    #[test]
    fn advancing_past_last_step_signals_order_complete() {
        let mut manager = StepManager::new(Uuid::new_v4(), vec![runtime(1, vec!["a1"])]);
        assert_eq!(manager.advance(), StepManagerEvent::OrderComplete);
        assert!(manager.current_step().is_none());
    }

    #[test]
    fn failure_short_circuits_waiting() {
        let mut manager = StepManager::new(Uuid::new_v4(), vec![runtime(1, vec!["a1", "a2"])]);
        manager.ingest_action_status("a1", ActionStatusWire::Failed);
        assert_eq!(manager.poll(), Some(StepManagerEvent::StepFailed));
    }
}
