//! C5 — walks the `CommandOrderMapping` graph for a command execution,
//! deciding which order template to dispatch next and where a finished
//! order's outcome sends the walk.
//!
//! The mapping table is a flat adjacency list keyed by
//! `(command_definition_id, execution_order)`; `next_execution_order` and
//! `failure_order` of `0` both mean "the walk ends here", just on
//! different branches.

use bridge_shared::errors::{BridgeError, BridgeResult};
use bridge_shared::messaging::CommandStore;
use bridge_shared::models::{CommandExecutionStatus, CommandOrderMapping};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowOutcome {
    /// Another order was found and should be dispatched.
    Continue { next_execution_order: i32 },
    /// The walk ended on the success branch.
    CommandSucceeded,
    /// The walk ended on the failure branch.
    CommandFailed,
}

pub struct WorkflowExecutor<'a> {
    store: &'a dyn CommandStore,
    command_definition_id: Uuid,
}

impl<'a> WorkflowExecutor<'a> {
    pub fn new(store: &'a dyn CommandStore, command_definition_id: Uuid) -> Self {
        Self {
            store,
            command_definition_id,
        }
    }

    /// Looks up the mapping for `execution_order`. A missing mapping on
    /// the very first order of a command is a configuration error; a
    /// missing mapping mid-walk after an order has already succeeded
    /// should never happen and is also treated as an error rather than
    /// silently ending the command successfully.
    pub async fn load_order(
        &self,
        execution_order: i32,
    ) -> BridgeResult<CommandOrderMapping> {
        self.store
            .load_mapping(self.command_definition_id, execution_order)
            .await?
            .ok_or(BridgeError::WorkflowMissingMapping {
                command_definition_id: self.command_definition_id,
                order_index: execution_order,
            })
    }

    pub fn on_order_completed(&self, mapping: &CommandOrderMapping) -> WorkflowOutcome {
        if mapping.next_execution_order == 0 {
            WorkflowOutcome::CommandSucceeded
        } else {
            WorkflowOutcome::Continue {
                next_execution_order: mapping.next_execution_order,
            }
        }
    }

    pub fn on_order_failed(&self, mapping: &CommandOrderMapping) -> WorkflowOutcome {
        if mapping.failure_order == 0 {
            WorkflowOutcome::CommandFailed
        } else {
            WorkflowOutcome::Continue {
                next_execution_order: mapping.failure_order,
            }
        }
    }

    pub async fn mark_command_execution_finished(
        &self,
        command_execution_id: Uuid,
        succeeded: bool,
    ) -> BridgeResult<()> {
        let status = if succeeded {
            CommandExecutionStatus::Completed
        } else {
            CommandExecutionStatus::Failed
        };
        self.store
            .transition_command_execution(command_execution_id, status, 0)
            .await
    }

    pub async fn cancel_all_running_orders(
        &self,
        order_execution_ids: &[Uuid],
    ) -> BridgeResult<()> {
        for id in order_execution_ids {
            self.store
                .transition_order_execution(
                    *id,
                    bridge_shared::models::OrderExecutionStatus::Failed,
                    0,
                )
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(next: i32, failure: i32) -> CommandOrderMapping {
        CommandOrderMapping {
            command_definition_id: Uuid::new_v4(),
            execution_order: 1,
            template_id: Uuid::new_v4(),
            next_execution_order: next,
            failure_order: failure,
        }
    }

    #[test]
    fn success_with_zero_next_ends_walk() {
        let m = mapping(0, 2);
        let store = NoopStore;
        let executor = WorkflowExecutor::new(&store, m.command_definition_id);
        assert_eq!(executor.on_order_completed(&m), WorkflowOutcome::CommandSucceeded);
    }

    #[test]
    fn success_with_nonzero_next_continues() {
        let m = mapping(3, 2);
        let store = NoopStore;
        let executor = WorkflowExecutor::new(&store, m.command_definition_id);
        assert_eq!(
            executor.on_order_completed(&m),
            WorkflowOutcome::Continue { next_execution_order: 3 }
        );
    }

    #[test]
    fn failure_with_zero_failure_order_ends_walk() {
        let m = mapping(3, 0);
        let store = NoopStore;
        let executor = WorkflowExecutor::new(&store, m.command_definition_id);
        assert_eq!(executor.on_order_failed(&m), WorkflowOutcome::CommandFailed);
    }

    #[test]
    fn failure_with_nonzero_failure_order_continues() {
        let m = mapping(3, 5);
        let store = NoopStore;
        let executor = WorkflowExecutor::new(&store, m.command_definition_id);
        assert_eq!(
            executor.on_order_failed(&m),
            WorkflowOutcome::Continue { next_execution_order: 5 }
        );
    }

    struct NoopStore;

    #[async_trait::async_trait]
    impl CommandStore for NoopStore {
        async fn create_command(&self, _: &bridge_shared::models::Command) -> BridgeResult<()> {
            Ok(())
        }
        async fn transition_command(
            &self,
            _: Uuid,
            _: bridge_shared::models::CommandStatus,
            _: Option<String>,
        ) -> BridgeResult<()> {
            Ok(())
        }
        async fn create_command_execution(
            &self,
            _: &bridge_shared::models::CommandExecution,
        ) -> BridgeResult<()> {
            Ok(())
        }
        async fn transition_command_execution(
            &self,
            _: Uuid,
            _: CommandExecutionStatus,
            _: i32,
        ) -> BridgeResult<()> {
            Ok(())
        }
        async fn create_order_execution(
            &self,
            _: &bridge_shared::models::OrderExecution,
        ) -> BridgeResult<()> {
            Ok(())
        }
        async fn transition_order_execution(
            &self,
            _: Uuid,
            _: bridge_shared::models::OrderExecutionStatus,
            _: i32,
        ) -> BridgeResult<()> {
            Ok(())
        }
        async fn create_step_execution(
            &self,
            _: &bridge_shared::models::StepExecution,
        ) -> BridgeResult<()> {
            Ok(())
        }
        async fn transition_step_execution(
            &self,
            _: Uuid,
            _: bridge_shared::models::StepExecutionStatus,
            _: Option<String>,
        ) -> BridgeResult<()> {
            Ok(())
        }
        async fn load_mapping(
            &self,
            _: Uuid,
            _: i32,
        ) -> BridgeResult<Option<CommandOrderMapping>> {
            Ok(None)
        }
        async fn load_command_definition(
            &self,
            _: &str,
        ) -> BridgeResult<Option<bridge_shared::models::CommandDefinition>> {
            Ok(None)
        }
        async fn load_order_template(
            &self,
            _: Uuid,
        ) -> BridgeResult<bridge_shared::models::OrderTemplate> {
            Err(BridgeError::InvalidFormat("unused in test".into()))
        }
    }
}
