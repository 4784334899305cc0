//! `CommandStore` backed by Postgres via `sqlx`, following the teacher's
//! convention of a thin adapter struct wrapping a `PgPool` with one method
//! per port operation and no business logic of its own.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use bridge_shared::errors::{BridgeError, BridgeResult};
use bridge_shared::messaging::CommandStore;
use bridge_shared::models::{
    Command, CommandDefinition, CommandExecution, CommandExecutionStatus, CommandOrderMapping,
    CommandStatus, OrderExecution, OrderExecutionStatus, OrderStep, OrderTemplate, StepExecution,
    StepExecutionStatus,
};

pub struct PostgresCommandStore {
    pool: PgPool,
}

impl PostgresCommandStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn command_status_str(status: CommandStatus) -> &'static str {
    match status {
        CommandStatus::Pending => "pending",
        CommandStatus::Running => "running",
        CommandStatus::Success => "success",
        CommandStatus::Failure => "failure",
        CommandStatus::Rejected => "rejected",
    }
}

fn command_execution_status_str(status: CommandExecutionStatus) -> &'static str {
    match status {
        CommandExecutionStatus::Running => "running",
        CommandExecutionStatus::Completed => "completed",
        CommandExecutionStatus::Failed => "failed",
        CommandExecutionStatus::Cancelled => "cancelled",
    }
}

fn order_execution_status_str(status: OrderExecutionStatus) -> &'static str {
    match status {
        OrderExecutionStatus::Pending => "pending",
        OrderExecutionStatus::Running => "running",
        OrderExecutionStatus::Completed => "completed",
        OrderExecutionStatus::Failed => "failed",
        OrderExecutionStatus::Waiting => "waiting",
    }
}

fn step_execution_status_str(status: StepExecutionStatus) -> &'static str {
    match status {
        StepExecutionStatus::Pending => "pending",
        StepExecutionStatus::Running => "running",
        StepExecutionStatus::Finished => "finished",
        StepExecutionStatus::Failed => "failed",
        StepExecutionStatus::Timeout => "timeout",
        StepExecutionStatus::Skipped => "skipped",
    }
}

#[async_trait]
impl CommandStore for PostgresCommandStore {
    async fn create_command(&self, command: &Command) -> BridgeResult<()> {
        sqlx::query(
            "INSERT INTO commands (command_id, command_definition_id, raw_payload, status, requested_at, responded_at, error_message)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(command.command_id)
        .bind(command.command_definition_id)
        .bind(&command.raw_payload)
        .bind(command_status_str(command.status))
        .bind(command.requested_at)
        .bind(command.responded_at)
        .bind(&command.error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| BridgeError::database("create_command", e))?;
        Ok(())
    }

    async fn transition_command(
        &self,
        command_id: Uuid,
        status: CommandStatus,
        error_message: Option<String>,
    ) -> BridgeResult<()> {
        let terminal = matches!(
            status,
            CommandStatus::Success | CommandStatus::Failure | CommandStatus::Rejected
        );
        sqlx::query(
            "UPDATE commands
             SET status = $1, error_message = $2, responded_at = CASE WHEN $3 THEN now() ELSE responded_at END
             WHERE command_id = $4",
        )
        .bind(command_status_str(status))
        .bind(&error_message)
        .bind(terminal)
        .bind(command_id)
        .execute(&self.pool)
        .await
        .map_err(|e| BridgeError::database("transition_command", e))?;
        Ok(())
    }

    async fn create_command_execution(&self, execution: &CommandExecution) -> BridgeResult<()> {
        sqlx::query(
            "INSERT INTO command_executions (command_execution_id, command_id, status, current_order_index, started_at, finished_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(execution.command_execution_id)
        .bind(execution.command_id)
        .bind(command_execution_status_str(execution.status))
        .bind(execution.current_order_index)
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| BridgeError::database("create_command_execution", e))?;
        Ok(())
    }

    async fn transition_command_execution(
        &self,
        command_execution_id: Uuid,
        status: CommandExecutionStatus,
        current_order_index: i32,
    ) -> BridgeResult<()> {
        let terminal = matches!(
            status,
            CommandExecutionStatus::Completed
                | CommandExecutionStatus::Failed
                | CommandExecutionStatus::Cancelled
        );
        sqlx::query(
            "UPDATE command_executions
             SET status = $1, current_order_index = $2, finished_at = CASE WHEN $3 THEN now() ELSE finished_at END
             WHERE command_execution_id = $4",
        )
        .bind(command_execution_status_str(status))
        .bind(current_order_index)
        .bind(terminal)
        .bind(command_execution_id)
        .execute(&self.pool)
        .await
        .map_err(|e| BridgeError::database("transition_command_execution", e))?;
        Ok(())
    }

    async fn create_order_execution(&self, execution: &OrderExecution) -> BridgeResult<()> {
        sqlx::query(
            "INSERT INTO order_executions (order_execution_id, command_execution_id, template_id, order_id, execution_order, current_step, status, created_at, finished_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(execution.order_execution_id)
        .bind(execution.command_execution_id)
        .bind(execution.template_id)
        .bind(&execution.order_id)
        .bind(execution.execution_order)
        .bind(execution.current_step)
        .bind(order_execution_status_str(execution.status))
        .bind(execution.created_at)
        .bind(execution.finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| BridgeError::database("create_order_execution", e))?;
        Ok(())
    }

    async fn transition_order_execution(
        &self,
        order_execution_id: Uuid,
        status: OrderExecutionStatus,
        current_step: i32,
    ) -> BridgeResult<()> {
        let terminal = matches!(
            status,
            OrderExecutionStatus::Completed | OrderExecutionStatus::Failed
        );
        sqlx::query(
            "UPDATE order_executions
             SET status = $1, current_step = $2, finished_at = CASE WHEN $3 THEN now() ELSE finished_at END
             WHERE order_execution_id = $4",
        )
        .bind(order_execution_status_str(status))
        .bind(current_step)
        .bind(terminal)
        .bind(order_execution_id)
        .execute(&self.pool)
        .await
        .map_err(|e| BridgeError::database("transition_order_execution", e))?;
        Ok(())
    }

    async fn create_step_execution(&self, execution: &StepExecution) -> BridgeResult<()> {
        sqlx::query(
            "INSERT INTO step_executions (step_execution_id, order_execution_id, step_order, status, expected_action_count, sent_to_robot, result, error_message, started_at, finished_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(execution.step_execution_id)
        .bind(execution.order_execution_id)
        .bind(execution.step_order)
        .bind(step_execution_status_str(execution.status))
        .bind(execution.expected_action_count as i32)
        .bind(execution.sent_to_robot)
        .bind(&execution.result)
        .bind(&execution.error_message)
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| BridgeError::database("create_step_execution", e))?;
        Ok(())
    }

    async fn transition_step_execution(
        &self,
        step_execution_id: Uuid,
        status: StepExecutionStatus,
        result: Option<String>,
    ) -> BridgeResult<()> {
        let terminal = matches!(
            status,
            StepExecutionStatus::Finished
                | StepExecutionStatus::Failed
                | StepExecutionStatus::Timeout
                | StepExecutionStatus::Skipped
        );
        sqlx::query(
            "UPDATE step_executions
             SET status = $1, result = $2, finished_at = CASE WHEN $3 THEN now() ELSE finished_at END
             WHERE step_execution_id = $4",
        )
        .bind(step_execution_status_str(status))
        .bind(&result)
        .bind(terminal)
        .bind(step_execution_id)
        .execute(&self.pool)
        .await
        .map_err(|e| BridgeError::database("transition_step_execution", e))?;
        Ok(())
    }

    async fn load_mapping(
        &self,
        command_definition_id: Uuid,
        execution_order: i32,
    ) -> BridgeResult<Option<CommandOrderMapping>> {
        let row = sqlx::query_as::<_, (Uuid, i32, Uuid, i32, i32)>(
            "SELECT command_definition_id, execution_order, template_id, next_execution_order, failure_order
             FROM command_order_mappings
             WHERE command_definition_id = $1 AND execution_order = $2",
        )
        .bind(command_definition_id)
        .bind(execution_order)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BridgeError::database("load_mapping", e))?;

        Ok(row.map(
            |(command_definition_id, execution_order, template_id, next_execution_order, failure_order)| {
                CommandOrderMapping {
                    command_definition_id,
                    execution_order,
                    template_id,
                    next_execution_order,
                    failure_order,
                }
            },
        ))
    }

    async fn load_command_definition(
        &self,
        command_type: &str,
    ) -> BridgeResult<Option<CommandDefinition>> {
        let row = sqlx::query_as::<_, (Uuid, String, bool)>(
            "SELECT command_definition_id, command_type, active FROM command_definitions WHERE command_type = $1",
        )
        .bind(command_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BridgeError::database("load_command_definition", e))?;

        Ok(row.map(|(command_definition_id, command_type, active)| CommandDefinition {
            command_definition_id,
            command_type,
            active,
        }))
    }

    async fn load_order_template(&self, template_id: Uuid) -> BridgeResult<OrderTemplate> {
        let row = sqlx::query_as::<_, (Uuid, String, serde_json::Value)>(
            "SELECT template_id, name, steps FROM order_templates WHERE template_id = $1",
        )
        .bind(template_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BridgeError::database("load_order_template", e))?
        .ok_or_else(|| BridgeError::database("load_order_template", "template not found"))?;

        let steps: Vec<OrderStep> = serde_json::from_value(row.2)
            .map_err(|e| BridgeError::database("load_order_template", e))?;

        Ok(OrderTemplate {
            template_id: row.0,
            name: row.1,
            steps,
        })
    }
}
