//! Data model entities from the specification's data model section.
//!
//! These are plain serde-able structs shared between `bridge-core` (which
//! owns their lifecycle transitions) and `bridge-service`'s Postgres
//! adapter (which persists them). The core never constructs SQL directly;
//! it only reads/writes these types through the `CommandStore` port trait.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Pending,
    Running,
    Success,
    Failure,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Waiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepExecutionStatus {
    Pending,
    Running,
    Finished,
    Failed,
    Timeout,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockingType {
    None,
    Soft,
    Hard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandDefinition {
    pub command_definition_id: Uuid,
    pub command_type: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command_id: Uuid,
    pub command_definition_id: Option<Uuid>,
    pub raw_payload: String,
    pub status: CommandStatus,
    pub requested_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Command {
    /// Invariant: terminal status implies response time set.
    pub fn is_consistent(&self) -> bool {
        let terminal = matches!(
            self.status,
            CommandStatus::Success | CommandStatus::Failure | CommandStatus::Rejected
        );
        !terminal || self.responded_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandExecution {
    pub command_execution_id: Uuid,
    pub command_id: Uuid,
    pub status: CommandExecutionStatus,
    /// 0 means the walk has finished.
    pub current_order_index: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOrderMapping {
    pub command_definition_id: Uuid,
    pub execution_order: i32,
    pub template_id: Uuid,
    /// 0 = success terminates the walk.
    pub next_execution_order: i32,
    /// 0 = failure terminates the walk.
    pub failure_order: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct NodePosition {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    pub map_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ActionParamValue {
    String(String),
    Number(f64),
    Boolean(bool),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionTemplate {
    pub action_type: String,
    pub description: String,
    pub blocking_type: BlockingType,
    pub execution_order: i32,
    pub parameters: HashMap<String, (String, ActionParamValue)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStep {
    pub step_order: i32,
    pub node_position: Option<NodePosition>,
    pub actions: Vec<ActionTemplate>,
    pub wait_for_completion: bool,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTemplate {
    pub template_id: Uuid,
    pub name: String,
    pub steps: Vec<OrderStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderExecution {
    pub order_execution_id: Uuid,
    pub command_execution_id: Uuid,
    pub template_id: Option<Uuid>,
    pub order_id: String,
    pub execution_order: i32,
    pub current_step: i32,
    pub status: OrderExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_execution_id: Uuid,
    pub order_execution_id: Uuid,
    pub step_order: i32,
    pub status: StepExecutionStatus,
    pub expected_action_count: u32,
    pub sent_to_robot: bool,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// §3: pending direct-command record kept in the cache, keyed by order_id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDirectCommand {
    pub full_command: String,
    pub order_id: String,
    pub timestamp: DateTime<Utc>,
}
