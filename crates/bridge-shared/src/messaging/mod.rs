//! VDA5050 wire DTOs and the port traits that isolate `bridge-core` from
//! concrete Postgres/Redis/MQTT drivers. This mirrors the teacher's
//! `MessageClient`/`MessagingProvider` split: core code depends only on
//! these traits, and `bridge-service` supplies the adapters at startup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::BridgeResult;
use crate::models::{
    Command, CommandDefinition, CommandExecution, CommandExecutionStatus, CommandOrderMapping,
    CommandStatus, NodePosition, OrderExecution, OrderExecutionStatus, OrderTemplate,
    PendingDirectCommand, StepExecution, StepExecutionStatus,
};

// ---------------------------------------------------------------------
// VDA5050 wire types
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePositionWire {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    #[serde(rename = "mapId")]
    pub map_id: String,
}

impl From<NodePosition> for NodePositionWire {
    fn from(p: NodePosition) -> Self {
        Self {
            x: p.x,
            y: p.y,
            theta: p.theta,
            map_id: p.map_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionParameterWire {
    pub key: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BlockingTypeWire {
    None,
    Soft,
    Hard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionWire {
    #[serde(rename = "actionType")]
    pub action_type: String,
    #[serde(rename = "actionId")]
    pub action_id: String,
    #[serde(rename = "actionDescription")]
    pub action_description: String,
    #[serde(rename = "blockingType")]
    pub blocking_type: BlockingTypeWire,
    #[serde(rename = "actionParameters", default)]
    pub action_parameters: Vec<ActionParameterWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeWire {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    #[serde(rename = "sequenceId")]
    pub sequence_id: u32,
    pub released: bool,
    #[serde(rename = "nodePosition", skip_serializing_if = "Option::is_none")]
    pub node_position: Option<NodePositionWire>,
    pub actions: Vec<ActionWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeWire {
    #[serde(rename = "edgeId")]
    pub edge_id: String,
    #[serde(rename = "sequenceId")]
    pub sequence_id: u32,
    pub released: bool,
    #[serde(rename = "startNodeId")]
    pub start_node_id: String,
    #[serde(rename = "endNodeId")]
    pub end_node_id: String,
    pub actions: Vec<ActionWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderWire {
    #[serde(rename = "headerId")]
    pub header_id: u64,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub manufacturer: String,
    #[serde(rename = "serialNumber")]
    pub serial_number: String,
    #[serde(rename = "orderId")]
    pub order_id: String,
    #[serde(rename = "orderUpdateId")]
    pub order_update_id: u32,
    pub nodes: Vec<NodeWire>,
    pub edges: Vec<EdgeWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstantActionsWire {
    #[serde(rename = "headerId")]
    pub header_id: u64,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub manufacturer: String,
    #[serde(rename = "serialNumber")]
    pub serial_number: String,
    pub actions: Vec<ActionWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionStatusWire {
    Waiting,
    Initializing,
    Running,
    Paused,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStateWire {
    #[serde(rename = "actionId")]
    pub action_id: String,
    #[serde(rename = "actionType")]
    pub action_type: String,
    #[serde(rename = "actionStatus")]
    pub action_status: ActionStatusWire,
    #[serde(rename = "resultDescription", default)]
    pub result_description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateWire {
    #[serde(rename = "headerId")]
    pub header_id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "orderId", default)]
    pub order_id: String,
    #[serde(rename = "lastNodeSequenceId", default)]
    pub last_node_sequence_id: u32,
    #[serde(rename = "actionStates", default)]
    pub action_states: Vec<ActionStateWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStateWire {
    Online,
    Offline,
    ConnectionBroken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionWire {
    #[serde(rename = "headerId")]
    pub header_id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "connectionState")]
    pub connection_state: ConnectionStateWire,
}

// ---------------------------------------------------------------------
// Port traits
// ---------------------------------------------------------------------

/// Persistence boundary for commands and the workflow entities they drive.
/// `bridge-service` implements this against Postgres; tests implement it
/// in-memory.
#[async_trait]
pub trait CommandStore: Send + Sync {
    async fn create_command(&self, command: &Command) -> BridgeResult<()>;
    async fn transition_command(
        &self,
        command_id: Uuid,
        status: CommandStatus,
        error_message: Option<String>,
    ) -> BridgeResult<()>;

    async fn create_command_execution(&self, execution: &CommandExecution) -> BridgeResult<()>;
    async fn transition_command_execution(
        &self,
        command_execution_id: Uuid,
        status: CommandExecutionStatus,
        current_order_index: i32,
    ) -> BridgeResult<()>;

    async fn create_order_execution(&self, execution: &OrderExecution) -> BridgeResult<()>;
    async fn transition_order_execution(
        &self,
        order_execution_id: Uuid,
        status: OrderExecutionStatus,
        current_step: i32,
    ) -> BridgeResult<()>;

    async fn create_step_execution(&self, execution: &StepExecution) -> BridgeResult<()>;
    async fn transition_step_execution(
        &self,
        step_execution_id: Uuid,
        status: StepExecutionStatus,
        result: Option<String>,
    ) -> BridgeResult<()>;

    async fn load_mapping(
        &self,
        command_definition_id: Uuid,
        execution_order: i32,
    ) -> BridgeResult<Option<CommandOrderMapping>>;

    async fn load_command_definition(
        &self,
        command_type: &str,
    ) -> BridgeResult<Option<CommandDefinition>>;

    async fn load_order_template(&self, template_id: Uuid) -> BridgeResult<OrderTemplate>;
}

/// Ephemeral, TTL-bound state that does not need durability: in-flight
/// direct commands awaiting a matching order completion, and per-step
/// action-id status bags accumulated from `state` messages.
#[async_trait]
pub trait ActionStateCache: Send + Sync {
    async fn put_pending_direct_command(&self, cmd: &PendingDirectCommand) -> BridgeResult<()>;
    async fn take_pending_direct_command(
        &self,
        order_id: &str,
    ) -> BridgeResult<Option<PendingDirectCommand>>;

    async fn record_action_status(
        &self,
        order_id: &str,
        action_id: &str,
        status: ActionStatusWire,
    ) -> BridgeResult<()>;

    async fn action_statuses(
        &self,
        order_id: &str,
    ) -> BridgeResult<Vec<(String, ActionStatusWire)>>;

    async fn clear_order(&self, order_id: &str) -> BridgeResult<()>;
}

/// Outbound path to the robot over MQTT order/instantActions topics.
#[async_trait]
pub trait RobotPublisher: Send + Sync {
    async fn publish_order(&self, order: &OrderWire) -> BridgeResult<()>;
    async fn publish_instant_actions(&self, actions: &InstantActionsWire) -> BridgeResult<()>;
}

/// Outbound path back to the PLC: a single line-oriented response per
/// completed or rejected command.
#[async_trait]
pub trait PlcResponder: Send + Sync {
    async fn send_response(&self, line: String) -> BridgeResult<()>;
}

/// Tracks the robot's last reported connection state so the coordinator
/// can reject new commands while the robot is unreachable.
pub trait RobotConnectionWatcher: Send + Sync {
    fn is_online(&self) -> bool;
}
