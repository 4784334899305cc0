//! Error types shared across the bridge.
//!
//! A single [`BridgeError`] enum carries every failure mode named in the
//! specification's error handling design, plus the ambient failure modes of
//! the ports (database, cache, messaging). Core components return
//! [`BridgeResult<T>`] and never panic on data they do not control.

use uuid::Uuid;

pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("dependency unavailable: {dependency} - {reason}")]
    DependencyUnavailable { dependency: String, reason: String },

    #[error("unknown command: {token}")]
    UnknownCommand { token: String },

    #[error("invalid command format: {0}")]
    InvalidFormat(String),

    #[error("robot is not online")]
    RobotOffline,

    #[error("no workflow mapping for command_definition_id={command_definition_id} order_index={order_index}")]
    WorkflowMissingMapping {
        command_definition_id: Uuid,
        order_index: i32,
    },

    #[error("step {step_execution_id} timed out after {timeout_seconds}s")]
    StepTimeout {
        step_execution_id: Uuid,
        timeout_seconds: u64,
    },

    #[error("action {action_id} failed on order {order_id}")]
    ActionFailed { order_id: String, action_id: String },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("database error during {operation}: {reason}")]
    DatabaseError { operation: String, reason: String },

    #[error("cache error during {operation}: {reason}")]
    CacheError { operation: String, reason: String },

    #[error("messaging error: {0}")]
    MessagingError(String),

    #[error("state transition failed for {entity_type} {entity_id}: {reason}")]
    StateTransitionFailed {
        entity_type: String,
        entity_id: String,
        reason: String,
    },
}

impl BridgeError {
    pub fn database(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::DatabaseError {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub fn cache(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::CacheError {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error should surface to the PLC as `F` (failure) rather
    /// than being retried transparently.
    pub fn is_terminal_for_command(&self) -> bool {
        !matches!(self, Self::DependencyUnavailable { .. })
    }
}

impl From<String> for BridgeError {
    fn from(value: String) -> Self {
        Self::StateTransitionFailed {
            entity_type: "unknown".to_string(),
            entity_id: "unknown".to_string(),
            reason: value,
        }
    }
}
