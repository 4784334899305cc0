//! C6 — the per-command state machine: `Pending -> Acknowledged -> Running
//! -> {Completed, Failed}`.
//!
//! Both standard commands (which drive a `WorkflowExecutor` walk) and
//! direct actions (which dispatch a single order with no mapping lookup)
//! share this machine; the variant only changes what happens on entry to
//! `Running` and what "the next step" means.

use bridge_shared::errors::BridgeError;
use bridge_shared::state_machine::{Transition, TransitionGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandState {
    Pending,
    Acknowledged,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandEvent {
    Acknowledge,
    Dispatch,
    OrderSucceeded,
    OrderFailed,
    Reject,
}

fn guard() -> TransitionGuard<CommandState> {
    use CommandState::*;
    TransitionGuard::new(vec![
        Transition { from: Pending, to: Acknowledged },
        Transition { from: Pending, to: Failed },
        Transition { from: Acknowledged, to: Running },
        Transition { from: Acknowledged, to: Failed },
        // A command with more orders in its walk returns to `Running`
        // rather than advancing past it; this is a no-op transition the
        // guard must still allow since `WorkflowExecutor::Continue`
        // re-enters the same state.
        Transition { from: Running, to: Running },
        Transition { from: Running, to: Completed },
        Transition { from: Running, to: Failed },
    ])
}

/// Which PLC-facing shape this command takes. A direct action has no
/// `command_definition_id` and never consults the mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Standard { command_definition_id: Uuid },
    DirectAction,
}

pub struct CommandFsm {
    command_id: Uuid,
    kind: CommandKind,
    state: CommandState,
    /// Set once, the first time the command enters `Running`, so a
    /// multi-order standard command only ever emits one `R` line to the
    /// PLC no matter how many orders the walk dispatches.
    running_notified: bool,
}

impl CommandFsm {
    pub fn new(command_id: Uuid, kind: CommandKind) -> Self {
        Self {
            command_id,
            kind,
            state: CommandState::Pending,
            running_notified: false,
        }
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn command_id(&self) -> Uuid {
        self.command_id
    }

    /// Returns whether this transition should cause the PLC to be
    /// notified with the `Running` letter. Only the first `Acknowledged
    /// -> Running` (or `Running -> Running`, a no-op re-entry) transition
    /// triggers it.
    pub fn apply(&mut self, event: CommandEvent) -> Result<bool, BridgeError> {
        let guard = guard();
        let to = match (self.state, event) {
            (CommandState::Pending, CommandEvent::Acknowledge) => CommandState::Acknowledged,
            (CommandState::Pending, CommandEvent::Reject) => CommandState::Failed,
            (CommandState::Acknowledged, CommandEvent::Dispatch) => CommandState::Running,
            (CommandState::Acknowledged, CommandEvent::Reject) => CommandState::Failed,
            (CommandState::Running, CommandEvent::Dispatch) => CommandState::Running,
            (CommandState::Running, CommandEvent::OrderSucceeded) => CommandState::Completed,
            (CommandState::Running, CommandEvent::OrderFailed) => CommandState::Failed,
            (from, event) => {
                return Err(BridgeError::StateTransitionFailed {
                    entity_type: "Command".to_string(),
                    entity_id: self.command_id.to_string(),
                    reason: format!("event {event:?} is not valid from state {from:?}"),
                })
            }
        };

        guard.check("Command", self.command_id, self.state, to)?;
        self.state = to;

        let should_notify_running = to == CommandState::Running && !self.running_notified;
        if should_notify_running {
            self.running_notified = true;
        }
        Ok(should_notify_running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, CommandState::Completed | CommandState::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_fsm() -> CommandFsm {
        CommandFsm::new(
            Uuid::new_v4(),
            CommandKind::Standard {
                command_definition_id: Uuid::new_v4(),
            },
        )
    }

    #[test]
    fn happy_path_to_completion() {
        let mut fsm = new_fsm();
        assert!(!fsm.apply(CommandEvent::Acknowledge).unwrap());
        assert_eq!(fsm.state(), CommandState::Acknowledged);

        assert!(fsm.apply(CommandEvent::Dispatch).unwrap());
        assert_eq!(fsm.state(), CommandState::Running);

        assert!(fsm.apply(CommandEvent::OrderSucceeded).unwrap());
        assert_eq!(fsm.state(), CommandState::Completed);
        assert!(fsm.is_terminal());
    }

    #[test]
    fn running_notified_only_once_across_multiple_orders() {
        let mut fsm = new_fsm();
        fsm.apply(CommandEvent::Acknowledge).unwrap();
        assert!(fsm.apply(CommandEvent::Dispatch).unwrap());
        // A second order in the walk re-enters Running; must not fire
        // the PLC notification a second time.
        assert!(!fsm.apply(CommandEvent::Dispatch).unwrap());
    }

    #[test]
    fn rejecting_from_pending_skips_running_entirely() {
        let mut fsm = new_fsm();
        assert!(!fsm.apply(CommandEvent::Reject).unwrap());
        assert_eq!(fsm.state(), CommandState::Failed);
        assert!(fsm.is_terminal());
    }

    #[test]
    fn order_failure_moves_to_failed() {
        let mut fsm = new_fsm();
        fsm.apply(CommandEvent::Acknowledge).unwrap();
        fsm.apply(CommandEvent::Dispatch).unwrap();
        fsm.apply(CommandEvent::OrderFailed).unwrap();
        assert_eq!(fsm.state(), CommandState::Failed);
    }

    #[test]
    fn illegal_event_from_terminal_state_is_rejected() {
        let mut fsm = new_fsm();
        fsm.apply(CommandEvent::Acknowledge).unwrap();
        fsm.apply(CommandEvent::Dispatch).unwrap();
        fsm.apply(CommandEvent::OrderSucceeded).unwrap();
        assert!(fsm.apply(CommandEvent::Acknowledge).is_err());
    }
}
