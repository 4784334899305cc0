//! C7 — the process-wide front door: owns the live `CommandFsm` table,
//! applies the single-command exclusivity policy, and can fail every
//! in-flight command when the robot connection drops.

use dashmap::DashMap;
use uuid::Uuid;

use bridge_shared::errors::{BridgeError, BridgeResult};

use crate::command_fsm::{CommandFsm, CommandKind};

/// When `exclusive_standard_commands` is set, only one standard command
/// (as opposed to direct actions, which always bypass this check) may be
/// `Running` at a time. This matches the teacher's single-task-in-flight
/// guard used for exclusive task types.
pub struct Coordinator {
    fsms: DashMap<Uuid, CommandFsm>,
    exclusive_standard_commands: bool,
}

impl Coordinator {
    pub fn new(exclusive_standard_commands: bool) -> Self {
        Self {
            fsms: DashMap::new(),
            exclusive_standard_commands,
        }
    }

    fn has_running_standard_command(&self) -> bool {
        self.fsms.iter().any(|entry| {
            matches!(entry.value().kind(), CommandKind::Standard { .. })
                && matches!(
                    entry.value().state(),
                    crate::command_fsm::CommandState::Running
                        | crate::command_fsm::CommandState::Acknowledged
                )
        })
    }

    /// Admits a new command into the table, subject to the exclusivity
    /// policy. Direct actions are never blocked by it.
    pub fn admit(&self, command_id: Uuid, kind: CommandKind) -> BridgeResult<()> {
        if self.exclusive_standard_commands
            && matches!(kind, CommandKind::Standard { .. })
            && self.has_running_standard_command()
        {
            return Err(BridgeError::Rejected(
                "another standard command is already in flight".to_string(),
            ));
        }

        self.fsms.insert(command_id, CommandFsm::new(command_id, kind));
        Ok(())
    }

    pub fn with_fsm<R>(&self, command_id: Uuid, f: impl FnOnce(&mut CommandFsm) -> R) -> Option<R> {
        self.fsms.get_mut(&command_id).map(|mut entry| f(entry.value_mut()))
    }

    pub fn remove_terminal(&self, command_id: Uuid) {
        if let Some(entry) = self.fsms.get(&command_id) {
            if entry.is_terminal() {
                drop(entry);
                self.fsms.remove(&command_id);
            }
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.fsms.len()
    }

    /// Called when the robot reports `OFFLINE`/`CONNECTIONBROKEN`: every
    /// command that is not already terminal gets forced to `Failed` so
    /// the PLC is not left waiting forever.
    pub fn fail_all_processing_commands(&self) -> Vec<Uuid> {
        let mut failed = Vec::new();
        for mut entry in self.fsms.iter_mut() {
            if !entry.value().is_terminal() {
                let id = *entry.key();
                let kind = entry.value().kind();
                *entry.value_mut() = {
                    let mut fsm = CommandFsm::new(id, kind);
                    // Walk the fsm through to a terminal Failed state
                    // regardless of where it currently sits, since the
                    // only outbound signal we need is "this is now
                    // failed", not a faithful event replay.
                    let _ = fsm.apply(crate::command_fsm::CommandEvent::Acknowledge);
                    let _ = fsm.apply(crate::command_fsm::CommandEvent::Dispatch);
                    let _ = fsm.apply(crate::command_fsm::CommandEvent::OrderFailed);
                    fsm
                };
                failed.push(id);
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusivity_rejects_second_standard_command_while_first_in_flight() {
        let coordinator = Coordinator::new(true);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        coordinator
            .admit(
                first,
                CommandKind::Standard {
                    command_definition_id: Uuid::new_v4(),
                },
            )
            .unwrap();

        let result = coordinator.admit(
            second,
            CommandKind::Standard {
                command_definition_id: Uuid::new_v4(),
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn direct_actions_bypass_exclusivity() {
        let coordinator = Coordinator::new(true);
        coordinator
            .admit(
                Uuid::new_v4(),
                CommandKind::Standard {
                    command_definition_id: Uuid::new_v4(),
                },
            )
            .unwrap();

        assert!(coordinator.admit(Uuid::new_v4(), CommandKind::DirectAction).is_ok());
    }

    #[test]
    fn terminal_commands_no_longer_block_exclusivity() {
        let coordinator = Coordinator::new(true);
        let id = Uuid::new_v4();
        coordinator
            .admit(
                id,
                CommandKind::Standard {
                    command_definition_id: Uuid::new_v4(),
                },
            )
            .unwrap();

        coordinator.with_fsm(id, |fsm| {
            fsm.apply(crate::command_fsm::CommandEvent::Acknowledge).unwrap();
            fsm.apply(crate::command_fsm::CommandEvent::Dispatch).unwrap();
            fsm.apply(crate::command_fsm::CommandEvent::OrderSucceeded).unwrap();
        });
        coordinator.remove_terminal(id);

        assert!(coordinator
            .admit(
                Uuid::new_v4(),
                CommandKind::Standard {
                    command_definition_id: Uuid::new_v4(),
                },
            )
            .is_ok());
    }

    #[test]
    fn fail_all_processing_marks_every_non_terminal_command_failed() {
        let coordinator = Coordinator::new(false);
        let id = Uuid::new_v4();
        coordinator.admit(id, CommandKind::DirectAction).unwrap();

        let failed = coordinator.fail_all_processing_commands();
        assert_eq!(failed, vec![id]);
        coordinator.with_fsm(id, |fsm| {
            assert!(fsm.is_terminal());
        });
    }
}
