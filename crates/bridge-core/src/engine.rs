//! Composes C1-C7 into the single entry point `bridge-service` drives:
//! one PLC line in, zero or more MQTT publishes and PLC response lines
//! out. This is the seam the teacher would call the orchestration
//! service's top-level dispatcher — everything below it is pure logic,
//! everything above it is transport.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

use bridge_shared::errors::{BridgeError, BridgeResult};
use bridge_shared::messaging::{
    ActionStateCache, CommandStore, PlcResponder, RobotConnectionWatcher, RobotPublisher,
    StateWire,
};
use bridge_shared::models::{
    Command, CommandExecution, CommandExecutionStatus, CommandStatus, OrderExecution,
    OrderExecutionStatus, PendingDirectCommand, StepExecution, StepExecutionStatus,
};

use crate::command_codec::{CommandCodec, ParsedCommand, PlcLetter};
use crate::command_fsm::{CommandEvent, CommandKind};
use crate::coordinator::Coordinator;
use crate::order_builder::{generate_order_id, HeaderIdSequence, OrderBuilder};
use crate::step_manager::{build_step_runtimes, StepManager, StepManagerEvent};
use crate::workflow_executor::{WorkflowExecutor, WorkflowOutcome};

/// Reserved PLC token for `CancelAllRunningOrders` (spec §4.5). Never
/// looked up in `command_definitions`; handled entirely in-engine.
const CANCEL_ALL_TOKEN: &str = "OC";

pub struct EngineConfig {
    pub manufacturer: String,
    pub serial_number: String,
    pub step_timeout: Duration,
    pub exclusive_standard_commands: bool,
}

/// Runtime bookkeeping for one order currently in flight: which command
/// it belongs to, the mapping that produced it, and its step manager.
struct ActiveOrder {
    command_id: Uuid,
    command_execution_id: Uuid,
    order_execution_id: Uuid,
    command_definition_id: Option<Uuid>,
    execution_order: i32,
    plc_token: String,
    step_manager: StepManager,
}

pub struct BridgeEngine {
    store: Arc<dyn CommandStore>,
    cache: Arc<dyn ActionStateCache>,
    publisher: Arc<dyn RobotPublisher>,
    responder: Arc<dyn PlcResponder>,
    connection_watcher: Arc<dyn RobotConnectionWatcher>,
    coordinator: Coordinator,
    header_ids: HeaderIdSequence,
    config: EngineConfig,
    active_orders: DashMap<String, ActiveOrder>,
    plc_tokens: DashMap<Uuid, String>,
}

impl BridgeEngine {
    pub fn new(
        store: Arc<dyn CommandStore>,
        cache: Arc<dyn ActionStateCache>,
        publisher: Arc<dyn RobotPublisher>,
        responder: Arc<dyn PlcResponder>,
        connection_watcher: Arc<dyn RobotConnectionWatcher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            coordinator: Coordinator::new(config.exclusive_standard_commands),
            store,
            cache,
            publisher,
            responder,
            connection_watcher,
            header_ids: HeaderIdSequence::new(),
            config,
            active_orders: DashMap::new(),
            plc_tokens: DashMap::new(),
        }
    }

    pub async fn handle_plc_line(&self, line: &str) -> BridgeResult<()> {
        let parsed = match CommandCodec::parse_payload(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(line, error = %e, "rejecting malformed PLC line");
                return Err(e);
            }
        };

        // §4.7: a command line is rejected immediately, before any Command
        // row exists, if the robot is not currently ONLINE.
        if !self.connection_watcher.is_online() {
            self.responder
                .send_response(CommandCodec::format_response(
                    parsed.base_token(),
                    PlcLetter::Failure,
                ))
                .await?;
            return Err(BridgeError::RobotOffline);
        }

        if let ParsedCommand::Standard(token) = &parsed {
            if token == CANCEL_ALL_TOKEN {
                return self.handle_cancel_all(token).await;
            }
        }

        match &parsed {
            ParsedCommand::Standard(token) => self.handle_standard_command(token).await,
            ParsedCommand::DirectAction { base, kind } => {
                self.handle_direct_action(base, *kind, line.trim()).await
            }
        }
    }

    async fn handle_standard_command(&self, token: &str) -> BridgeResult<()> {
        let definition = self.store.load_command_definition(token).await?;

        // The Command row is created unconditionally, before any
        // terminal branch, so every token — known, unknown, or inactive —
        // ends with exactly one Command row and one PLC response (§8
        // invariant #1). `load_command_definition` is a pure read, so
        // ordering it before the write costs nothing.
        let command_id = Uuid::new_v4();
        let command = Command {
            command_id,
            command_definition_id: definition.as_ref().map(|d| d.command_definition_id),
            raw_payload: token.to_string(),
            status: CommandStatus::Pending,
            requested_at: Utc::now(),
            responded_at: None,
            error_message: None,
        };
        self.store.create_command(&command).await?;
        self.plc_tokens.insert(command_id, token.to_string());

        let definition = match definition {
            Some(definition) if definition.active => definition,
            Some(_) => {
                self.store
                    .transition_command(
                        command_id,
                        CommandStatus::Rejected,
                        Some(format!("command definition {token} is inactive")),
                    )
                    .await?;
                self.plc_tokens.remove(&command_id);
                self.responder
                    .send_response(CommandCodec::format_response(token, PlcLetter::Rejected))
                    .await?;
                return Err(BridgeError::Rejected(format!(
                    "command definition {token} is inactive"
                )));
            }
            None => {
                self.store
                    .transition_command(
                        command_id,
                        CommandStatus::Failure,
                        Some("not defined or inactive".to_string()),
                    )
                    .await?;
                self.plc_tokens.remove(&command_id);
                self.responder
                    .send_response(CommandCodec::format_response(token, PlcLetter::Failure))
                    .await?;
                return Err(BridgeError::UnknownCommand {
                    token: token.to_string(),
                });
            }
        };

        if let Err(e) = self.coordinator.admit(
            command_id,
            CommandKind::Standard {
                command_definition_id: definition.command_definition_id,
            },
        ) {
            self.store
                .transition_command(command_id, CommandStatus::Rejected, Some(e.to_string()))
                .await?;
            self.responder
                .send_response(CommandCodec::format_response(token, PlcLetter::Rejected))
                .await?;
            return Err(e);
        }

        let _ = self
            .coordinator
            .with_fsm(command_id, |fsm| fsm.apply(CommandEvent::Acknowledge));
        self.store
            .transition_command(command_id, CommandStatus::Running, None)
            .await?;
        self.responder
            .send_response(CommandCodec::format_response(token, PlcLetter::Acknowledged))
            .await?;

        let command_execution_id = Uuid::new_v4();
        let command_execution = CommandExecution {
            command_execution_id,
            command_id,
            status: CommandExecutionStatus::Running,
            current_order_index: 1,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.store.create_command_execution(&command_execution).await?;

        self.dispatch_order_for_command(
            command_id,
            command_execution_id,
            Some(definition.command_definition_id),
            1,
            token,
        )
        .await
    }

    async fn handle_direct_action(
        &self,
        token: &str,
        kind: crate::command_codec::DirectActionKind,
        full_command: &str,
    ) -> BridgeResult<()> {
        let command_id = Uuid::new_v4();
        let command = Command {
            command_id,
            command_definition_id: None,
            raw_payload: token.to_string(),
            status: CommandStatus::Pending,
            requested_at: Utc::now(),
            responded_at: None,
            error_message: None,
        };
        self.store.create_command(&command).await?;
        self.plc_tokens.insert(command_id, full_command.to_string());
        self.coordinator
            .admit(command_id, CommandKind::DirectAction)?;
        let _ = self
            .coordinator
            .with_fsm(command_id, |fsm| fsm.apply(CommandEvent::Acknowledge));
        self.responder
            .send_response(CommandCodec::format_response(
                full_command,
                PlcLetter::Acknowledged,
            ))
            .await?;

        let command_execution_id = Uuid::new_v4();
        let command_execution = CommandExecution {
            command_execution_id,
            command_id,
            status: CommandExecutionStatus::Running,
            current_order_index: 1,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.store.create_command_execution(&command_execution).await?;

        let order_id = generate_order_id();
        let builder = OrderBuilder::new(
            &self.header_ids,
            self.config.manufacturer.clone(),
            self.config.serial_number.clone(),
        );
        let order = builder.build_direct_action_order(&order_id, kind);

        self.store_pending_direct_command(order_id.clone(), full_command.to_string())
            .await?;

        let expected_action_count = order.nodes[0].actions.len() as u32;
        let step_execution_id = Uuid::new_v4();
        let order_execution_id = Uuid::new_v4();
        let order_execution = OrderExecution {
            order_execution_id,
            command_execution_id,
            template_id: None,
            order_id: order_id.clone(),
            execution_order: 1,
            current_step: 1,
            status: OrderExecutionStatus::Running,
            created_at: Utc::now(),
            finished_at: None,
        };
        self.store.create_order_execution(&order_execution).await?;

        let step_execution = StepExecution {
            step_execution_id,
            order_execution_id,
            step_order: 1,
            status: StepExecutionStatus::Running,
            expected_action_count,
            sent_to_robot: true,
            result: None,
            error_message: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.store.create_step_execution(&step_execution).await?;

        let action_ids: Vec<String> = order.nodes[0]
            .actions
            .iter()
            .map(|a| a.action_id.clone())
            .collect();
        let mut action_ids_by_step = std::collections::HashMap::new();
        action_ids_by_step.insert(1, action_ids);
        let mut step_meta_by_step = std::collections::HashMap::new();
        step_meta_by_step.insert(1, (true, None));
        let step_manager = StepManager::new(
            order_execution_id,
            build_step_runtimes(
                &[step_execution],
                &action_ids_by_step,
                &step_meta_by_step,
                self.config.step_timeout,
            ),
        );

        self.active_orders.insert(
            order_id.clone(),
            ActiveOrder {
                command_id,
                command_execution_id,
                order_execution_id,
                command_definition_id: None,
                execution_order: 1,
                plc_token: full_command.to_string(),
                step_manager,
            },
        );

        self.publisher.publish_order(&order).await?;

        let notify_running = self
            .coordinator
            .with_fsm(command_id, |fsm| fsm.apply(CommandEvent::Dispatch))
            .and_then(Result::ok)
            .unwrap_or(false);
        if notify_running {
            self.responder
                .send_response(CommandCodec::format_response(
                    full_command,
                    PlcLetter::Running,
                ))
                .await?;
        }

        self.drain_fire_and_forget_steps(&order_id).await?;

        Ok(())
    }

    async fn dispatch_order_for_command(
        &self,
        command_id: Uuid,
        command_execution_id: Uuid,
        command_definition_id: Option<Uuid>,
        execution_order: i32,
        plc_token: &str,
    ) -> BridgeResult<()> {
        let command_definition_id = command_definition_id.ok_or_else(|| {
            BridgeError::InvalidFormat("standard command missing definition id".to_string())
        })?;

        let executor = WorkflowExecutor::new(self.store.as_ref(), command_definition_id);
        let mapping = executor.load_order(execution_order).await?;
        let template = self.store.load_order_template(mapping.template_id).await?;

        let order_id = generate_order_id();
        let builder = OrderBuilder::new(
            &self.header_ids,
            self.config.manufacturer.clone(),
            self.config.serial_number.clone(),
        );
        let order = builder.build_standard_order(&template, &order_id);

        let order_execution_id = Uuid::new_v4();
        let order_execution = OrderExecution {
            order_execution_id,
            command_execution_id,
            template_id: Some(mapping.template_id),
            order_id: order_id.clone(),
            execution_order,
            current_step: 1,
            status: OrderExecutionStatus::Running,
            created_at: Utc::now(),
            finished_at: None,
        };
        self.store.create_order_execution(&order_execution).await?;

        let mut step_executions = Vec::with_capacity(template.steps.len());
        let mut action_ids_by_step = std::collections::HashMap::new();
        let mut step_meta_by_step = std::collections::HashMap::new();
        for (step, node) in template.steps.iter().zip(order.nodes.iter()) {
            let step_execution_id = Uuid::new_v4();
            let expected_action_count = node.actions.len() as u32;
            step_executions.push(StepExecution {
                step_execution_id,
                order_execution_id,
                step_order: step.step_order,
                status: StepExecutionStatus::Pending,
                expected_action_count,
                sent_to_robot: true,
                result: None,
                error_message: None,
                started_at: Utc::now(),
                finished_at: None,
            });
            action_ids_by_step.insert(
                step.step_order,
                node.actions.iter().map(|a| a.action_id.clone()).collect(),
            );
            step_meta_by_step.insert(
                step.step_order,
                (
                    step.wait_for_completion,
                    step.timeout_seconds.map(Duration::from_secs),
                ),
            );
        }
        for step in &step_executions {
            self.store.create_step_execution(step).await?;
        }

        let step_manager = StepManager::new(
            order_execution_id,
            build_step_runtimes(
                &step_executions,
                &action_ids_by_step,
                &step_meta_by_step,
                self.config.step_timeout,
            ),
        );

        self.active_orders.insert(
            order_id.clone(),
            ActiveOrder {
                command_id,
                command_execution_id,
                order_execution_id,
                command_definition_id: Some(command_definition_id),
                execution_order,
                plc_token: plc_token.to_string(),
                step_manager,
            },
        );

        self.publisher.publish_order(&order).await?;

        let notify_running = self
            .coordinator
            .with_fsm(command_id, |fsm| fsm.apply(CommandEvent::Dispatch))
            .and_then(Result::ok)
            .unwrap_or(false);
        if notify_running {
            self.responder
                .send_response(CommandCodec::format_response(plc_token, PlcLetter::Running))
                .await?;
        }

        self.drain_fire_and_forget_steps(&order_id).await?;

        Ok(())
    }

    /// Resolves a leading run of `wait_for_completion = false` steps
    /// (§4.4 step 5) right after dispatch, without waiting for any robot
    /// `state` frame. Mirrors the step-finish/advance logic in
    /// `handle_robot_state`'s `StepSucceeded` branch; stops as soon as the
    /// current step wants to wait for real feedback, or the order runs out
    /// of steps (in which case `finish_order` has already sent the
    /// terminal PLC response).
    async fn drain_fire_and_forget_steps(&self, order_id: &str) -> BridgeResult<()> {
        loop {
            let step_execution_id = {
                let active = match self.active_orders.get(order_id) {
                    Some(a) => a,
                    None => return Ok(()),
                };
                match active.step_manager.current_step() {
                    Some(step) if !step.wait_for_completion => step.step_execution_id,
                    _ => return Ok(()),
                }
            };

            self.store
                .transition_step_execution(step_execution_id, StepExecutionStatus::Finished, None)
                .await?;

            let advance_event = {
                let mut active = match self.active_orders.get_mut(order_id) {
                    Some(a) => a,
                    None => return Ok(()),
                };
                active.step_manager.advance()
            };

            match advance_event {
                StepManagerEvent::OrderComplete => {
                    self.finish_order(order_id, true).await?;
                    return Ok(());
                }
                _ => {
                    let (order_execution_id, current_step) = {
                        let active = match self.active_orders.get(order_id) {
                            Some(a) => a,
                            None => return Ok(()),
                        };
                        (
                            active.order_execution_id,
                            active
                                .step_manager
                                .current_step()
                                .map(|s| s.step_order)
                                .unwrap_or_default(),
                        )
                    };
                    self.store
                        .transition_order_execution(
                            order_execution_id,
                            OrderExecutionStatus::Running,
                            current_step,
                        )
                        .await?;
                }
            }
        }
    }

    /// Folds one `state` frame's action statuses into whichever active
    /// order it belongs to, advancing or finishing the order's steps as
    /// outcomes resolve.
    pub async fn handle_robot_state(&self, state: StateWire) -> BridgeResult<()> {
        let order_id = state.order_id.clone();

        // Ingestion happens against a short-lived guard only; the guard
        // is dropped before any branch that might remove or re-insert
        // entries for other order ids, since holding it across those
        // operations risks a same-shard deadlock against `active_orders`.
        let event = {
            let Some(mut active) = self.active_orders.get_mut(&order_id) else {
                return Ok(());
            };
            for action_state in &state.action_states {
                active.step_manager.ingest_action_status(
                    &action_state.action_id,
                    action_state.action_status.clone(),
                );
            }
            active.step_manager.poll()
        };

        for action_state in &state.action_states {
            self.cache
                .record_action_status(
                    &order_id,
                    &action_state.action_id,
                    action_state.action_status.clone(),
                )
                .await?;
        }

        match event {
            Some(StepManagerEvent::StepSucceeded) => {
                let (step_execution_id, advance_event) = {
                    let mut active = match self.active_orders.get_mut(&order_id) {
                        Some(a) => a,
                        None => return Ok(()),
                    };
                    let step_execution_id =
                        active.step_manager.current_step().map(|s| s.step_execution_id);
                    (step_execution_id, active.step_manager.advance())
                };
                if let Some(id) = step_execution_id {
                    self.store
                        .transition_step_execution(id, StepExecutionStatus::Finished, None)
                        .await?;
                }
                match advance_event {
                    StepManagerEvent::OrderComplete => {
                        self.finish_order(&order_id, true).await?;
                    }
                    _ => {
                        let (order_execution_id, current_step) = {
                            let active = match self.active_orders.get(&order_id) {
                                Some(a) => a,
                                None => return Ok(()),
                            };
                            (
                                active.order_execution_id,
                                active.step_manager.current_step().map(|s| s.step_order).unwrap_or_default(),
                            )
                        };
                        self.store
                            .transition_order_execution(
                                order_execution_id,
                                OrderExecutionStatus::Running,
                                current_step,
                            )
                            .await?;
                    }
                }
            }
            Some(StepManagerEvent::StepFailed) | Some(StepManagerEvent::StepTimedOut) => {
                self.finish_order(&order_id, false).await?;
            }
            Some(StepManagerEvent::OrderComplete) | None => {}
        }

        Ok(())
    }

    async fn finish_order(&self, order_id: &str, succeeded: bool) -> BridgeResult<()> {
        let Some((_, active)) = self.active_orders.remove(order_id) else {
            return Ok(());
        };
        self.store
            .transition_order_execution(
                active.order_execution_id,
                if succeeded {
                    OrderExecutionStatus::Completed
                } else {
                    OrderExecutionStatus::Failed
                },
                0,
            )
            .await?;
        self.cache.clear_order(order_id).await?;
        if active.command_definition_id.is_none() {
            // Direct actions seed a pending-direct-command record on
            // dispatch (C1's `<base>:I`/`<base>:T` path); clear it now
            // that the order has reached a terminal outcome.
            let _ = self.cache.take_pending_direct_command(order_id).await?;
        }

        let plc_token = active.plc_token.clone();
        let executor = WorkflowExecutor::new(
            self.store.as_ref(),
            active.command_definition_id.unwrap_or_else(Uuid::nil),
        );

        let (event, letter) = if let Some(command_definition_id) = active.command_definition_id {
            let mapping = executor.load_order(active.execution_order).await?;
            let outcome = if succeeded {
                executor.on_order_completed(&mapping)
            } else {
                executor.on_order_failed(&mapping)
            };
            match outcome {
                WorkflowOutcome::CommandSucceeded => (CommandEvent::OrderSucceeded, PlcLetter::Success),
                WorkflowOutcome::CommandFailed => (CommandEvent::OrderFailed, PlcLetter::Failure),
                WorkflowOutcome::Continue { next_execution_order } => {
                    Box::pin(self.dispatch_order_for_command(
                        active.command_id,
                        active.command_execution_id,
                        Some(command_definition_id),
                        next_execution_order,
                        &plc_token,
                    ))
                    .await?;
                    return Ok(());
                }
            }
        } else if succeeded {
            (CommandEvent::OrderSucceeded, PlcLetter::Success)
        } else {
            (CommandEvent::OrderFailed, PlcLetter::Failure)
        };

        let _ = self
            .coordinator
            .with_fsm(active.command_id, |fsm| fsm.apply(event));
        self.coordinator.remove_terminal(active.command_id);
        self.plc_tokens.remove(&active.command_id);

        let final_status = if succeeded {
            CommandStatus::Success
        } else {
            CommandStatus::Failure
        };
        self.store
            .transition_command(active.command_id, final_status, None)
            .await?;
        executor
            .mark_command_execution_finished(active.command_execution_id, succeeded)
            .await?;

        self.responder
            .send_response(CommandCodec::format_response(&plc_token, letter))
            .await?;

        info!(%order_id, succeeded, "order finished");
        Ok(())
    }

    /// Called when the robot reports offline/connection-broken. Every
    /// in-flight command is forced to failure and the PLC is told so.
    pub async fn handle_connection_lost(&self) -> BridgeResult<()> {
        let failed_ids = self.coordinator.fail_all_processing_commands();
        let mut orphaned_order_executions = Vec::new();
        let mut orphaned_order_ids = Vec::new();
        self.active_orders.retain(|order_id, active| {
            if failed_ids.contains(&active.command_id) {
                orphaned_order_executions.push(active.order_execution_id);
                orphaned_order_ids.push(order_id.clone());
                false
            } else {
                true
            }
        });
        if !orphaned_order_executions.is_empty() {
            let executor = WorkflowExecutor::new(self.store.as_ref(), Uuid::nil());
            executor
                .cancel_all_running_orders(&orphaned_order_executions)
                .await?;
        }
        for order_id in &orphaned_order_ids {
            // Harmless no-op for standard-command orders, which never
            // seed a pending-direct-command record in the first place.
            let _ = self.cache.take_pending_direct_command(order_id).await;
        }

        for command_id in failed_ids {
            self.store
                .transition_command(
                    command_id,
                    CommandStatus::Failure,
                    Some("robot connection lost".to_string()),
                )
                .await?;
            let token = self
                .plc_tokens
                .get(&command_id)
                .map(|t| t.clone())
                .unwrap_or_else(|| command_id.to_string());
            self.plc_tokens.remove(&command_id);
            self.responder
                .send_response(CommandCodec::format_response(&token, PlcLetter::Failure))
                .await?;
        }
        Ok(())
    }

    /// Handles the reserved `OC` token: `CancelAllRunningOrders` (§4.5,
    /// scenario S5). Every non-terminal `CommandExecution` is walked to
    /// `Cancelled`, their `OrderExecution`s to `Failed`, one `cancelOrder`
    /// instant action is published, and each cancelled command is told
    /// `F` before `OC` itself is answered `S`.
    async fn handle_cancel_all(&self, token: &str) -> BridgeResult<()> {
        let oc_command_id = Uuid::new_v4();
        let oc_command = Command {
            command_id: oc_command_id,
            command_definition_id: None,
            raw_payload: token.to_string(),
            status: CommandStatus::Pending,
            requested_at: Utc::now(),
            responded_at: None,
            error_message: None,
        };
        self.store.create_command(&oc_command).await?;

        let cancelled_ids = self.coordinator.fail_all_processing_commands();
        let mut orphaned_order_executions = Vec::new();
        let mut orphaned_order_ids = Vec::new();
        let mut orphaned_command_executions = Vec::new();
        self.active_orders.retain(|order_id, active| {
            if cancelled_ids.contains(&active.command_id) {
                orphaned_order_executions.push(active.order_execution_id);
                orphaned_order_ids.push(order_id.clone());
                orphaned_command_executions.push(active.command_execution_id);
                false
            } else {
                true
            }
        });

        if !orphaned_order_executions.is_empty() {
            let executor = WorkflowExecutor::new(self.store.as_ref(), Uuid::nil());
            executor
                .cancel_all_running_orders(&orphaned_order_executions)
                .await?;

            let builder = OrderBuilder::new(
                &self.header_ids,
                self.config.manufacturer.clone(),
                self.config.serial_number.clone(),
            );
            self.publisher
                .publish_instant_actions(&builder.build_cancel_order())
                .await?;
        }
        for order_id in &orphaned_order_ids {
            let _ = self.cache.take_pending_direct_command(order_id).await;
        }

        let mut seen_executions = std::collections::HashSet::new();
        for command_execution_id in orphaned_command_executions {
            if seen_executions.insert(command_execution_id) {
                self.store
                    .transition_command_execution(
                        command_execution_id,
                        CommandExecutionStatus::Cancelled,
                        0,
                    )
                    .await?;
            }
        }

        for command_id in cancelled_ids {
            self.store
                .transition_command(
                    command_id,
                    CommandStatus::Failure,
                    Some("cancelled by OC".to_string()),
                )
                .await?;
            let plc_token = self
                .plc_tokens
                .get(&command_id)
                .map(|t| t.clone())
                .unwrap_or_else(|| command_id.to_string());
            self.plc_tokens.remove(&command_id);
            self.responder
                .send_response(CommandCodec::format_response(&plc_token, PlcLetter::Failure))
                .await?;
        }

        self.store
            .transition_command(oc_command_id, CommandStatus::Success, None)
            .await?;
        self.responder
            .send_response(CommandCodec::format_response(token, PlcLetter::Success))
            .await?;

        Ok(())
    }

    /// Asks the robot to abandon every order tracked for `command_id` via
    /// a `cancelOrder` instant action. The command itself settles through
    /// the normal failure path once the robot's `state` confirms the
    /// cancellation, matching how any other order failure is handled.
    pub async fn cancel_command(&self, command_id: Uuid) -> BridgeResult<()> {
        let has_active_order = self
            .active_orders
            .iter()
            .any(|entry| entry.value().command_id == command_id);

        if !has_active_order {
            return Ok(());
        }

        let builder = OrderBuilder::new(
            &self.header_ids,
            self.config.manufacturer.clone(),
            self.config.serial_number.clone(),
        );
        self.publisher
            .publish_instant_actions(&builder.build_cancel_order())
            .await
    }

    pub async fn store_pending_direct_command(
        &self,
        order_id: String,
        full_command: String,
    ) -> BridgeResult<()> {
        self.cache
            .put_pending_direct_command(&PendingDirectCommand {
                full_command,
                order_id,
                timestamp: Utc::now(),
            })
            .await
    }

    pub fn in_flight_command_count(&self) -> usize {
        self.coordinator.in_flight_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use bridge_shared::messaging::{
        ActionStateWire, ActionStatusWire, InstantActionsWire, OrderWire,
    };
    use bridge_shared::models::{
        ActionParamValue, ActionTemplate, BlockingType, CommandDefinition, CommandOrderMapping,
        OrderStep, OrderTemplate,
    };

    #[derive(Default)]
    struct StubStore {
        definitions: HashMap<String, CommandDefinition>,
        mappings: HashMap<(Uuid, i32), CommandOrderMapping>,
        templates: HashMap<Uuid, OrderTemplate>,
        created_commands: Mutex<Vec<Command>>,
        command_transitions: Mutex<Vec<(Uuid, CommandStatus, Option<String>)>>,
        command_execution_transitions: Mutex<Vec<(Uuid, CommandExecutionStatus, i32)>>,
        order_execution_transitions: Mutex<Vec<(Uuid, OrderExecutionStatus, i32)>>,
    }

    impl StubStore {
        fn created_command_count(&self) -> usize {
            self.created_commands.lock().unwrap().len()
        }

        fn command_transitions_snapshot(&self) -> Vec<(Uuid, CommandStatus, Option<String>)> {
            self.command_transitions.lock().unwrap().clone()
        }

        fn cancelled_command_execution_count(&self) -> usize {
            self.command_execution_transitions
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, status, _)| *status == CommandExecutionStatus::Cancelled)
                .count()
        }
    }

    #[async_trait]
    impl CommandStore for StubStore {
        async fn create_command(&self, command: &Command) -> BridgeResult<()> {
            self.created_commands.lock().unwrap().push(command.clone());
            Ok(())
        }
        async fn transition_command(
            &self,
            command_id: Uuid,
            status: CommandStatus,
            error_message: Option<String>,
        ) -> BridgeResult<()> {
            self.command_transitions
                .lock()
                .unwrap()
                .push((command_id, status, error_message));
            Ok(())
        }
        async fn create_command_execution(&self, _execution: &CommandExecution) -> BridgeResult<()> {
            Ok(())
        }
        async fn transition_command_execution(
            &self,
            command_execution_id: Uuid,
            status: CommandExecutionStatus,
            current_order_index: i32,
        ) -> BridgeResult<()> {
            self.command_execution_transitions.lock().unwrap().push((
                command_execution_id,
                status,
                current_order_index,
            ));
            Ok(())
        }
        async fn create_order_execution(&self, _execution: &OrderExecution) -> BridgeResult<()> {
            Ok(())
        }
        async fn transition_order_execution(
            &self,
            order_execution_id: Uuid,
            status: OrderExecutionStatus,
            current_step: i32,
        ) -> BridgeResult<()> {
            self.order_execution_transitions
                .lock()
                .unwrap()
                .push((order_execution_id, status, current_step));
            Ok(())
        }
        async fn create_step_execution(&self, _execution: &StepExecution) -> BridgeResult<()> {
            Ok(())
        }
        async fn transition_step_execution(
            &self,
            _step_execution_id: Uuid,
            _status: StepExecutionStatus,
            _result: Option<String>,
        ) -> BridgeResult<()> {
            Ok(())
        }
        async fn load_mapping(
            &self,
            command_definition_id: Uuid,
            execution_order: i32,
        ) -> BridgeResult<Option<CommandOrderMapping>> {
            Ok(self
                .mappings
                .get(&(command_definition_id, execution_order))
                .cloned())
        }
        async fn load_command_definition(
            &self,
            command_type: &str,
        ) -> BridgeResult<Option<CommandDefinition>> {
            Ok(self.definitions.get(command_type).cloned())
        }
        async fn load_order_template(&self, template_id: Uuid) -> BridgeResult<OrderTemplate> {
            self.templates
                .get(&template_id)
                .cloned()
                .ok_or_else(|| BridgeError::database("load_order_template", "missing"))
        }
    }

    #[derive(Default)]
    struct StubCache;

    #[async_trait]
    impl ActionStateCache for StubCache {
        async fn put_pending_direct_command(
            &self,
            _cmd: &bridge_shared::models::PendingDirectCommand,
        ) -> BridgeResult<()> {
            Ok(())
        }
        async fn take_pending_direct_command(
            &self,
            _order_id: &str,
        ) -> BridgeResult<Option<bridge_shared::models::PendingDirectCommand>> {
            Ok(None)
        }
        async fn record_action_status(
            &self,
            _order_id: &str,
            _action_id: &str,
            _status: ActionStatusWire,
        ) -> BridgeResult<()> {
            Ok(())
        }
        async fn action_statuses(
            &self,
            _order_id: &str,
        ) -> BridgeResult<Vec<(String, ActionStatusWire)>> {
            Ok(Vec::new())
        }
        async fn clear_order(&self, _order_id: &str) -> BridgeResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        orders: Mutex<Vec<OrderWire>>,
        instant_actions: Mutex<Vec<InstantActionsWire>>,
    }

    #[async_trait]
    impl RobotPublisher for RecordingPublisher {
        async fn publish_order(&self, order: &OrderWire) -> BridgeResult<()> {
            self.orders.lock().unwrap().push(order.clone());
            Ok(())
        }
        async fn publish_instant_actions(&self, actions: &InstantActionsWire) -> BridgeResult<()> {
            self.instant_actions.lock().unwrap().push(actions.clone());
            Ok(())
        }
    }

    /// Toggleable stand-in for the MQTT adapter's connection watcher, so
    /// tests can flip online/offline mid-scenario (S6).
    struct StubConnectionWatcher {
        online: std::sync::atomic::AtomicBool,
    }

    impl StubConnectionWatcher {
        fn new(online: bool) -> Arc<Self> {
            Arc::new(Self {
                online: std::sync::atomic::AtomicBool::new(online),
            })
        }

        fn set_online(&self, online: bool) {
            self.online.store(online, std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl bridge_shared::messaging::RobotConnectionWatcher for StubConnectionWatcher {
        fn is_online(&self) -> bool {
            self.online.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct RecordingResponder {
        lines: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PlcResponder for RecordingResponder {
        async fn send_response(&self, line: String) -> BridgeResult<()> {
            self.lines.lock().unwrap().push(line);
            Ok(())
        }
    }

    fn single_step_template(template_id: Uuid) -> OrderTemplate {
        OrderTemplate {
            template_id,
            name: "dock".to_string(),
            steps: vec![OrderStep {
                step_order: 1,
                node_position: None,
                actions: vec![ActionTemplate {
                    action_type: "startDocking".to_string(),
                    description: "dock at station".to_string(),
                    blocking_type: BlockingType::Hard,
                    execution_order: 1,
                    parameters: HashMap::<String, (String, ActionParamValue)>::new(),
                }],
                wait_for_completion: true,
                timeout_seconds: None,
            }],
        }
    }

    #[tokio::test]
    async fn standard_command_runs_to_success_on_finished_action() {
        let command_definition_id = Uuid::new_v4();
        let template_id = Uuid::new_v4();

        let mut definitions = HashMap::new();
        definitions.insert(
            "DOCK01".to_string(),
            CommandDefinition {
                command_definition_id,
                command_type: "DOCK01".to_string(),
                active: true,
            },
        );
        let mut mappings = HashMap::new();
        mappings.insert(
            (command_definition_id, 1),
            CommandOrderMapping {
                command_definition_id,
                execution_order: 1,
                template_id,
                next_execution_order: 0,
                failure_order: 0,
            },
        );
        let mut templates = HashMap::new();
        templates.insert(template_id, single_step_template(template_id));

        let store: Arc<dyn CommandStore> = Arc::new(StubStore {
            definitions,
            mappings,
            templates,
            ..Default::default()
        });
        let cache: Arc<dyn ActionStateCache> = Arc::new(StubCache);
        let publisher = Arc::new(RecordingPublisher::default());
        let responder = Arc::new(RecordingResponder::default());

        let engine = BridgeEngine::new(
            store,
            cache,
            publisher.clone(),
            responder.clone(),
            StubConnectionWatcher::new(true),
            EngineConfig {
                manufacturer: "Meili".to_string(),
                serial_number: "R001".to_string(),
                step_timeout: Duration::from_secs(30),
                exclusive_standard_commands: true,
            },
        );

        engine.handle_plc_line("DOCK01").await.unwrap();
        assert_eq!(engine.in_flight_command_count(), 1);

        let published = publisher.orders.lock().unwrap().clone();
        assert_eq!(published.len(), 1);
        let order = published[0].clone();
        let action_id = order.nodes[0].actions[0].action_id.clone();

        let responses_so_far = responder.lines.lock().unwrap().clone();
        assert_eq!(responses_so_far, vec!["DOCK01:A", "DOCK01:R"]);

        let state = StateWire {
            header_id: 1,
            timestamp: Utc::now(),
            order_id: order.order_id.clone(),
            last_node_sequence_id: 0,
            action_states: vec![bridge_shared::messaging::ActionStateWire {
                action_id,
                action_type: "startDocking".to_string(),
                action_status: ActionStatusWire::Finished,
                result_description: None,
            }],
        };
        engine.handle_robot_state(state).await.unwrap();

        let final_responses = responder.lines.lock().unwrap().clone();
        assert_eq!(final_responses, vec!["DOCK01:A", "DOCK01:R", "DOCK01:S"]);
        assert_eq!(engine.in_flight_command_count(), 0);
    }

    fn test_config(exclusive_standard_commands: bool) -> EngineConfig {
        EngineConfig {
            manufacturer: "Meili".to_string(),
            serial_number: "R001".to_string(),
            step_timeout: Duration::from_secs(30),
            exclusive_standard_commands,
        }
    }

    fn finished_state(order_id: &str, action_id: String) -> StateWire {
        StateWire {
            header_id: 1,
            timestamp: Utc::now(),
            order_id: order_id.to_string(),
            last_node_sequence_id: 0,
            action_states: vec![ActionStateWire {
                action_id,
                action_type: "doStuff".to_string(),
                action_status: ActionStatusWire::Finished,
                result_description: None,
            }],
        }
    }

    fn failed_state(order_id: &str, action_id: String) -> StateWire {
        StateWire {
            header_id: 1,
            timestamp: Utc::now(),
            order_id: order_id.to_string(),
            last_node_sequence_id: 0,
            action_states: vec![ActionStateWire {
                action_id,
                action_type: "doStuff".to_string(),
                action_status: ActionStatusWire::Failed,
                result_description: None,
            }],
        }
    }

    // S1: an unknown token is rejected with `F`, and still gets exactly
    // one Command row (Failure, "not defined or inactive") — no
    // OrderExecution is ever created since the command never dispatches.
    #[tokio::test]
    async fn unknown_command_token_is_rejected_with_command_row_and_response() {
        let store = Arc::new(StubStore::default());
        let cache: Arc<dyn ActionStateCache> = Arc::new(StubCache);
        let publisher = Arc::new(RecordingPublisher::default());
        let responder = Arc::new(RecordingResponder::default());

        let engine = BridgeEngine::new(
            store.clone(),
            cache,
            publisher.clone(),
            responder.clone(),
            StubConnectionWatcher::new(true),
            test_config(false),
        );

        let result = engine.handle_plc_line("ZZ").await;
        assert!(result.is_err());

        assert_eq!(store.created_command_count(), 1);
        assert_eq!(store.created_commands.lock().unwrap()[0].raw_payload, "ZZ");

        let transitions = store.command_transitions_snapshot();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].1, CommandStatus::Failure);
        assert_eq!(transitions[0].2.as_deref(), Some("not defined or inactive"));

        assert_eq!(responder.lines.lock().unwrap().clone(), vec!["ZZ:F"]);
        assert!(publisher.orders.lock().unwrap().is_empty());
    }

    // S2: a direct inference action succeeds and the response keeps the
    // full original command string, never shortened to the base token.
    #[tokio::test]
    async fn direct_inference_success_keeps_full_command_in_response() {
        let store: Arc<dyn CommandStore> = Arc::new(StubStore::default());
        let cache: Arc<dyn ActionStateCache> = Arc::new(StubCache);
        let publisher = Arc::new(RecordingPublisher::default());
        let responder = Arc::new(RecordingResponder::default());

        let engine = BridgeEngine::new(
            store,
            cache,
            publisher.clone(),
            responder.clone(),
            StubConnectionWatcher::new(true),
            test_config(false),
        );

        engine.handle_plc_line("PART7:I").await.unwrap();
        assert_eq!(
            responder.lines.lock().unwrap().clone(),
            vec!["PART7:I:A", "PART7:I:R"]
        );

        let order = publisher.orders.lock().unwrap()[0].clone();
        let action_id = order.nodes[0].actions[0].action_id.clone();
        engine
            .handle_robot_state(finished_state(&order.order_id, action_id))
            .await
            .unwrap();

        assert_eq!(
            responder.lines.lock().unwrap().clone(),
            vec!["PART7:I:A", "PART7:I:R", "PART7:I:S"]
        );
    }

    // S3: a direct trajectory action with an arm qualifier fails, and the
    // response keeps the full `BASE:T:L` string rather than `BASE:T` or
    // the bare base token.
    #[tokio::test]
    async fn direct_trajectory_failure_keeps_full_command_in_response() {
        let store: Arc<dyn CommandStore> = Arc::new(StubStore::default());
        let cache: Arc<dyn ActionStateCache> = Arc::new(StubCache);
        let publisher = Arc::new(RecordingPublisher::default());
        let responder = Arc::new(RecordingResponder::default());

        let engine = BridgeEngine::new(
            store,
            cache,
            publisher.clone(),
            responder.clone(),
            StubConnectionWatcher::new(true),
            test_config(false),
        );

        engine.handle_plc_line("ARC2:T:L").await.unwrap();
        assert_eq!(
            responder.lines.lock().unwrap().clone(),
            vec!["ARC2:T:L:A", "ARC2:T:L:R"]
        );

        let order = publisher.orders.lock().unwrap()[0].clone();
        let action_id = order.nodes[0].actions[0].action_id.clone();
        engine
            .handle_robot_state(failed_state(&order.order_id, action_id))
            .await
            .unwrap();

        assert_eq!(
            responder.lines.lock().unwrap().clone(),
            vec!["ARC2:T:L:A", "ARC2:T:L:R", "ARC2:T:L:F"]
        );
    }

    // S4: a two-order workflow whose first order fails onto a
    // zero `failure_order` ends the walk there — the second order is
    // never built or dispatched.
    #[tokio::test]
    async fn two_order_workflow_failure_branch_never_dispatches_second_order() {
        let command_definition_id = Uuid::new_v4();
        let template_a = Uuid::new_v4();
        let template_b = Uuid::new_v4();

        let mut definitions = HashMap::new();
        definitions.insert(
            "CR".to_string(),
            CommandDefinition {
                command_definition_id,
                command_type: "CR".to_string(),
                active: true,
            },
        );
        let mut mappings = HashMap::new();
        mappings.insert(
            (command_definition_id, 1),
            CommandOrderMapping {
                command_definition_id,
                execution_order: 1,
                template_id: template_a,
                next_execution_order: 2,
                failure_order: 0,
            },
        );
        mappings.insert(
            (command_definition_id, 2),
            CommandOrderMapping {
                command_definition_id,
                execution_order: 2,
                template_id: template_b,
                next_execution_order: 0,
                failure_order: 0,
            },
        );
        let mut templates = HashMap::new();
        templates.insert(template_a, single_step_template(template_a));
        templates.insert(template_b, single_step_template(template_b));

        let store: Arc<dyn CommandStore> = Arc::new(StubStore {
            definitions,
            mappings,
            templates,
            ..Default::default()
        });
        let cache: Arc<dyn ActionStateCache> = Arc::new(StubCache);
        let publisher = Arc::new(RecordingPublisher::default());
        let responder = Arc::new(RecordingResponder::default());

        let engine = BridgeEngine::new(
            store,
            cache,
            publisher.clone(),
            responder.clone(),
            StubConnectionWatcher::new(true),
            test_config(true),
        );

        engine.handle_plc_line("CR").await.unwrap();
        assert_eq!(publisher.orders.lock().unwrap().len(), 1);

        let order_a = publisher.orders.lock().unwrap()[0].clone();
        let action_id = order_a.nodes[0].actions[0].action_id.clone();
        engine
            .handle_robot_state(failed_state(&order_a.order_id, action_id))
            .await
            .unwrap();

        assert_eq!(
            responder.lines.lock().unwrap().clone(),
            vec!["CR:A", "CR:R", "CR:F"]
        );
        assert_eq!(publisher.orders.lock().unwrap().len(), 1);
    }

    // S5: `OC` cancels every running command, transitioning each
    // CommandExecution to Cancelled, publishing exactly one cancelOrder,
    // answering each cancelled command `F`, and `OC` itself `S`.
    #[tokio::test]
    async fn cancel_all_token_cancels_running_commands_and_answers_success() {
        let store = Arc::new(StubStore::default());
        let cache: Arc<dyn ActionStateCache> = Arc::new(StubCache);
        let publisher = Arc::new(RecordingPublisher::default());
        let responder = Arc::new(RecordingResponder::default());

        let engine = BridgeEngine::new(
            store.clone(),
            cache,
            publisher.clone(),
            responder.clone(),
            StubConnectionWatcher::new(true),
            test_config(false),
        );

        engine.handle_plc_line("PART1:I").await.unwrap();
        engine.handle_plc_line("PART2:I").await.unwrap();
        assert_eq!(engine.in_flight_command_count(), 2);

        engine.handle_plc_line("OC").await.unwrap();

        let lines = responder.lines.lock().unwrap().clone();
        assert!(lines.contains(&"PART1:I:F".to_string()));
        assert!(lines.contains(&"PART2:I:F".to_string()));
        assert_eq!(lines.last().unwrap(), "OC:S");

        assert_eq!(engine.in_flight_command_count(), 0);
        assert_eq!(store.cancelled_command_execution_count(), 2);
        assert_eq!(publisher.instant_actions.lock().unwrap().len(), 1);
    }

    // S6: the robot goes offline mid-step, failing the in-flight command;
    // a subsequent command sent while still offline is rejected
    // immediately with `F` and never creates a Command row.
    #[tokio::test]
    async fn offline_mid_step_fails_command_then_rejects_next_command_while_offline() {
        let command_definition_id = Uuid::new_v4();
        let template_id = Uuid::new_v4();

        let mut definitions = HashMap::new();
        definitions.insert(
            "CR".to_string(),
            CommandDefinition {
                command_definition_id,
                command_type: "CR".to_string(),
                active: true,
            },
        );
        let mut mappings = HashMap::new();
        mappings.insert(
            (command_definition_id, 1),
            CommandOrderMapping {
                command_definition_id,
                execution_order: 1,
                template_id,
                next_execution_order: 0,
                failure_order: 0,
            },
        );
        let mut templates = HashMap::new();
        templates.insert(template_id, single_step_template(template_id));

        let store = Arc::new(StubStore {
            definitions,
            mappings,
            templates,
            ..Default::default()
        });
        let cache: Arc<dyn ActionStateCache> = Arc::new(StubCache);
        let publisher = Arc::new(RecordingPublisher::default());
        let responder = Arc::new(RecordingResponder::default());
        let watcher = StubConnectionWatcher::new(true);

        let engine = BridgeEngine::new(
            store.clone(),
            cache,
            publisher.clone(),
            responder.clone(),
            watcher.clone(),
            test_config(false),
        );

        engine.handle_plc_line("CR").await.unwrap();
        assert_eq!(engine.in_flight_command_count(), 1);

        watcher.set_online(false);
        engine.handle_connection_lost().await.unwrap();

        assert_eq!(engine.in_flight_command_count(), 0);
        assert_eq!(responder.lines.lock().unwrap().last().unwrap(), "CR:F");

        let result = engine.handle_plc_line("CR").await;
        assert!(result.is_err());
        assert_eq!(responder.lines.lock().unwrap().last().unwrap(), "CR:F");

        // The second, offline-rejected `CR` never reaches
        // `handle_standard_command`, so no second Command row is created.
        assert_eq!(store.created_command_count(), 1);
    }
}
