//! C2 — turns an `OrderTemplate` (or a direct action request) into a
//! VDA5050 `order` or `instantActions` payload ready to publish.
//!
//! Header ids are a monotonically increasing counter per bridge process,
//! matching the VDA5050 requirement that the robot can detect gaps and
//! reordering. Order ids are 32 lowercase hex characters, generated fresh
//! per order so that retried orders never collide with an earlier attempt
//! still draining on the robot.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use uuid::Uuid;

use bridge_shared::messaging::{
    ActionParameterWire, ActionStatusWire, ActionWire, BlockingTypeWire, EdgeWire,
    InstantActionsWire, NodeWire, OrderWire,
};
use bridge_shared::models::{ActionParamValue, ActionTemplate, BlockingType, OrderTemplate};

use crate::command_codec::{Arm, DirectActionKind};

/// Monotonic header-id source shared by every order and instantActions
/// message the process emits, so the robot sees a single strictly
/// increasing sequence regardless of which topic a message lands on.
#[derive(Debug, Default)]
pub struct HeaderIdSequence(AtomicU64);

impl HeaderIdSequence {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// 32 lowercase hex characters, matching the convention the robot's fleet
/// manager uses for externally generated order ids.
pub fn generate_order_id() -> String {
    let mut out = String::with_capacity(32);
    for _ in 0..32 {
        let nibble = fastrand::u8(0..16);
        out.push(std::char::from_digit(nibble as u32, 16).unwrap());
    }
    out
}

fn wire_blocking_type(blocking_type: BlockingType) -> BlockingTypeWire {
    match blocking_type {
        BlockingType::None => BlockingTypeWire::None,
        BlockingType::Soft => BlockingTypeWire::Soft,
        BlockingType::Hard => BlockingTypeWire::Hard,
    }
}

fn wire_action_parameter_value(value: &ActionParamValue) -> serde_json::Value {
    match value {
        ActionParamValue::String(s) => serde_json::Value::String(s.clone()),
        // serde_json formats f64-backed numbers with ryu, which always
        // carries a decimal point (`5.0`, never `5`), so no whole-number
        // special case is needed here.
        ActionParamValue::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ActionParamValue::Boolean(b) => serde_json::Value::Bool(*b),
    }
}

fn build_action_wire(template: &ActionTemplate) -> ActionWire {
    let action_parameters = template
        .parameters
        .iter()
        .map(|(key, (_, value))| ActionParameterWire {
            key: key.clone(),
            value: wire_action_parameter_value(value),
        })
        .collect();

    ActionWire {
        action_type: template.action_type.clone(),
        action_id: Uuid::new_v4().to_string(),
        action_description: template.description.clone(),
        blocking_type: wire_blocking_type(template.blocking_type),
        action_parameters,
    }
}

pub struct OrderBuilder<'a> {
    header_ids: &'a HeaderIdSequence,
    manufacturer: String,
    serial_number: String,
}

impl<'a> OrderBuilder<'a> {
    pub fn new(
        header_ids: &'a HeaderIdSequence,
        manufacturer: impl Into<String>,
        serial_number: impl Into<String>,
    ) -> Self {
        Self {
            header_ids,
            manufacturer: manufacturer.into(),
            serial_number: serial_number.into(),
        }
    }

    /// One node per `OrderStep`, each released immediately (the bridge
    /// does not use VDA5050's partial-release horizon), linked by trivial
    /// edges so the order graph stays a single linear chain.
    pub fn build_standard_order(&self, template: &OrderTemplate, order_id: &str) -> OrderWire {
        let mut nodes = Vec::with_capacity(template.steps.len());
        let mut edges = Vec::with_capacity(template.steps.len().saturating_sub(1));

        for step in &template.steps {
            let node_id = format!("{order_id}-node-{}", step.step_order);
            let actions = step.actions.iter().map(build_action_wire).collect();

            nodes.push(NodeWire {
                node_id: node_id.clone(),
                sequence_id: step.step_order as u32 * 2,
                released: true,
                node_position: step.node_position.map(Into::into),
                actions,
            });
        }

        for window in nodes.windows(2) {
            let (start, end) = (&window[0], &window[1]);
            edges.push(EdgeWire {
                edge_id: format!("{}-to-{}", start.node_id, end.node_id),
                sequence_id: start.sequence_id + 1,
                released: true,
                start_node_id: start.node_id.clone(),
                end_node_id: end.node_id.clone(),
                actions: Vec::new(),
            });
        }

        OrderWire {
            header_id: self.header_ids.next(),
            timestamp: Utc::now(),
            version: "2.0.0".to_string(),
            manufacturer: self.manufacturer.clone(),
            serial_number: self.serial_number.clone(),
            order_id: order_id.to_string(),
            order_update_id: 0,
            nodes,
            edges,
        }
    }

    /// Direct actions never touch the node/edge graph: a single-node order
    /// carrying one Roboligent Robin action is sufficient, since the robot
    /// treats `Inference`/`FollowTrajectory` as self-contained behaviors
    /// that complete or fail independent of any path.
    pub fn build_direct_action_order(&self, order_id: &str, kind: DirectActionKind) -> OrderWire {
        let (action_type, mut parameters) = match kind {
            DirectActionKind::Inference => ("startInference".to_string(), Vec::new()),
            DirectActionKind::FollowTrajectory(arm) => {
                let mut params = Vec::new();
                if let Some(arm) = arm {
                    let value = match arm {
                        Arm::Right => "right",
                        Arm::Left => "left",
                    };
                    params.push(ActionParameterWire {
                        key: "arm".to_string(),
                        value: serde_json::Value::String(value.to_string()),
                    });
                }
                ("followTrajectory".to_string(), params)
            }
        };
        parameters.shrink_to_fit();

        let action = ActionWire {
            action_type,
            action_id: Uuid::new_v4().to_string(),
            action_description: "direct action dispatched by PLC".to_string(),
            blocking_type: BlockingTypeWire::Hard,
            action_parameters: parameters,
        };

        let node = NodeWire {
            node_id: format!("{order_id}-node-0"),
            sequence_id: 0,
            released: true,
            node_position: None,
            actions: vec![action],
        };

        OrderWire {
            header_id: self.header_ids.next(),
            timestamp: Utc::now(),
            version: "2.0.0".to_string(),
            manufacturer: self.manufacturer.clone(),
            serial_number: self.serial_number.clone(),
            order_id: order_id.to_string(),
            order_update_id: 0,
            nodes: vec![node],
            edges: Vec::new(),
        }
    }

    pub fn build_cancel_order(&self) -> InstantActionsWire {
        InstantActionsWire {
            header_id: self.header_ids.next(),
            timestamp: Utc::now(),
            version: "2.0.0".to_string(),
            manufacturer: self.manufacturer.clone(),
            serial_number: self.serial_number.clone(),
            actions: vec![ActionWire {
                action_type: "cancelOrder".to_string(),
                action_id: Uuid::new_v4().to_string(),
                action_description: "cancel in-flight order".to_string(),
                blocking_type: BlockingTypeWire::Hard,
                action_parameters: Vec::new(),
            }],
        }
    }
}

/// Used by `ActionStatusAggregator` to decide whether a newly observed
/// status still counts toward a step's outcome, or arrived after the
/// bridge already gave up waiting on it.
pub fn is_terminal_status(status: ActionStatusWire) -> bool {
    matches!(status, ActionStatusWire::Finished | ActionStatusWire::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_shared::models::{NodePosition, OrderStep};
    use std::collections::HashMap;

    fn sample_template() -> OrderTemplate {
        OrderTemplate {
            template_id: Uuid::new_v4(),
            name: "dock".to_string(),
            steps: vec![
                OrderStep {
                    step_order: 1,
                    node_position: Some(NodePosition {
                        x: 1.0,
                        y: 2.0,
                        theta: 0.0,
                        map_id: Uuid::new_v4(),
                    }),
                    actions: vec![],
                    wait_for_completion: true,
                    timeout_seconds: None,
                },
                OrderStep {
                    step_order: 2,
                    node_position: None,
                    actions: vec![],
                    wait_for_completion: true,
                    timeout_seconds: None,
                },
            ],
        }
    }

    #[test]
    fn header_ids_increase_monotonically() {
        let seq = HeaderIdSequence::new();
        assert_eq!(seq.next(), 0);
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
    }

    #[test]
    fn order_id_is_32_hex_chars() {
        let id = generate_order_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn standard_order_has_one_node_per_step_and_linear_edges() {
        let seq = HeaderIdSequence::new();
        let builder = OrderBuilder::new(&seq, "Roboligent", "R2D2");
        let order = builder.build_standard_order(&sample_template(), "abc123");

        assert_eq!(order.nodes.len(), 2);
        assert_eq!(order.edges.len(), 1);
        assert_eq!(order.edges[0].start_node_id, order.nodes[0].node_id);
        assert_eq!(order.edges[0].end_node_id, order.nodes[1].node_id);
    }

    #[test]
    fn direct_action_inference_has_no_arm_parameter() {
        let seq = HeaderIdSequence::new();
        let builder = OrderBuilder::new(&seq, "Roboligent", "R2D2");
        let order = builder.build_direct_action_order("abc123", DirectActionKind::Inference);

        assert_eq!(order.nodes.len(), 1);
        assert!(order.nodes[0].actions[0].action_parameters.is_empty());
    }

    #[test]
    fn direct_action_follow_trajectory_carries_arm_when_given() {
        let seq = HeaderIdSequence::new();
        let builder = OrderBuilder::new(&seq, "Roboligent", "R2D2");
        let order = builder.build_direct_action_order(
            "abc123",
            DirectActionKind::FollowTrajectory(Some(Arm::Left)),
        );

        let params = &order.nodes[0].actions[0].action_parameters;
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].key, "arm");
        assert_eq!(params[0].value, serde_json::Value::String("left".into()));
    }

    #[test]
    fn whole_number_parameters_serialize_as_json_numbers_with_decimal_point() {
        let mut parameters = HashMap::new();
        parameters.insert(
            "speed".to_string(),
            ("number".to_string(), ActionParamValue::Number(5.0)),
        );
        let template = ActionTemplate {
            action_type: "setSpeed".to_string(),
            description: "set speed".to_string(),
            blocking_type: BlockingType::None,
            execution_order: 1,
            parameters,
        };

        let wire = build_action_wire(&template);
        assert_eq!(
            wire.action_parameters[0].value,
            serde_json::Value::Number(serde_json::Number::from_f64(5.0).unwrap())
        );
        assert_eq!(
            serde_json::to_string(&wire.action_parameters[0].value).unwrap(),
            "5.0"
        );
    }
}
