//! MQTT adapter: publishes `order`/`instantActions` to the robot and
//! watches `state`/`connection` for incoming status, matching the
//! teacher's circuit-breaker-wrapped publish path in
//! `MessageClient::with_breaker`. Also carries the PLC side of the
//! bridge — ingress/egress are topics on the same broker (§6), not a
//! separate transport, so one client handles both halves.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use bridge_shared::errors::{BridgeError, BridgeResult};
use bridge_shared::messaging::{
    ConnectionWire, InstantActionsWire, OrderWire, PlcResponder, RobotConnectionWatcher,
    RobotPublisher, StateWire,
};
use bridge_shared::resilience::{backoff_delay, CircuitBreakerBehavior};

const RECONNECT_BACKOFF_BASE: Duration = Duration::from_millis(500);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Inbound events the rest of the service reacts to: a line from the PLC,
/// a `state` frame (new action statuses to fold into the active step), or
/// a connection-state change (drives
/// `Coordinator::fail_all_processing_commands`).
#[derive(Debug, Clone)]
pub enum RobotEvent {
    PlcLine(String),
    State(StateWire),
    ConnectionChanged(bool),
}

pub struct MqttAdapter {
    client: AsyncClient,
    order_topic: String,
    instant_actions_topic: String,
    plc_response_topic: String,
    online: Arc<AtomicBool>,
    breaker: Arc<dyn CircuitBreakerBehavior>,
}

impl MqttAdapter {
    /// Connects, subscribes to the PLC command topic plus the robot's
    /// `state`/`connection` topics, and spawns the event loop driver.
    /// Returns the adapter plus a receiver for events the main loop folds
    /// into the running engine.
    #[allow(clippy::too_many_arguments)]
    pub async fn connect(
        broker_url: &str,
        username: Option<&str>,
        password: Option<&str>,
        client_id: &str,
        order_topic: String,
        instant_actions_topic: String,
        state_topic: String,
        connection_topic: String,
        plc_command_topic: String,
        plc_response_topic: String,
        breaker: Arc<dyn CircuitBreakerBehavior>,
    ) -> BridgeResult<(Self, mpsc::Receiver<RobotEvent>)> {
        let mut opts = MqttOptions::parse_url(format!("{broker_url}?client_id={client_id}"))
            .map_err(|e| BridgeError::MessagingError(format!("invalid broker url: {e}")))?;
        opts.set_keep_alive(Duration::from_secs(30));
        if let (Some(u), Some(p)) = (username, password) {
            opts.set_credentials(u, p);
        }

        let (client, mut eventloop) = AsyncClient::new(opts, 64);
        client
            .subscribe(&state_topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| BridgeError::MessagingError(e.to_string()))?;
        client
            .subscribe(&connection_topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| BridgeError::MessagingError(e.to_string()))?;
        client
            .subscribe(&plc_command_topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| BridgeError::MessagingError(e.to_string()))?;

        let online = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(256);

        let state_topic_for_loop = state_topic.clone();
        let connection_topic_for_loop = connection_topic.clone();
        let plc_command_topic_for_loop = plc_command_topic.clone();
        let online_for_loop = online.clone();

        tokio::spawn(async move {
            let mut reconnect_attempt: u32 = 0;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        reconnect_attempt = 0;
                        if publish.topic == plc_command_topic_for_loop {
                            match std::str::from_utf8(&publish.payload) {
                                Ok(line) => {
                                    if tx
                                        .send(RobotEvent::PlcLine(line.trim().to_string()))
                                        .await
                                        .is_err()
                                    {
                                        break;
                                    }
                                }
                                Err(e) => warn!(error = %e, "plc command payload was not utf-8"),
                            }
                        } else if publish.topic == state_topic_for_loop {
                            match serde_json::from_slice::<StateWire>(&publish.payload) {
                                Ok(state) => {
                                    if tx.send(RobotEvent::State(state)).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => warn!(error = %e, "failed to decode state frame"),
                            }
                        } else if publish.topic == connection_topic_for_loop {
                            match serde_json::from_slice::<ConnectionWire>(&publish.payload) {
                                Ok(conn) => {
                                    let now_online = conn.connection_state
                                        == bridge_shared::messaging::ConnectionStateWire::Online;
                                    online_for_loop.store(now_online, Ordering::SeqCst);
                                    if tx
                                        .send(RobotEvent::ConnectionChanged(now_online))
                                        .await
                                        .is_err()
                                    {
                                        break;
                                    }
                                }
                                Err(e) => warn!(error = %e, "failed to decode connection frame"),
                            }
                        }
                    }
                    Ok(_) => {
                        reconnect_attempt = 0;
                    }
                    Err(e) => {
                        let delay = backoff_delay(
                            reconnect_attempt,
                            RECONNECT_BACKOFF_BASE,
                            RECONNECT_BACKOFF_MAX,
                        );
                        error!(error = %e, delay_ms = delay.as_millis(), "mqtt event loop error, backing off");
                        reconnect_attempt = reconnect_attempt.saturating_add(1);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        });

        Ok((
            Self {
                client,
                order_topic,
                instant_actions_topic,
                plc_response_topic,
                online,
                breaker,
            },
            rx,
        ))
    }
}

#[async_trait]
impl RobotPublisher for MqttAdapter {
    async fn publish_order(&self, order: &OrderWire) -> BridgeResult<()> {
        if !self.breaker.should_allow() {
            return Err(BridgeError::DependencyUnavailable {
                dependency: "mqtt".to_string(),
                reason: "circuit open".to_string(),
            });
        }

        let payload = serde_json::to_vec(order)
            .map_err(|e| BridgeError::MessagingError(format!("encode order: {e}")))?;

        let start = std::time::Instant::now();
        let result = self
            .client
            .publish(&self.order_topic, QoS::AtLeastOnce, false, payload)
            .await;

        match result {
            Ok(()) => {
                debug!(order_id = %order.order_id, elapsed_ms = start.elapsed().as_millis(), "published order");
                self.breaker.record_success();
                Ok(())
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(BridgeError::MessagingError(format!("publish order: {e}")))
            }
        }
    }

    async fn publish_instant_actions(&self, actions: &InstantActionsWire) -> BridgeResult<()> {
        if !self.breaker.should_allow() {
            return Err(BridgeError::DependencyUnavailable {
                dependency: "mqtt".to_string(),
                reason: "circuit open".to_string(),
            });
        }

        let payload = serde_json::to_vec(actions)
            .map_err(|e| BridgeError::MessagingError(format!("encode instant actions: {e}")))?;

        let result = self
            .client
            .publish(&self.instant_actions_topic, QoS::AtLeastOnce, false, payload)
            .await;

        match result {
            Ok(()) => {
                self.breaker.record_success();
                Ok(())
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(BridgeError::MessagingError(format!(
                    "publish instant actions: {e}"
                )))
            }
        }
    }
}

#[async_trait]
impl PlcResponder for MqttAdapter {
    async fn send_response(&self, line: String) -> BridgeResult<()> {
        self.client
            .publish(&self.plc_response_topic, QoS::AtLeastOnce, false, line.into_bytes())
            .await
            .map_err(|e| BridgeError::MessagingError(format!("plc response publish: {e}")))
    }
}

impl RobotConnectionWatcher for MqttAdapter {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
