//! Binary entrypoint. Wires the concrete Postgres/Redis/MQTT adapters
//! into `BridgeEngine` and runs the top-level event loop: PLC command
//! lines in, robot state/connection events in, graceful shutdown on
//! `SIGINT` or an internal cancellation.
//!
//! Exit codes follow the teacher's own service binaries: `0` on a clean
//! shutdown, non-zero if startup itself fails (bad config, unreachable
//! database/cache/broker).

mod adapters;
mod db;
mod health;
mod telemetry;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use adapters::mqtt::{MqttAdapter, RobotEvent};
use adapters::postgres_store::PostgresCommandStore;
use adapters::redis_cache::RedisActionStateCache;

use bridge_core::engine::{BridgeEngine, EngineConfig};
use bridge_shared::config::BridgeConfig;
use bridge_shared::messaging::{
    ActionStateCache, CommandStore, PlcResponder, RobotConnectionWatcher, RobotPublisher,
};
use bridge_shared::resilience::CircuitBreaker;

const MQTT_FAILURE_THRESHOLD: u32 = 5;
const MQTT_RESET_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Parser, Debug)]
#[command(name = "bridge-service", about = "PLC/VDA5050 robot order bridge")]
struct Cli {
    /// Emit structured JSON logs instead of plain text (suited to log
    /// aggregation in a deployed environment).
    #[arg(long, env = "BRIDGE_JSON_LOGS", default_value_t = false)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match BridgeConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    telemetry::init(&config.log_level, cli.json_logs);

    match run(config).await {
        Ok(()) => {
            info!("bridge shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "bridge exited with an unrecoverable startup error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    let pool = db::connect(&config.database_url).await?;
    db::migrate(&pool).await?;
    info!("database migrations applied");

    let store: Arc<dyn CommandStore> = Arc::new(PostgresCommandStore::new(pool));

    let cache: Arc<dyn ActionStateCache> = Arc::new(RedisActionStateCache::connect(&config.redis_url).await?);
    info!("redis connection established");

    let breaker = Arc::new(CircuitBreaker::new(
        "mqtt",
        MQTT_FAILURE_THRESHOLD,
        MQTT_RESET_TIMEOUT,
    ));
    let (mqtt_adapter, mut robot_events) = MqttAdapter::connect(
        &config.mqtt_broker_url,
        config.mqtt_username.as_deref(),
        config.mqtt_password.as_deref(),
        &format!("bridge-{}-{}", config.robot_manufacturer, config.robot_serial),
        config.order_topic(),
        config.instant_actions_topic(),
        config.state_topic(),
        config.connection_topic(),
        config.plc_command_topic.clone(),
        config.plc_response_topic.clone(),
        breaker,
    )
    .await?;
    let mqtt_adapter = Arc::new(mqtt_adapter);
    let publisher: Arc<dyn RobotPublisher> = mqtt_adapter.clone();
    let connection_watcher: Arc<dyn RobotConnectionWatcher> = mqtt_adapter.clone();
    let plc_responder: Arc<dyn PlcResponder> = mqtt_adapter;
    info!(broker = %config.mqtt_broker_url, "mqtt connected");

    let cancellation = CancellationToken::new();

    let engine = Arc::new(BridgeEngine::new(
        store,
        cache,
        publisher,
        plc_responder,
        connection_watcher.clone(),
        EngineConfig {
            manufacturer: config.robot_manufacturer.clone(),
            serial_number: config.robot_serial.clone(),
            step_timeout: config.step_timeout(),
            exclusive_standard_commands: config.exclusive_standard_commands,
        },
    ));

    let health_listener = TcpListener::bind(HEALTH_BIND_ADDR).await?;
    let health_router = health::router(connection_watcher);
    let health_cancellation = cancellation.clone();
    let health_task = tokio::spawn(async move {
        let server = axum::serve(health_listener, health_router);
        tokio::select! {
            result = server => {
                if let Err(e) = result {
                    error!(error = %e, "health server exited unexpectedly");
                }
            }
            _ = health_cancellation.cancelled() => {}
        }
    });
    info!(addr = HEALTH_BIND_ADDR, "health endpoint bound");

    loop {
        tokio::select! {
            event = robot_events.recv() => {
                match event {
                    Some(RobotEvent::PlcLine(line)) => {
                        if let Err(e) = engine.handle_plc_line(&line).await {
                            warn!(error = %e, %line, "failed to handle plc line");
                        }
                    }
                    Some(RobotEvent::State(state)) => {
                        if let Err(e) = engine.handle_robot_state(state).await {
                            warn!(error = %e, "failed to fold robot state frame");
                        }
                    }
                    Some(RobotEvent::ConnectionChanged(true)) => {
                        info!("robot connection online");
                    }
                    Some(RobotEvent::ConnectionChanged(false)) => {
                        warn!("robot connection lost, failing all in-flight commands");
                        if let Err(e) = engine.handle_connection_lost().await {
                            error!(error = %e, "failed to wind down in-flight commands after connection loss");
                        }
                    }
                    None => {
                        warn!("robot event channel closed, shutting down");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    cancellation.cancel();
    let _ = health_task.await;
    info!(in_flight = engine.in_flight_command_count(), "bridge stopped accepting new work");

    Ok(())
}
