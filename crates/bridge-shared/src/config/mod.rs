//! Bridge configuration, loaded from environment variables (with an
//! optional `.env` file) via the `config` crate, matching the layering the
//! teacher uses for its worker/orchestration configs: typed defaults,
//! `BRIDGE_`-prefixed env overrides, fail-fast on missing required values.

use crate::errors::{BridgeError, BridgeResult};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub database_url: String,
    pub redis_url: String,

    pub mqtt_broker_url: String,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,

    pub robot_manufacturer: String,
    pub robot_serial: String,

    #[serde(default = "default_plc_command_topic")]
    pub plc_command_topic: String,
    #[serde(default = "default_plc_response_topic")]
    pub plc_response_topic: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_step_timeout_seconds")]
    pub step_timeout_seconds: u64,
    #[serde(default = "default_status_update_interval_seconds")]
    pub status_update_interval_seconds: u64,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_data_retention_days")]
    pub data_retention_days: u32,

    /// §4.7: single-command mutual exclusion policy knob.
    #[serde(default)]
    pub exclusive_standard_commands: bool,
}

fn default_plc_command_topic() -> String {
    "bridge/command".to_string()
}
fn default_plc_response_topic() -> String {
    "bridge/response".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_step_timeout_seconds() -> u64 {
    300
}
fn default_status_update_interval_seconds() -> u64 {
    5
}
fn default_max_retry_attempts() -> u32 {
    3
}
fn default_data_retention_days() -> u32 {
    30
}

impl BridgeConfig {
    /// Load configuration from `.env` (if present) plus `BRIDGE_`-prefixed
    /// environment variables. Missing required fields produce a
    /// `ConfigurationError`, never a panic.
    pub fn load() -> BridgeResult<Self> {
        let _ = dotenvy::dotenv();

        let builder = config::Config::builder()
            .set_default("plc_command_topic", default_plc_command_topic())
            .and_then(|b| b.set_default("plc_response_topic", default_plc_response_topic()))
            .and_then(|b| b.set_default("log_level", default_log_level()))
            .and_then(|b| b.set_default("step_timeout_seconds", default_step_timeout_seconds()))
            .and_then(|b| {
                b.set_default(
                    "status_update_interval_seconds",
                    default_status_update_interval_seconds(),
                )
            })
            .and_then(|b| b.set_default("max_retry_attempts", default_max_retry_attempts()))
            .and_then(|b| b.set_default("data_retention_days", default_data_retention_days()))
            .and_then(|b| b.set_default("exclusive_standard_commands", false))
            .map_err(|e| BridgeError::ConfigurationError(e.to_string()))?
            .add_source(
                config::Environment::with_prefix("BRIDGE")
                    .separator("__")
                    .try_parsing(true),
            );

        let raw = builder
            .build()
            .map_err(|e| BridgeError::ConfigurationError(e.to_string()))?;

        raw.try_deserialize()
            .map_err(|e| BridgeError::ConfigurationError(format!("missing or invalid field: {e}")))
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }

    pub fn status_update_interval(&self) -> Duration {
        Duration::from_secs(self.status_update_interval_seconds)
    }

    pub fn order_topic(&self) -> String {
        format!(
            "meili/v2/{}/{}/order",
            self.robot_manufacturer, self.robot_serial
        )
    }

    pub fn instant_actions_topic(&self) -> String {
        format!(
            "meili/v2/{}/{}/instantActions",
            self.robot_manufacturer, self.robot_serial
        )
    }

    pub fn state_topic(&self) -> String {
        format!(
            "meili/v2/{}/{}/state",
            self.robot_manufacturer, self.robot_serial
        )
    }

    pub fn connection_topic(&self) -> String {
        format!(
            "meili/v2/{}/{}/connection",
            self.robot_manufacturer, self.robot_serial
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_follow_wire_contract() {
        let cfg = BridgeConfig {
            database_url: "postgres://localhost/bridge".into(),
            redis_url: "redis://localhost".into(),
            mqtt_broker_url: "mqtt://localhost:1883".into(),
            mqtt_username: None,
            mqtt_password: None,
            robot_manufacturer: "Roboligent".into(),
            robot_serial: "R2D2".into(),
            plc_command_topic: default_plc_command_topic(),
            plc_response_topic: default_plc_response_topic(),
            log_level: default_log_level(),
            step_timeout_seconds: default_step_timeout_seconds(),
            status_update_interval_seconds: default_status_update_interval_seconds(),
            max_retry_attempts: default_max_retry_attempts(),
            data_retention_days: default_data_retention_days(),
            exclusive_standard_commands: false,
        };

        assert_eq!(cfg.order_topic(), "meili/v2/Roboligent/R2D2/order");
        assert_eq!(
            cfg.instant_actions_topic(),
            "meili/v2/Roboligent/R2D2/instantActions"
        );
        assert_eq!(cfg.state_topic(), "meili/v2/Roboligent/R2D2/state");
        assert_eq!(cfg.connection_topic(), "meili/v2/Roboligent/R2D2/connection");
    }
}
