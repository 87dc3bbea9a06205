use std::time::Duration;

use config::{Config, ConfigError, Environment, Source};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::connection::{ConnectionOptions, Credentials, ReconnectPolicy};
use crate::dispatcher::DispatcherConfig;

/// Service configuration, read from `INGEST_*` environment variables.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IngestConfig {
    /// Log level used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub log_json: bool,

    // MQTT configuration
    #[serde(default = "default_mqtt_host")]
    pub mqtt_host: String,

    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,

    #[serde(default = "default_mqtt_client_id")]
    pub mqtt_client_id: String,

    #[serde(default)]
    pub mqtt_user: Option<String>,

    #[serde(default, skip_serializing)]
    pub mqtt_pass: Option<String>,

    #[serde(default = "default_mqtt_keep_alive_secs")]
    pub mqtt_keep_alive_secs: u64,

    /// Bound on waiting for CONNACK
    #[serde(default = "default_mqtt_connect_timeout_secs")]
    pub mqtt_connect_timeout_secs: u64,

    /// Request channel and transport event channel capacity
    #[serde(default = "default_mqtt_channel_capacity")]
    pub mqtt_channel_capacity: usize,

    /// Topic root; telemetry arrives under `<root>/telemetry/#`
    #[serde(default = "default_topic_root")]
    pub topic_root: String,

    /// Delay before the reconnect attempt that follows a dropped link
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    // Dispatcher configuration
    #[serde(default = "default_dispatch_queue_capacity")]
    pub dispatch_queue_capacity: usize,

    #[serde(default = "default_dispatch_max_in_flight")]
    pub dispatch_max_in_flight: usize,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    // Storage configuration
    /// DuckDB file, or `:memory:`
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// JSON array of `{connection_id, id, name}` loaded at startup
    #[serde(default = "default_devices_file")]
    pub devices_file: String,

    // HTTP configuration
    #[serde(default = "default_http_bind")]
    pub http_bind: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_client_id() -> String {
    "device-telemetry-ingest".to_string()
}

fn default_mqtt_keep_alive_secs() -> u64 {
    5
}

fn default_mqtt_connect_timeout_secs() -> u64 {
    10
}

fn default_mqtt_channel_capacity() -> usize {
    100
}

fn default_topic_root() -> String {
    "/devices".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_dispatch_queue_capacity() -> usize {
    1024
}

fn default_dispatch_max_in_flight() -> usize {
    16
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_db_path() -> String {
    "telemetry.duckdb".to_string()
}

fn default_devices_file() -> String {
    "devices.json".to_string()
}

fn default_http_bind() -> String {
    "0.0.0.0:3000".to_string()
}

impl IngestConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(Environment::with_prefix("INGEST").try_parsing(true))
    }

    pub fn from_source<S>(source: S) -> Result<Self, ConfigError>
    where
        S: Source + Send + Sync + 'static,
    {
        Config::builder().add_source(source).build()?.try_deserialize()
    }

    /// Broker options. Credentials are only used when both user and
    /// password are set.
    pub fn connection_options(&self) -> ConnectionOptions {
        let credentials = match (&self.mqtt_user, &self.mqtt_pass) {
            (Some(user), Some(pass)) => {
                info!(user = %user, "using MQTT credentials from environment");
                Some(Credentials {
                    username: user.clone(),
                    password: pass.clone(),
                })
            }
            (Some(_), None) | (None, Some(_)) => {
                warn!("MQTT credentials incomplete: both INGEST_MQTT_USER and INGEST_MQTT_PASS must be set to enable auth");
                None
            }
            (None, None) => None,
        };

        ConnectionOptions {
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            client_id: self.mqtt_client_id.clone(),
            credentials,
            keep_alive: Duration::from_secs(self.mqtt_keep_alive_secs),
            connect_timeout: Duration::from_secs(self.mqtt_connect_timeout_secs),
            clean_session: true,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            queue_capacity: self.dispatch_queue_capacity,
            max_in_flight: self.dispatch_max_in_flight,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: Duration::from_millis(self.reconnect_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(vars: &[(&str, &str)]) -> IngestConfig {
        let env: config::Map<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        IngestConfig::from_source(Environment::with_prefix("INGEST").try_parsing(true).source(Some(env))).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = load(&[]);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.mqtt_host, "localhost");
        assert_eq!(config.mqtt_port, 1883);
        assert_eq!(config.topic_root, "/devices");
        assert_eq!(config.reconnect_policy().delay, Duration::from_secs(1));
        assert!(config.connection_options().credentials.is_none());
    }

    #[test]
    fn test_custom_config() {
        let config = load(&[
            ("INGEST_MQTT_HOST", "broker.internal"),
            ("INGEST_MQTT_PORT", "8883"),
            ("INGEST_MQTT_USER", "svc"),
            ("INGEST_MQTT_PASS", "hunter2"),
            ("INGEST_TOPIC_ROOT", "/fleet"),
            ("INGEST_DISPATCH_MAX_IN_FLIGHT", "4"),
            ("INGEST_LOG_JSON", "true"),
        ]);

        let options = config.connection_options();
        assert_eq!(options.host, "broker.internal");
        assert_eq!(options.port, 8883);
        let credentials = options.credentials.unwrap();
        assert_eq!(credentials.username, "svc");
        assert_eq!(credentials.password, "hunter2");
        assert_eq!(config.topic_root, "/fleet");
        assert_eq!(config.dispatcher_config().max_in_flight, 4);
        assert!(config.log_json);
    }

    #[test]
    fn test_incomplete_credentials_are_ignored() {
        let config = load(&[("INGEST_MQTT_USER", "svc")]);
        assert!(config.connection_options().credentials.is_none());
    }

    #[test]
    fn test_password_not_serialized() {
        let config = load(&[("INGEST_MQTT_PASS", "hunter2")]);
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
    }
}
