//! Service settings.
//!
//! Loaded from a TOML file, then environment overrides are applied, then the
//! whole tree is validated. Topic templates are compiled as part of
//! validation so a bad template stops the service before it connects.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::GatingPolicy;
use crate::error::ConfigError;
use crate::schema::TopicSchemaRegistry;
use crate::transport::QualityOfService;

const ENV_PREFIX: &str = "SENSOR_INGEST_MQTT_";

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    format!("sensor-ingest-{}", Uuid::new_v4())
}

fn default_qos() -> u8 {
    1
}

fn default_manual_acks() -> bool {
    true
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_channel_capacity() -> usize {
    64
}

fn default_keepalive_interval_ms() -> u64 {
    5_000
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_watch_retry_interval_ms() -> u64 {
    5_000
}

fn default_delivery_buffer() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidSetting {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Broker connection settings.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSettings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub use_tls: bool,
    /// PEM bundle of trusted CAs; required when `use_tls` is set.
    #[serde(default)]
    pub ca_pem_path: Option<PathBuf>,
    /// Comma-separated topic templates.
    pub topics: String,
    /// Subscription QoS level (0, 1 or 2).
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default)]
    pub clean_session: bool,
    /// Acknowledge only after processing; otherwise the client acks on receipt.
    #[serde(default = "default_manual_acks")]
    pub manual_acks: bool,
    /// Broker-level keepalive (PINGREQ interval).
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Capacity of the client request queue.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl MqttSettings {
    /// Subscription QoS.
    pub fn quality_of_service(&self) -> Result<QualityOfService, ConfigError> {
        QualityOfService::from_level(self.qos).ok_or_else(|| invalid("mqtt.qos", format!("{} is not 0, 1 or 2", self.qos)))
    }

    /// Whether a message left unacknowledged will be redelivered by the broker.
    ///
    /// That takes manual acks (so the client does not ack on receipt), QoS of
    /// at least 1, and a persistent session so the broker keeps the in-flight
    /// message across reconnects.
    #[must_use]
    pub fn redelivery_expected(&self) -> bool {
        self.manual_acks && self.qos >= 1 && !self.clean_session
    }
}

/// Ingestion loop settings.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSettings {
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_watch_retry_interval_ms")]
    pub watch_retry_interval_ms: u64,
    #[serde(default)]
    pub gating_policy: GatingPolicy,
    /// Upper bound on concurrently handled messages. Unbounded when unset.
    #[serde(default)]
    pub max_in_flight: Option<usize>,
    /// Capacity of the transport to dispatcher channel.
    #[serde(default = "default_delivery_buffer")]
    pub delivery_buffer: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: default_keepalive_interval_ms(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            watch_retry_interval_ms: default_watch_retry_interval_ms(),
            gating_policy: GatingPolicy::default(),
            max_in_flight: None,
            delivery_buffer: default_delivery_buffer(),
        }
    }
}

impl IngestSettings {
    pub const fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub const fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub const fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub const fn watch_retry_interval(&self) -> Duration {
        Duration::from_millis(self.watch_retry_interval_ms)
    }
}

/// Log output format.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Base level (`error`, `warn`, `info`, `debug`, `trace`).
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Complete service settings.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub mqtt: MqttSettings,
    #[serde(default)]
    pub ingest: IngestSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Settings {
    /// Load settings from a TOML file.
    ///
    /// Environment overrides are applied separately via
    /// [`Settings::apply_env_overrides`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse { message: e.to_string() })
    }

    /// Apply `SENSOR_INGEST_MQTT_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(host) = var("HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = var("PORT") {
            self.mqtt.port = port
                .parse()
                .map_err(|_| invalid("mqtt.port", format!("'{port}' is not a valid port")))?;
        }
        if let Some(username) = var("USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = var("PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(topics) = var("TOPICS") {
            self.mqtt.topics = topics;
        }
        Ok(())
    }

    /// Check every setting; compiles the topic templates as part of it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mqtt = &self.mqtt;
        if mqtt.host.trim().is_empty() {
            return Err(invalid("mqtt.host", "must not be empty"));
        }
        if mqtt.port == 0 {
            return Err(invalid("mqtt.port", "must not be 0"));
        }
        if mqtt.use_tls && mqtt.ca_pem_path.is_none() {
            return Err(invalid("mqtt.ca_pem_path", "required when use_tls is true"));
        }
        if mqtt.username.is_some() != mqtt.password.is_some() {
            return Err(invalid("mqtt.username", "username and password must be set together"));
        }
        mqtt.quality_of_service()?;
        if mqtt.channel_capacity == 0 {
            return Err(invalid("mqtt.channel_capacity", "must be greater than 0"));
        }

        let ingest = &self.ingest;
        if ingest.backoff_initial_ms == 0 {
            return Err(invalid("ingest.backoff_initial_ms", "must be greater than 0"));
        }
        if ingest.backoff_max_ms < ingest.backoff_initial_ms {
            return Err(invalid("ingest.backoff_max_ms", "must be at least backoff_initial_ms"));
        }
        if ingest.keepalive_interval_ms == 0 {
            return Err(invalid("ingest.keepalive_interval_ms", "must be greater than 0"));
        }
        if ingest.watch_retry_interval_ms == 0 {
            return Err(invalid("ingest.watch_retry_interval_ms", "must be greater than 0"));
        }
        if ingest.max_in_flight == Some(0) {
            return Err(invalid("ingest.max_in_flight", "must be greater than 0 when set"));
        }
        if ingest.delivery_buffer == 0 {
            return Err(invalid("ingest.delivery_buffer", "must be greater than 0"));
        }

        let levels = ["error", "warn", "info", "debug", "trace"];
        if !levels.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(invalid(
                "logging.level",
                format!("'{}' must be one of: {}", self.logging.level, levels.join(", ")),
            ));
        }

        self.compile_schemas().map(|_| ())
    }

    /// Compile the configured topic templates.
    pub fn compile_schemas(&self) -> Result<TopicSchemaRegistry, ConfigError> {
        TopicSchemaRegistry::from_template_list(&self.mqtt.topics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::io::Write;

    const MINIMAL: &str = r#"
        [mqtt]
        host = "localhost"
        topics = "Aranetest/+/sensors/<sensorId>/json/measurements, test/<sensorId>/<metadataName>"
    "#;

    #[test]
    fn test_defaults() {
        let settings = Settings::from_toml_str(MINIMAL).unwrap();
        assert_eq!(settings.mqtt.port, 1883);
        assert!(settings.mqtt.client_id.starts_with("sensor-ingest-"));
        assert_eq!(settings.mqtt.qos, 1);
        assert!(settings.mqtt.manual_acks);
        assert!(!settings.mqtt.clean_session);
        assert_eq!(settings.ingest.backoff_initial(), Duration::from_secs(1));
        assert_eq!(settings.ingest.backoff_max(), Duration::from_secs(30));
        assert_eq!(settings.ingest.keepalive_interval(), Duration::from_secs(5));
        assert_eq!(settings.ingest.watch_retry_interval(), Duration::from_secs(5));
        assert_eq!(settings.ingest.gating_policy, GatingPolicy::FailOpen);
        assert_eq!(settings.ingest.max_in_flight, None);
        assert_eq!(settings.logging.format, LogFormat::Compact);
        assert!(settings.validate().is_ok());
        assert!(settings.mqtt.redelivery_expected());
    }

    #[test]
    fn test_compile_schemas() {
        let settings = Settings::from_toml_str(MINIMAL).unwrap();
        let registry = settings.compile_schemas().unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.filters(),
            vec!["Aranetest/+/sensors/+/json/measurements".to_string(), "test/+/+".to_string()]
        );
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [mqtt]
            host = "broker"
            port = 8883
            topics = "a/<sensorId>/m"
            use_tls = true
            ca_pem_path = "/etc/ssl/ca.pem"

            [ingest]
            gating_policy = "fail_closed"
            max_in_flight = 32

            [logging]
            level = "debug"
            format = "json"
            "#
        )
        .unwrap();

        let settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.mqtt.port, 8883);
        assert_eq!(settings.ingest.gating_policy, GatingPolicy::FailClosed);
        assert_eq!(settings.ingest.max_in_flight, Some(32));
        assert_eq!(settings.logging.format, LogFormat::Json);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_missing_file() {
        let err = Settings::from_file("/nonexistent/sensor-ingest.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_parse_error() {
        let err = Settings::from_toml_str("[mqtt]\nport = \"x\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = Settings::from_toml_str(MINIMAL).unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            ("SENSOR_INGEST_MQTT_HOST", "mqtt.example.com"),
            ("SENSOR_INGEST_MQTT_PORT", "1884"),
            ("SENSOR_INGEST_MQTT_USERNAME", "ingest"),
            ("SENSOR_INGEST_MQTT_PASSWORD", "s3cret"),
            ("SENSOR_INGEST_MQTT_TOPICS", "x/<sensorId>"),
        ]);
        settings
            .apply_overrides_from(|k| env.get(k).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(settings.mqtt.host, "mqtt.example.com");
        assert_eq!(settings.mqtt.port, 1884);
        assert_eq!(settings.mqtt.username.as_deref(), Some("ingest"));
        assert_eq!(settings.mqtt.password.as_deref(), Some("s3cret"));
        assert_eq!(settings.mqtt.topics, "x/<sensorId>");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_env_override_bad_port() {
        let mut settings = Settings::from_toml_str(MINIMAL).unwrap();
        let result = settings.apply_overrides_from(|k| (k == "SENSOR_INGEST_MQTT_PORT").then(|| "abc".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_failures() {
        let base = Settings::from_toml_str(MINIMAL).unwrap();

        let cases: [(&str, fn(&mut Settings)); 12] = [
            ("empty topics", |s| s.mqtt.topics = " , ".to_string()),
            ("no sensorId", |s| s.mqtt.topics = "a/b/c".to_string()),
            ("zero initial backoff", |s| s.ingest.backoff_initial_ms = 0),
            ("max below initial", |s| s.ingest.backoff_max_ms = 500),
            ("zero keepalive", |s| s.ingest.keepalive_interval_ms = 0),
            ("zero watch retry", |s| s.ingest.watch_retry_interval_ms = 0),
            ("port 0", |s| s.mqtt.port = 0),
            ("tls without ca", |s| s.mqtt.use_tls = true),
            ("half credentials", |s| s.mqtt.username = Some("u".to_string())),
            ("bad qos", |s| s.mqtt.qos = 3),
            ("zero in flight", |s| s.ingest.max_in_flight = Some(0)),
            ("bad log level", |s| s.logging.level = "loud".to_string()),
        ];

        for (name, mutate) in cases {
            let mut settings = base.clone();
            mutate(&mut settings);
            assert!(settings.validate().is_err(), "expected failure for {name}");
        }
    }

    #[test]
    fn test_redelivery_contract() {
        let mut mqtt = Settings::from_toml_str(MINIMAL).unwrap().mqtt;
        assert!(mqtt.redelivery_expected());

        mqtt.clean_session = true;
        assert!(!mqtt.redelivery_expected());

        mqtt.clean_session = false;
        mqtt.qos = 0;
        assert!(!mqtt.redelivery_expected());

        mqtt.qos = 1;
        mqtt.manual_acks = false;
        assert!(!mqtt.redelivery_expected());
    }
}
