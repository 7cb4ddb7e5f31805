use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::services::broadcaster::DEFAULT_EVENT_BUFFER;
use crate::utils::error::ModbusError;

pub const DEFAULT_PORT: u16 = 502;
pub const DEFAULT_UNIT_ID: u8 = 1;
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 30_000;

/// Settings for one MODBUS/TCP endpoint.
///
/// A client validates its config once when it is built and never mutates
/// it afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Device name stamped on every broadcast event.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    // Connection settings
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    /// Connect timeout per attempt.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Per-request deadline; falls back to `timeout_ms`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,

    // Retry settings
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    // Keepalive settings
    #[serde(default = "default_keep_alive")]
    pub keep_alive: bool,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default)]
    pub keepalive_address: u16,

    /// Queue depth of each channel subscriber.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_unit_id() -> u8 {
    DEFAULT_UNIT_ID
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_retry_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

fn default_keep_alive() -> bool {
    true
}

fn default_keepalive_interval_ms() -> u64 {
    DEFAULT_KEEPALIVE_INTERVAL_MS
}

fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            host: host.into(),
            port: DEFAULT_PORT,
            unit_id: DEFAULT_UNIT_ID,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            request_timeout_ms: None,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            keep_alive: true,
            keepalive_interval_ms: DEFAULT_KEEPALIVE_INTERVAL_MS,
            keepalive_address: 0,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = enabled;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    /// Validates and returns the config, ready for a client.
    pub fn build(self) -> Result<Self, ModbusError> {
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ModbusError> {
        if self.name.trim().is_empty() {
            return Err(ModbusError::ConfigValidation("name must not be empty".to_string()));
        }

        self.host.parse::<IpAddr>().map_err(|_| {
            ModbusError::ConfigValidation(format!("host '{}' is not an IP address", self.host))
        })?;

        if self.port == 0 {
            return Err(ModbusError::ConfigValidation("port must be 1-65535".to_string()));
        }

        if self.unit_id == 0 {
            return Err(ModbusError::ConfigValidation("unit id must be 1-255".to_string()));
        }

        let durations = [
            ("timeout_ms", Some(self.timeout_ms)),
            ("request_timeout_ms", self.request_timeout_ms),
            ("retry_delay_ms", Some(self.retry_delay_ms)),
            ("keepalive_interval_ms", Some(self.keepalive_interval_ms)),
        ];
        for (field, value) in durations {
            if value == Some(0) {
                return Err(ModbusError::ConfigValidation(format!("{} must be greater than 0", field)));
            }
        }

        if self.event_buffer == 0 {
            return Err(ModbusError::ConfigValidation("event_buffer must be greater than 0".to_string()));
        }

        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ModbusError> {
        let ip = self.host.parse::<IpAddr>().map_err(|_| {
            ModbusError::ConfigValidation(format!("host '{}' is not an IP address", self.host))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.unwrap_or(self.timeout_ms))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ModbusError> {
        let config: EndpointConfig = toml::from_str(content)?;
        config.build()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ModbusError> {
        let path = path.as_ref();
        debug!("Loading endpoint config from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!("⚙️  Loaded endpoint '{}' ({}:{}) from {}", config.name, config.host, config.port, path.display());
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ModbusError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_toml() {
        let config = EndpointConfig::from_toml_str(
            r#"
            name = "press-1"
            host = "192.168.1.10"
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 502);
        assert_eq!(config.unit_id, 1);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.retry_delay(), Duration::from_millis(1000));
        assert!(config.keep_alive);
        assert_eq!(config.keepalive_interval(), Duration::from_secs(30));
        assert_eq!(config.request_timeout(), config.connect_timeout());
    }

    #[test]
    fn test_rejects_hostname() {
        let err = EndpointConfig::new("plc", "plc.local").build().unwrap_err();
        assert!(matches!(err, ModbusError::ConfigValidation(_)));
    }

    #[test]
    fn test_rejects_unit_zero_and_port_zero() {
        assert!(EndpointConfig::new("plc", "10.0.0.1").with_unit_id(0).build().is_err());
        assert!(EndpointConfig::new("plc", "10.0.0.1").with_port(0).build().is_err());
        assert!(EndpointConfig::new("plc", "10.0.0.1").with_unit_id(255).build().is_ok());
    }

    #[test]
    fn test_rejects_zero_durations() {
        let config = EndpointConfig::new("plc", "::1").with_retry(2, Duration::ZERO);
        assert!(config.build().is_err());
    }

    #[test]
    fn test_rejects_unknown_toml_type() {
        assert!(EndpointConfig::from_toml_str("name = 'x'\nhost = '10.0.0.1'\nport = 'abc'").is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plc/endpoint.toml");
        let config = EndpointConfig::new("press-1", "127.0.0.1")
            .with_port(1502)
            .with_description("Line 1 press")
            .with_request_timeout(Duration::from_millis(750));

        config.save_to_file(&path).unwrap();
        let loaded = EndpointConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.socket_addr().unwrap().port(), 1502);
    }
}
