//! # Configuration
//!
//! Settings for the pipeline stages and the task manager, grouped per layer.
//!
//! ## Loading
//! - TOML via `from_file()` or `from_toml()`, every section optional
//! - `MDEV_PROTOCOL_*` variables via `from_env()`
//! - Defaults plus a closure via `default_with_overrides()`
//!
//! ## Protocol Constraints
//! - The server idle timeout may not go below 30 seconds, the chat server rejects it
//! - Edit and delete tasks refuse to run six hours after the message was sent

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Lowest mediator protocol version this client speaks
pub const D2M_PROTOCOL_VERSION_MIN: u32 = 0;

/// Highest mediator protocol version this client speaks
pub const D2M_PROTOCOL_VERSION_MAX: u32 = 0;

/// Smallest valid container (payload type and reserved bytes)
pub const MEDIATOR_FRAME_MIN_LENGTH: usize = 4;

/// Largest container the mediator will relay
pub const MEDIATOR_FRAME_MAX_LENGTH: usize = 65_536;

/// Window after sending in which a message may still be edited or deleted
pub const EDIT_GRACE_PERIOD: Duration = Duration::from_secs(6 * 60 * 60);

/// Idle interval after which an echo request is sent
pub const DEFAULT_ECHO_INTERVAL: Duration = Duration::from_secs(10);

/// Time an echo request may stay unanswered
pub const DEFAULT_CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(20);

/// Idle timeout announced to the chat server
pub const DEFAULT_SERVER_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProtocolConfig {
    /// Layer 1 and channel settings
    #[serde(default)]
    pub framing: FramingConfig,

    /// Handshake and keepalive settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Task manager settings
    #[serde(default)]
    pub tasks: TaskConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ProtocolConfig {
    /// Read and parse a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ProtocolError::ConfigError(format!("Cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Invalid TOML: {e}")))
    }

    /// Defaults, overridden by whichever `MDEV_PROTOCOL_*` variables parse
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("MDEV_PROTOCOL_MAX_FRAME_LENGTH") {
            if let Ok(val) = value.parse::<usize>() {
                config.framing.max_frame_length = val;
            }
        }

        if let Ok(value) = std::env::var("MDEV_PROTOCOL_CHANNEL_CAPACITY") {
            if let Ok(val) = value.parse::<usize>() {
                config.framing.channel_capacity = val;
            }
        }

        if let Ok(value) = std::env::var("MDEV_PROTOCOL_ECHO_INTERVAL_MS") {
            if let Ok(val) = value.parse::<u64>() {
                config.session.echo_interval = Duration::from_millis(val);
            }
        }

        if let Ok(value) = std::env::var("MDEV_PROTOCOL_CLIENT_IDLE_TIMEOUT_MS") {
            if let Ok(val) = value.parse::<u64>() {
                config.session.client_idle_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(value) = std::env::var("MDEV_PROTOCOL_DEVICE_ID") {
            if let Ok(val) = value.parse::<u64>() {
                config.session.device_id = val;
            }
        }

        if let Ok(value) = std::env::var("MDEV_PROTOCOL_RETRY_MAX_ATTEMPTS") {
            if let Ok(val) = value.parse::<u32>() {
                config.tasks.retry_max_attempts = val;
            }
        }

        Ok(config)
    }

    /// Defaults adjusted by `mutator`
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// The defaults rendered as TOML
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Cannot serialize config: {e}")))?;
        std::fs::write(path, content).map_err(|e| {
            ProtocolError::ConfigError(format!("Cannot write {}: {e}", path.display()))
        })
    }

    /// Every problem found, one message each. Empty means usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.framing.validate());
        errors.extend(self.session.validate());
        errors.extend(self.tasks.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// [`validate`](Self::validate) folded into a single error
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Framing and backpressure configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FramingConfig {
    /// Smallest accepted container length
    pub min_frame_length: usize,

    /// Largest accepted container length
    pub max_frame_length: usize,

    /// Capacity of the bounded channels between pipeline stages
    pub channel_capacity: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            min_frame_length: MEDIATOR_FRAME_MIN_LENGTH,
            max_frame_length: MEDIATOR_FRAME_MAX_LENGTH,
            channel_capacity: 64,
        }
    }
}

impl FramingConfig {
    /// Validate framing configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.min_frame_length < MEDIATOR_FRAME_MIN_LENGTH {
            errors.push(format!(
                "Min frame length too small: {} (minimum: {MEDIATOR_FRAME_MIN_LENGTH})",
                self.min_frame_length
            ));
        }

        if self.max_frame_length < self.min_frame_length {
            errors.push("Max frame length cannot be smaller than min frame length".to_string());
        } else if self.max_frame_length > MEDIATOR_FRAME_MAX_LENGTH {
            errors.push(format!(
                "Max frame length too large: {} (maximum: {MEDIATOR_FRAME_MAX_LENGTH})",
                self.max_frame_length
            ));
        }

        if self.channel_capacity == 0 {
            errors.push("Channel capacity must be greater than 0".to_string());
        } else if self.channel_capacity > 65_536 {
            errors.push(format!(
                "Channel capacity too large: {} (max recommended: 65,536)",
                self.channel_capacity
            ));
        }

        errors
    }
}

/// Handshake and keepalive configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Client info string announced in the CSP login extensions
    pub client_info: String,

    /// Mediator device id of this device
    pub device_id: u64,

    /// CSP device id of this device
    pub csp_device_id: u64,

    /// Idle interval after which an echo request is sent
    #[serde(with = "duration_serde")]
    pub echo_interval: Duration,

    /// Time an echo request may stay unanswered before the connection is dropped
    #[serde(with = "duration_serde")]
    pub client_idle_timeout: Duration,

    /// Idle timeout announced to the chat server
    #[serde(with = "duration_serde")]
    pub server_idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_info: format!("mdev-protocol/{}", env!("CARGO_PKG_VERSION")),
            device_id: 0,
            csp_device_id: 0,
            echo_interval: DEFAULT_ECHO_INTERVAL,
            client_idle_timeout: DEFAULT_CLIENT_IDLE_TIMEOUT,
            server_idle_timeout: DEFAULT_SERVER_IDLE_TIMEOUT,
        }
    }
}

impl SessionConfig {
    /// Validate session configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.client_info.is_empty() {
            errors.push("Client info cannot be empty".to_string());
        } else if self.client_info.len() > 255 {
            errors.push(format!(
                "Client info too long: {} bytes (maximum: 255)",
                self.client_info.len()
            ));
        }

        if self.echo_interval.as_millis() < 100 {
            errors.push("Echo interval too short (minimum: 100ms)".to_string());
        } else if self.echo_interval.as_secs() > 3600 {
            errors.push("Echo interval too long (maximum: 1 hour)".to_string());
        }

        if self.client_idle_timeout.as_millis() < 100 {
            errors.push("Client idle timeout too short (minimum: 100ms)".to_string());
        }

        if self.server_idle_timeout.as_secs() < 30 {
            errors.push("Server idle timeout too short (minimum: 30s)".to_string());
        } else if self.server_idle_timeout.as_secs() > u64::from(u16::MAX) {
            errors.push(format!(
                "Server idle timeout too long (maximum: {}s)",
                u16::MAX
            ));
        }

        errors
    }
}

/// Task manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskConfig {
    /// Window after sending in which a message may still be edited or deleted
    #[serde(with = "duration_serde")]
    pub edit_grace_period: Duration,

    /// Delay before the first retry of a failed persistent task
    #[serde(with = "duration_serde")]
    pub retry_initial_delay: Duration,

    /// Upper bound for the retry delay
    #[serde(with = "duration_serde")]
    pub retry_max_delay: Duration,

    /// Growth factor of the retry delay
    pub retry_multiplier: u32,

    /// Failed runs before a task is parked until the next connection
    pub retry_max_attempts: u32,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            edit_grace_period: EDIT_GRACE_PERIOD,
            retry_initial_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            retry_multiplier: 2,
            retry_max_attempts: 8,
        }
    }
}

impl TaskConfig {
    /// Validate task configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.edit_grace_period.is_zero() {
            errors.push("Edit grace period must be greater than 0".to_string());
        }

        if self.retry_initial_delay.as_millis() < 1 {
            errors.push("Retry initial delay too short (minimum: 1ms)".to_string());
        }

        if self.retry_max_delay < self.retry_initial_delay {
            errors.push("Retry max delay cannot be smaller than the initial delay".to_string());
        } else if self.retry_max_delay.as_secs() > 3600 {
            errors.push("Retry max delay too long (maximum: 1 hour)".to_string());
        }

        if self.retry_multiplier < 1 {
            errors.push("Retry multiplier must be at least 1".to_string());
        }

        if self.retry_max_attempts == 0 {
            errors.push("Retry max attempts must be greater than 0".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Reported once when the subscriber is installed
    pub app_name: String,

    /// Used unless `MDEV_PROTOCOL_LOG` is set
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// When false no subscriber is installed and the host application owns logging
    pub log_to_console: bool,

    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("mdev-protocol"),
            log_level: Level::INFO,
            log_to_console: true,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Durations as whole milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Levels as lowercase names
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S: Serializer>(level: &Level, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&level.as_str().to_ascii_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse()
            .map_err(|_| serde::de::Error::custom(format!("Unknown log level: {name}")))
    }
}
