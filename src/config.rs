//! Device server configuration using Figment.
//!
//! Configuration is loaded from a TOML file and then from environment
//! variables prefixed with `MICROSCOPE_`, which take precedence. Nested keys
//! are separated by a double underscore:
//!
//! ```text
//! MICROSCOPE_LOG_LEVEL=debug
//! MICROSCOPE_DEFAULT_RETRY__INTERVAL_SECS=1
//! ```
//!
//! A configuration file lists the devices to serve:
//!
//! ```toml
//! log_level = "info"
//!
//! [[devices]]
//! class = "SimulatedCamera"
//! host = "127.0.0.1"
//! port = 8000
//!
//! [[devices]]
//! class = "SimulatedFilterWheel"
//! host = "127.0.0.1"
//! port = 8001
//! conf = { positions = 6 }
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "MICROSCOPE_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be read or parsed.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// The configuration parsed but is inconsistent.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Retry policy for device construction and initialisation
    #[serde(default)]
    pub default_retry: RetrySettings,
    /// Devices to serve
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// How often device start-up is retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Seconds between attempts
    #[serde(default = "default_retry_interval")]
    pub interval_secs: u64,
    /// Attempt limit; unset retries until the server stops
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            interval_secs: default_retry_interval(),
            max_attempts: None,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        RetryPolicy {
            max_attempts: settings.max_attempts,
            backoff_delay: Duration::from_secs(settings.interval_secs),
        }
    }
}

/// One device to construct and where to serve it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Registered device class name
    pub class: String,
    /// Host name or address to serve on
    pub host: String,
    /// Port to serve on
    pub port: u16,
    /// Identifier of a floating device
    #[serde(default)]
    pub uid: Option<String>,
    /// Constructor arguments
    #[serde(default = "default_conf")]
    pub conf: serde_json::Value,
}

impl DeviceDefinition {
    /// Definition with empty constructor arguments.
    pub fn new(class: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            class: class.into(),
            host: host.into(),
            port,
            uid: None,
            conf: default_conf(),
        }
    }

    /// Set the constructor arguments.
    pub fn with_conf(mut self, conf: serde_json::Value) -> Self {
        self.conf = conf;
        self
    }

    /// Set the floating device identifier.
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    /// `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_retry_interval() -> u64 {
    5
}

fn default_conf() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl ServerConfig {
    /// Load configuration from a file and `MICROSCOPE_` environment variables.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be loaded or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(figment)
    }

    /// Parse configuration from a TOML string, without environment overrides.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::extract(Figment::new().merge(Toml::string(toml)))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(ConfigError::LoadError)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Every device names a class and a non-zero port
    /// - No two devices share `host:port`
    /// - Floating device identifiers are unique
    /// - `conf` is a table of constructor arguments
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        let mut addresses = HashSet::new();
        let mut uids = HashSet::new();
        for (i, device) in self.devices.iter().enumerate() {
            if device.class.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Device #{i}: 'class' cannot be empty"
                )));
            }
            if device.port == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Device #{i} ({}): 'port' must be > 0",
                    device.class
                )));
            }
            if !addresses.insert(device.address()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate device address: '{}'",
                    device.address()
                )));
            }
            if let Some(uid) = &device.uid {
                if !uids.insert(uid.as_str()) {
                    return Err(ConfigError::ValidationError(format!(
                        "Duplicate device uid: '{uid}'"
                    )));
                }
            }
            if !device.conf.is_object() {
                return Err(ConfigError::ValidationError(format!(
                    "Device #{i} ({}): 'conf' must be a table",
                    device.class
                )));
            }
        }

        Ok(())
    }

    /// Retry policy for device start-up.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.default_retry)
    }

    /// Devices of one class, in definition order.
    pub fn devices_by_class(&self, class: &str) -> Vec<&DeviceDefinition> {
        self.devices.iter().filter(|d| d.class == class).collect()
    }
}
