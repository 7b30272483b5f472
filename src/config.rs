use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::scheduler::{SchedulerConfig, MAX_DELAY};

/// Environment variables with this prefix override file settings.
///
/// Nested keys are separated by `__`, so `KILOVAULT_DEFAULTS__UPDATE_INTERVAL_SECS=30`
/// sets `defaults.update_interval_secs`.
const ENV_PREFIX: &str = "KILOVAULT";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, PartialEq)]
pub struct BmsConfig {
    pub devices: Vec<DeviceConfig>,
}

/// One battery to poll.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    /// Label used in logs and output. Must be unique.
    pub id: String,
    /// Advertised BLE name of the BMS.
    pub device_name: String,
    pub update_interval_secs: u64,
    pub response_timeout_secs: u64,
    /// Backoff is capped at this multiple of the update interval.
    pub backoff_cap_factor: u32,
    /// Publish frames the BMS pushes on its own between polls.
    pub accept_unsolicited: bool,
    pub reconnect_delay_secs: u64,
}

/// Settings for every device that does not set them itself.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceDefaults {
    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
    #[serde(default = "default_backoff_cap_factor")]
    pub backoff_cap_factor: u32,
    #[serde(default)]
    pub accept_unsolicited: bool,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

impl Default for DeviceDefaults {
    fn default() -> Self {
        Self {
            update_interval_secs: default_update_interval_secs(),
            response_timeout_secs: default_response_timeout_secs(),
            backoff_cap_factor: default_backoff_cap_factor(),
            accept_unsolicited: false,
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

fn default_update_interval_secs() -> u64 {
    10
}

fn default_response_timeout_secs() -> u64 {
    5
}

fn default_backoff_cap_factor() -> u32 {
    5
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

/// The file layout: a `[defaults]` table and a `[[devices]]` list.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    defaults: DeviceDefaults,
    devices: Vec<DeviceEntry>,
}

#[derive(Debug, Deserialize)]
struct DeviceEntry {
    id: String,
    device_name: String,
    update_interval_secs: Option<u64>,
    response_timeout_secs: Option<u64>,
    backoff_cap_factor: Option<u32>,
    accept_unsolicited: Option<bool>,
    reconnect_delay_secs: Option<u64>,
}

impl DeviceEntry {
    fn resolve(self, defaults: &DeviceDefaults) -> DeviceConfig {
        DeviceConfig {
            id: self.id,
            device_name: self.device_name,
            update_interval_secs: self
                .update_interval_secs
                .unwrap_or(defaults.update_interval_secs),
            response_timeout_secs: self
                .response_timeout_secs
                .unwrap_or(defaults.response_timeout_secs),
            backoff_cap_factor: self.backoff_cap_factor.unwrap_or(defaults.backoff_cap_factor),
            accept_unsolicited: self.accept_unsolicited.unwrap_or(defaults.accept_unsolicited),
            reconnect_delay_secs: self
                .reconnect_delay_secs
                .unwrap_or(defaults.reconnect_delay_secs),
        }
    }
}

fn environment() -> ::config::Environment {
    ::config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}

impl BmsConfig {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_sources(::config::File::from(path), environment())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from_str(toml, ::config::FileFormat::Toml))
            .build()?;
        Self::from_settings(settings)
    }

    fn from_sources<S>(file: S, env: ::config::Environment) -> Result<Self, ConfigError>
    where
        S: ::config::Source + Send + Sync + 'static,
    {
        let settings = ::config::Config::builder()
            .add_source(file)
            .add_source(env)
            .build()?;
        Self::from_settings(settings)
    }

    fn from_settings(settings: ::config::Config) -> Result<Self, ConfigError> {
        let file: ConfigFile = settings.try_deserialize()?;
        let config = Self {
            devices: file
                .devices
                .into_iter()
                .map(|entry| entry.resolve(&file.defaults))
                .collect(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::Invalid("no devices configured".into()));
        }
        let mut ids = HashSet::new();
        for device in &self.devices {
            device.validate()?;
            if !ids.insert(device.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate device id '{}'",
                    device.id
                )));
            }
        }
        Ok(())
    }
}

impl DeviceConfig {
    pub fn new(id: impl Into<String>, device_name: impl Into<String>) -> Self {
        let defaults = DeviceDefaults::default();
        Self {
            id: id.into(),
            device_name: device_name.into(),
            update_interval_secs: defaults.update_interval_secs,
            response_timeout_secs: defaults.response_timeout_secs,
            backoff_cap_factor: defaults.backoff_cap_factor,
            accept_unsolicited: defaults.accept_unsolicited,
            reconnect_delay_secs: defaults.reconnect_delay_secs,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(format!("device '{}': {msg}", self.id)));
        let max_secs = MAX_DELAY.as_secs();
        if self.id.trim().is_empty() {
            return Err(ConfigError::Invalid("device id must not be empty".into()));
        }
        if self.device_name.trim().is_empty() {
            return invalid("device_name must not be empty".into());
        }
        for (name, secs) in [
            ("update_interval_secs", self.update_interval_secs),
            ("response_timeout_secs", self.response_timeout_secs),
        ] {
            if secs == 0 {
                return invalid(format!("{name} must be greater than zero"));
            }
            if secs > max_secs {
                return invalid(format!("{name} must be at most {max_secs}"));
            }
        }
        if self.reconnect_delay_secs > max_secs {
            return invalid(format!("reconnect_delay_secs must be at most {max_secs}"));
        }
        if self.backoff_cap_factor == 0 {
            return invalid("backoff_cap_factor must be at least 1".into());
        }
        Ok(())
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let update_interval = self.update_interval();
        SchedulerConfig {
            update_interval,
            response_timeout: Duration::from_secs(self.response_timeout_secs),
            backoff_base: update_interval,
            backoff_cap: update_interval.saturating_mul(self.backoff_cap_factor),
            accept_unsolicited: self.accept_unsolicited,
        }
    }
}
