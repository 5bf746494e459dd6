//! YAML application configuration
//!
//! ```yaml
//! log_level: info
//! meters:
//!   - name: garage
//!     unit_id: 1
//!     register_set: basic_plus
//!     refresh_interval_secs: 10
//!     connection:
//!       type: serial
//!       port: /dev/ttyUSB0
//!       baud_rate: 9600
//!   - name: heat_pump
//!     unit_id: 2
//!     registers:
//!       - { key: import_energy, address: 72, name: Import Energy, unit: kWh,
//!           device_class: energy, state_class: total_increasing }
//!     connection:
//!       type: serial
//!       port: /dev/ttyUSB0
//! ```
//!
//! Both meters above share one serial link.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::catalog::{RegisterDescriptor, RegisterSet, RegisterTier};
use crate::connection::{ConnectionParams, DEFAULT_TIMEOUT_SECS};
use crate::constants::{MAX_UNIT_ID, MIN_UNIT_ID};
use crate::device_limits::{
    DeviceLimits, DEFAULT_ERROR_BACKOFF_MS, DEFAULT_INTER_REQUEST_DELAY_MS, DEFAULT_MAX_READ_REGISTERS,
};
use crate::engine::{PollSettings, DEFAULT_REFRESH_INTERVAL_SECS};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::DEFAULT_LOG_LEVEL;

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_refresh_interval_secs() -> u64 {
    DEFAULT_REFRESH_INTERVAL_SECS
}

fn default_max_registers_per_read() -> u16 {
    DEFAULT_MAX_READ_REGISTERS
}

fn default_inter_request_delay_ms() -> u64 {
    DEFAULT_INTER_REQUEST_DELAY_MS
}

fn default_error_backoff_ms() -> u64 {
    DEFAULT_ERROR_BACKOFF_MS
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub meters: Vec<MeterConfig>,
}

/// One polled meter.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeterConfig {
    pub name: String,
    pub unit_id: u8,
    /// Built-in tier, ignored when `registers` is given.
    #[serde(default)]
    pub register_set: RegisterTier,
    /// Custom register catalog.
    #[serde(default)]
    pub registers: Option<Vec<RegisterDescriptor>>,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_max_registers_per_read")]
    pub max_registers_per_read: u16,
    #[serde(default = "default_inter_request_delay_ms")]
    pub inter_request_delay_ms: u64,
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
    /// Connect and request timeout of the link.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    pub connection: ConnectionParams,
}

impl AppConfig {
    /// Read, parse and validate a YAML file.
    pub fn load(path: impl AsRef<Path>) -> ModbusResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    /// Parse and validate YAML text.
    pub fn from_yaml(text: &str) -> ModbusResult<Self> {
        let config: Self = serde_yaml::from_str(text)
            .map_err(|e| ModbusError::configuration(format!("Invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.meters.is_empty() {
            return Err(ModbusError::configuration("No meters configured"));
        }

        let mut names = HashSet::new();
        let mut devices = HashSet::new();
        for meter in &self.meters {
            if !names.insert(meter.name.as_str()) {
                return Err(ModbusError::configuration(format!(
                    "Duplicate meter name '{}'",
                    meter.name
                )));
            }
            meter.validate()?;

            // one physical meter per unit id on a link
            let key = meter.connection.key();
            if !devices.insert((key.as_str().to_string(), meter.unit_id)) {
                return Err(ModbusError::configuration(format!(
                    "Meter '{}': unit_id {} is already polled on {}",
                    meter.name, meter.unit_id, key
                )));
            }
        }
        Ok(())
    }
}

impl MeterConfig {
    pub fn validate(&self) -> ModbusResult<()> {
        let context = |e: ModbusError| ModbusError::configuration(format!("Meter '{}': {}", self.name, e));

        if self.name.trim().is_empty() {
            return Err(ModbusError::configuration("Meter name must not be empty"));
        }
        if !(MIN_UNIT_ID..=MAX_UNIT_ID).contains(&self.unit_id) {
            return Err(context(ModbusError::configuration(format!(
                "unit_id must be {}-{}, got {}",
                MIN_UNIT_ID, MAX_UNIT_ID, self.unit_id
            ))));
        }
        if self.refresh_interval_secs == 0 {
            return Err(context(ModbusError::configuration("refresh_interval_secs must be non-zero")));
        }
        if self.timeout_secs == 0 {
            return Err(context(ModbusError::configuration("timeout_secs must be non-zero")));
        }
        self.limits().validate().map_err(context)?;
        self.connection.validate().map_err(context)?;
        self.register_set().map_err(context)?;
        Ok(())
    }

    /// The custom catalog if one is given, otherwise the selected tier.
    pub fn register_set(&self) -> ModbusResult<RegisterSet> {
        match &self.registers {
            Some(registers) => RegisterSet::new(format!("{}_custom", self.name), registers.clone()),
            None => Ok(RegisterSet::tier(self.register_set)),
        }
    }

    pub fn limits(&self) -> DeviceLimits {
        DeviceLimits::new()
            .with_max_read_registers(self.max_registers_per_read)
            .with_inter_request_delay_ms(self.inter_request_delay_ms)
            .with_error_backoff_ms(self.error_backoff_ms)
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings::default()
            .with_refresh_interval(Duration::from_secs(self.refresh_interval_secs))
            .with_limits(self.limits())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
