//! TOML-based engine configuration.

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::session::ConsumerClass;

/// Top-level configuration parsed from TOML.
///
/// All fields have defaults matching a small single-battery installation.
/// Load from TOML with [`EmsConfig::from_toml_file`] or use the built-in
/// [`EmsConfig::default`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmsConfig {
    /// Control-loop timing and protocol parameters.
    pub engine: EngineConfig,
    /// Inverter conversion parameters.
    pub inverter: InverterConfig,
    /// Grid connection parameters.
    pub grid: GridConfig,
    /// Battery reservation curve.
    pub reservation: ReservationConfig,
    /// Managed devices, one session each.
    pub devices: Vec<DeviceConfig>,
}

/// Control-loop timing and protocol parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Control cycle interval (seconds, must be > 0).
    pub tick_interval_s: u64,
    /// Liveness probe interval (seconds, must be > 0).
    pub keepalive_interval_s: u64,
    /// Delay before a torn-down session reconnects (seconds).
    pub reconnect_delay_s: u64,
    /// How long unanswered requests stay correlated (seconds, must be > 0).
    pub request_ttl_s: u64,
    /// Total power a primary consumer must leave unclaimed (W).
    pub balancing_headroom_w: f32,
    /// Bus identity of this engine.
    pub client_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_s: 5,
            keepalive_interval_s: 30,
            reconnect_delay_s: 30,
            request_ttl_s: 90,
            balancing_headroom_w: 50.0,
            client_id: "surplus-ems".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_s)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_s)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_s)
    }

    pub fn request_ttl(&self) -> Duration {
        Duration::from_secs(self.request_ttl_s)
    }
}

/// Inverter conversion parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InverterConfig {
    /// One-way AC/DC conversion efficiency (0..1].
    pub efficiency: f32,
    /// Continuous inverter power per phase (W).
    pub continuous_power_w: f32,
}

impl Default for InverterConfig {
    fn default() -> Self {
        Self {
            efficiency: 0.9,
            continuous_power_w: 3000.0,
        }
    }
}

/// Grid connection parameters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GridConfig {
    /// Net-metered billing; enables free cross-phase exchange on
    /// three-phase grid-tied systems.
    pub net_metered: bool,
}

/// Battery reservation curve parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReservationConfig {
    /// Reservation at and below `soc_low` (W).
    pub max_w: f32,
    /// SoC below which the full reservation applies (0.0–1.0).
    pub soc_low: f32,
    /// SoC at and above which nothing is reserved (0.0–1.0).
    pub soc_high: f32,
    /// SoC below which everything is withheld regardless of the curve.
    pub keep_alive_soc: f32,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            max_w: 1500.0,
            soc_low: 0.45,
            soc_high: 0.90,
            keep_alive_soc: 0.05,
        }
    }
}

/// One managed device.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    /// Bus id of the resource manager.
    pub rm_id: String,
    /// Allocation order; lower numbers are served first.
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Consumer class; secondaries yield to the battery reservation.
    #[serde(default = "default_class")]
    pub class: ConsumerClass,
}

fn default_priority() -> u32 {
    100
}

fn default_class() -> ConsumerClass {
    ConsumerClass::Secondary
}

/// Configuration error with field path and constraint description.
#[derive(Debug)]
pub struct ConfigError {
    /// Dotted field path (e.g., `"engine.tick_interval_s"`).
    pub field: String,
    /// Human-readable constraint description.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config error: {} — {}", self.field, self.message)
    }
}

impl EmsConfig {
    /// A single managed EV charger, useful for demo runs without a file.
    pub fn demo() -> Self {
        Self {
            devices: vec![DeviceConfig {
                rm_id: "evse-demo".to_string(),
                priority: 1,
                class: ConsumerClass::Secondary,
            }],
            ..Self::default()
        }
    }

    /// Parses configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the TOML is invalid.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError {
            field: "config".to_string(),
            message: format!("cannot read \"{}\": {e}", path.display()),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the TOML is invalid or contains unknown fields.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError {
            field: "toml".to_string(),
            message: e.to_string(),
        })
    }

    /// Validates all fields and returns a list of errors.
    ///
    /// Returns an empty vector if configuration is valid.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let e = &self.engine;

        if e.tick_interval_s == 0 {
            errors.push(ConfigError {
                field: "engine.tick_interval_s".into(),
                message: "must be > 0".into(),
            });
        }
        if e.keepalive_interval_s == 0 {
            errors.push(ConfigError {
                field: "engine.keepalive_interval_s".into(),
                message: "must be > 0".into(),
            });
        }
        if e.request_ttl_s == 0 {
            errors.push(ConfigError {
                field: "engine.request_ttl_s".into(),
                message: "must be > 0".into(),
            });
        }
        if e.balancing_headroom_w < 0.0 {
            errors.push(ConfigError {
                field: "engine.balancing_headroom_w".into(),
                message: "must be >= 0".into(),
            });
        }
        if e.client_id.is_empty() {
            errors.push(ConfigError {
                field: "engine.client_id".into(),
                message: "must not be empty".into(),
            });
        }

        let inv = &self.inverter;
        if !(inv.efficiency > 0.0 && inv.efficiency <= 1.0) {
            errors.push(ConfigError {
                field: "inverter.efficiency".into(),
                message: "must be in (0.0, 1.0]".into(),
            });
        }
        if inv.continuous_power_w < 0.0 {
            errors.push(ConfigError {
                field: "inverter.continuous_power_w".into(),
                message: "must be >= 0".into(),
            });
        }

        let r = &self.reservation;
        if r.max_w < 0.0 {
            errors.push(ConfigError {
                field: "reservation.max_w".into(),
                message: "must be >= 0".into(),
            });
        }
        if !(0.0..=1.0).contains(&r.keep_alive_soc)
            || r.keep_alive_soc > r.soc_low
            || r.soc_low >= r.soc_high
            || r.soc_high > 1.0
        {
            errors.push(ConfigError {
                field: "reservation.soc_low".into(),
                message: "breakpoints must satisfy 0 <= keep_alive_soc <= soc_low < soc_high <= 1"
                    .into(),
            });
        }

        for (index, device) in self.devices.iter().enumerate() {
            if device.rm_id.is_empty() {
                errors.push(ConfigError {
                    field: format!("devices[{index}].rm_id"),
                    message: "must not be empty".into(),
                });
            }
            if self.devices[..index].iter().any(|d| d.rm_id == device.rm_id) {
                errors.push(ConfigError {
                    field: format!("devices[{index}].rm_id"),
                    message: format!("duplicate rm_id \"{}\"", device.rm_id),
                });
            }
        }

        errors
    }
}
