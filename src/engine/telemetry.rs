//! Aggregated system telemetry consumed by the control loop.
//!
//! The arithmetic that folds raw meter, inverter, and battery readings into
//! these totals lives outside this crate; one snapshot arrives per tick.

use serde::{Deserialize, Serialize};

/// Who decides the battery charge rate right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargeStrategy {
    /// This engine derives the reservation from state of charge.
    #[default]
    Internal,
    /// An external controller owns the charge rate.
    External,
    /// A time schedule owns the charge rate.
    Scheduled,
}

/// One tick's worth of aggregated readings, AC values per phase (index 0 =
/// L1), powers in watts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemSnapshot {
    /// PV production feeding the grid side, per phase (W).
    pub pv_on_grid_w: [f32; 3],
    /// PV production feeding the output side, per phase (W).
    pub pv_on_output_w: [f32; 3],
    /// DC-coupled PV production (W).
    pub pv_on_dc_w: f32,
    /// Consumption per phase, managed devices included (W).
    pub consumption_w: [f32; 3],
    /// Battery power (W, positive = charging).
    pub battery_power_w: f32,
    /// Battery state of charge (0.0–1.0) when the BMS reports one.
    pub battery_soc: Option<f32>,
    /// Battery voltage (V), for converting BMS current limits to power.
    pub battery_voltage_v: f32,
    /// Active BMS charge current limit (A), if any.
    pub charge_current_limit_a: Option<f32>,
    /// External charge-rate override (W), if any.
    pub charge_rate_override_w: Option<f32>,
    /// Who owns the battery charge rate.
    pub strategy: ChargeStrategy,
    /// Grid-tied vs off-grid, once known.
    pub grid_tied: Option<bool>,
    /// Number of grid phases, once known.
    pub phase_count: Option<u8>,
    /// Whether feeding surplus into the grid is permitted, once known.
    pub feed_in_allowed: Option<bool>,
}
