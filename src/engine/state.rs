//! Read state published to supervisory and UI collaborators.

use std::fmt;

use serde::Serialize;

use crate::ledger::PhaseVector;
use crate::protocol::ModeId;
use crate::session::ConsumerClass;

use super::reservation::ReservationSource;
use super::topology::TopologyFlags;

/// Aggregated draw of one consumer class.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ConsumerTotals {
    pub power: PhaseVector,
    pub total_w: f32,
}

impl ConsumerTotals {
    pub fn from_power(power: PhaseVector) -> Self {
        Self {
            power,
            total_w: power.total(),
        }
    }
}

/// One session's externally visible condition.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub rm_id: String,
    pub state: String,
    pub priority: u32,
    pub class: ConsumerClass,
    pub active_mode: Option<ModeId>,
    pub pending_mode: Option<ModeId>,
    pub power_w: f32,
}

/// Snapshot of the engine for supervisory readers, rebuilt every tick.
#[derive(Debug, Clone, Serialize)]
pub struct EngineState {
    /// `false` while allocation is skipped (no topology, or nothing to do).
    pub engine_active: bool,
    pub reservation_w: f32,
    pub reservation_source: ReservationSource,
    pub topology: Option<TopologyFlags>,
    pub primary: ConsumerTotals,
    pub secondary: ConsumerTotals,
    pub devices: Vec<DeviceSummary>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            engine_active: false,
            reservation_w: 0.0,
            reservation_source: ReservationSource::Error,
            topology: None,
            primary: ConsumerTotals::default(),
            secondary: ConsumerTotals::default(),
            devices: Vec::new(),
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "engine={} | reserve={:.0}W ({:?}) | primary={:.0}W secondary={:.0}W | devices={}",
            if self.engine_active { "active" } else { "idle" },
            self.reservation_w,
            self.reservation_source,
            self.primary.total_w,
            self.secondary.total_w,
            self.devices.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_follow_the_phase_vector() {
        let totals = ConsumerTotals::from_power(PhaseVector::new(100.0, 200.0, 300.0, 0.0));
        assert_eq!(totals.total_w, 600.0);
    }

    #[test]
    fn display_does_not_panic() {
        let state = EngineState::default();
        assert!(!format!("{state}").is_empty());
    }
}
