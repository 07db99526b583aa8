//! System-topology flags the allocation rules depend on.

use serde::Serialize;

use super::telemetry::SystemSnapshot;

/// Resolved topology for one tick.
///
/// Allocation is skipped while any of the inputs is still unknown, typically
/// right after startup before all collaborators have reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TopologyFlags {
    pub grid_tied: bool,
    pub phase_count: u8,
    pub feed_in_allowed: bool,
    /// Net-metered phase-symmetric connection; cross-phase exchange is
    /// billed as free.
    pub saldating: bool,
}

impl TopologyFlags {
    /// Resolves the flags from telemetry, or `None` while undetermined.
    pub fn resolve(snapshot: &SystemSnapshot, net_metered: bool) -> Option<Self> {
        let grid_tied = snapshot.grid_tied?;
        let phase_count = snapshot.phase_count?;
        let feed_in_allowed = snapshot.feed_in_allowed?;
        if !(1..=3).contains(&phase_count) {
            return None;
        }
        Some(Self {
            grid_tied,
            phase_count,
            feed_in_allowed,
            saldating: grid_tied && net_metered && phase_count == 3 && feed_in_allowed,
        })
    }
}
