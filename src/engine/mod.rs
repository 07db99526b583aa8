//! Control loop, telemetry boundary, and published read state.

/// Battery reservation computation.
pub mod reservation;
/// The per-tick allocation scheduler.
pub mod scheduler;
/// Read state published to supervisory collaborators.
pub mod state;
pub mod telemetry;
/// Topology flag resolution.
pub mod topology;

pub use reservation::{ReservationCurve, ReservationSource};
pub use scheduler::{AllocationScheduler, TickOutcome};
pub use state::{ConsumerTotals, DeviceSummary, EngineState};
pub use telemetry::{ChargeStrategy, SystemSnapshot};
pub use topology::TopologyFlags;
