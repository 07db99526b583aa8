//! Per-tick transactional accounting of surplus power.

/// Claim/commit/rollback ledger over the per-tick surplus.
pub mod ledger;
/// Phase-resolved power vectors and commodity addressing.
pub mod phase;

pub use ledger::{AllocationPolicy, PowerLedger};
pub use phase::{Commodity, Phase, PhaseVector};
