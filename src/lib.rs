//! Phase-aware surplus-power allocation for solar/battery installations.
//!
//! Negotiates with resource managers (EV chargers, switchable loads) over a
//! flexibility protocol and decides, every control cycle, which device may
//! consume how much of the current AC/DC surplus.

#[cfg(feature = "api")]
pub mod api;
pub mod config;
/// Control loop, telemetry boundary, and published read state.
pub mod engine;
pub mod ledger;
pub mod protocol;
/// Reference resource manager for demos and tests.
pub mod rm;
pub mod session;
