//! Per-device negotiation sessions.

/// Operation-mode catalog and timer bookkeeping.
pub mod modes;
pub mod session;

pub use modes::{ModeCatalog, Timer};
pub use session::{
    CommitOutcome, ConsumerClass, DeviceSession, EndReason, SessionSettings, SessionState,
    MAX_COMMIT_ATTEMPTS,
};
