//! Negotiation-protocol wire model and in-process transport.

/// Message types exchanged with resource managers.
pub mod messages;
/// Local bus, correlation table, and transport faults.
pub mod transport;

pub use messages::{
    ControlType, Envelope, MessageId, ModeId, OperationMode, PowerRange, PowerValue,
    ProtocolMessage, ReceptionCode, TimerId, TimerSpec, Transition, PROTOCOL_VERSION,
};
pub use transport::{Correlator, LocalBus, MessageBus, PendingRequest, RequestKind, TransportError};
