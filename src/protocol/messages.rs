//! Wire model of the flexibility-negotiation protocol.
//!
//! Every message variant carries a `message_id`; replies reference it as
//! `subject_id`. The enum is closed and matched exhaustively, so adding a
//! message type is a compile-time-checked change everywhere it is handled.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::Commodity;

/// Protocol version this engine implements.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Correlates a reply to the request that caused it.
pub type MessageId = Uuid;
/// Identifies one operation mode within a resource manager's catalog.
pub type ModeId = Uuid;
/// Identifies one timer within a resource manager's catalog.
pub type TimerId = Uuid;

/// Control types a resource manager can offer.
///
/// Only operation-mode based control and the not-controllable fallback are
/// implemented; anything else a device offers is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlType {
    OperationModeBased,
    NotControllable,
}

/// Outcome of receiving one application message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceptionCode {
    Ok,
    TemporaryError,
    PermanentError,
    InvalidContent,
}

/// One (commodity, min, max) power band of an operation mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerRange {
    pub commodity: Commodity,
    pub min_w: f32,
    pub max_w: f32,
}

/// A discrete power state a resource manager can occupy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationMode {
    pub id: ModeId,
    pub label: String,
    pub ranges: Vec<PowerRange>,
}

impl OperationMode {
    /// Sum of the range maxima (W); catalogs sort descending on this.
    pub fn max_total_w(&self) -> f32 {
        self.ranges.iter().map(|r| r.max_w).sum()
    }

    /// Sum of the range minima (W); the cheapest power this mode accepts.
    pub fn min_total_w(&self) -> f32 {
        self.ranges.iter().map(|r| r.min_w).sum()
    }
}

/// A permitted switch between two operation modes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: ModeId,
    pub to: ModeId,
    /// Timers started when this transition is taken.
    #[serde(default)]
    pub start_timers: Vec<TimerId>,
    /// Timers that must not be running for this transition to be taken.
    #[serde(default)]
    pub blocking_timers: Vec<TimerId>,
}

/// Wire form of a catalog timer; the running state lives engine-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSpec {
    pub id: TimerId,
    pub duration_s: u64,
}

/// One measured (commodity, value) pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerValue {
    pub commodity: Commodity,
    pub value_w: f32,
}

/// All messages exchanged with a resource manager.
///
/// `Connect`/`Disconnect`/`KeepAlive`/`KeepAliveReply` are bus-session
/// control messages; the rest are application messages, each of which must
/// receive exactly one `ReceptionStatus` reply (except `ReceptionStatus`
/// itself).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type")]
pub enum ProtocolMessage {
    Connect {
        message_id: MessageId,
        client_id: String,
        keepalive_interval_s: u64,
    },
    Disconnect {
        message_id: MessageId,
        client_id: String,
        reason: String,
    },
    KeepAlive {
        message_id: MessageId,
        client_id: String,
    },
    KeepAliveReply {
        subject_id: MessageId,
        alive: bool,
    },
    Handshake {
        message_id: MessageId,
        supported_versions: Vec<String>,
    },
    HandshakeResponse {
        message_id: MessageId,
        selected_version: String,
    },
    ResourceManagerDetails {
        message_id: MessageId,
        name: String,
        available_control_types: Vec<ControlType>,
    },
    SelectControlType {
        message_id: MessageId,
        control_type: ControlType,
    },
    ReceptionStatus {
        subject_id: MessageId,
        status: ReceptionCode,
        diagnostic_label: Option<String>,
    },
    SystemDescription {
        message_id: MessageId,
        operation_modes: Vec<OperationMode>,
        transitions: Vec<Transition>,
        timers: Vec<TimerSpec>,
    },
    Status {
        message_id: MessageId,
        active_mode_id: ModeId,
    },
    Instruction {
        message_id: MessageId,
        mode_id: ModeId,
        factor: f32,
        execution_time_ms: u64,
    },
    PowerMeasurement {
        message_id: MessageId,
        values: Vec<PowerValue>,
    },
}

impl ProtocolMessage {
    /// The id replies should reference, if this message carries one.
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            ProtocolMessage::Connect { message_id, .. }
            | ProtocolMessage::Disconnect { message_id, .. }
            | ProtocolMessage::KeepAlive { message_id, .. }
            | ProtocolMessage::Handshake { message_id, .. }
            | ProtocolMessage::HandshakeResponse { message_id, .. }
            | ProtocolMessage::ResourceManagerDetails { message_id, .. }
            | ProtocolMessage::SelectControlType { message_id, .. }
            | ProtocolMessage::SystemDescription { message_id, .. }
            | ProtocolMessage::Status { message_id, .. }
            | ProtocolMessage::Instruction { message_id, .. }
            | ProtocolMessage::PowerMeasurement { message_id, .. } => Some(*message_id),
            ProtocolMessage::ReceptionStatus { .. }
            | ProtocolMessage::KeepAliveReply { .. } => None,
        }
    }

    /// Short name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            ProtocolMessage::Connect { .. } => "Connect",
            ProtocolMessage::Disconnect { .. } => "Disconnect",
            ProtocolMessage::KeepAlive { .. } => "KeepAlive",
            ProtocolMessage::KeepAliveReply { .. } => "KeepAliveReply",
            ProtocolMessage::Handshake { .. } => "Handshake",
            ProtocolMessage::HandshakeResponse { .. } => "HandshakeResponse",
            ProtocolMessage::ResourceManagerDetails { .. } => "ResourceManagerDetails",
            ProtocolMessage::SelectControlType { .. } => "SelectControlType",
            ProtocolMessage::ReceptionStatus { .. } => "ReceptionStatus",
            ProtocolMessage::SystemDescription { .. } => "SystemDescription",
            ProtocolMessage::Status { .. } => "Status",
            ProtocolMessage::Instruction { .. } => "Instruction",
            ProtocolMessage::PowerMeasurement { .. } => "PowerMeasurement",
        }
    }
}

/// One addressed message on the local bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Bus id of the sender.
    pub from: String,
    /// Bus id of the recipient.
    pub to: String,
    pub message: ProtocolMessage,
}

impl Envelope {
    pub fn new(from: impl Into<String>, to: impl Into<String>, message: ProtocolMessage) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_roundtrip_through_json() {
        let msg = ProtocolMessage::Handshake {
            message_id: Uuid::from_u128(7),
            supported_versions: vec!["1.0".to_string()],
        };
        let json = serde_json::to_string(&msg).expect("serialize");
        assert!(json.contains("\"message_type\":\"Handshake\""));
        let back: ProtocolMessage = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, msg);
    }

    #[test]
    fn unknown_discriminant_is_rejected() {
        let json = r#"{"message_type":"SelfDestruct","message_id":"00000000-0000-0000-0000-000000000001"}"#;
        assert!(serde_json::from_str::<ProtocolMessage>(json).is_err());
    }

    #[test]
    fn reception_status_carries_no_own_id() {
        let msg = ProtocolMessage::ReceptionStatus {
            subject_id: Uuid::from_u128(1),
            status: ReceptionCode::Ok,
            diagnostic_label: None,
        };
        assert_eq!(msg.message_id(), None);
    }

    #[test]
    fn mode_totals_sum_ranges() {
        let mode = OperationMode {
            id: Uuid::from_u128(1),
            label: "fast".to_string(),
            ranges: vec![
                PowerRange {
                    commodity: Commodity::ThreePhase,
                    min_w: 1200.0,
                    max_w: 4200.0,
                },
                PowerRange {
                    commodity: Commodity::Dc,
                    min_w: 0.0,
                    max_w: 300.0,
                },
            ],
        };
        assert_eq!(mode.min_total_w(), 1200.0);
        assert_eq!(mode.max_total_w(), 4500.0);
    }
}
