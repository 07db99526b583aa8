//! Reference resource manager: a scripted EV-charger-like peer.
//!
//! Plays the device side of the negotiation so the engine can be exercised
//! end to end in one process — by the demo binary and by integration tests.
//! It is deliberately obedient by default; the `obey_instructions` and
//! `answer_probes` switches turn it into a stuck or dead peer.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;
use uuid::Uuid;

use crate::ledger::Commodity;
use crate::protocol::{
    ControlType, Envelope, MessageBus, ModeId, OperationMode, PowerRange, ProtocolMessage,
    ReceptionCode, TimerId, TimerSpec, Transition, PROTOCOL_VERSION,
};

/// A three-mode EV charger catalog with a restart cooldown.
pub const OFF_MODE: ModeId = Uuid::from_u128(0xE0);
/// Single-phase charging at 6 A.
pub const SLOW_MODE: ModeId = Uuid::from_u128(0xE1);
/// Three-phase charging at 6 A.
pub const FAST_MODE: ModeId = Uuid::from_u128(0xE2);
/// Started when charging stops; blocks restarting while running.
pub const COOLDOWN_TIMER: TimerId = Uuid::from_u128(0xE9);

pub struct ReferenceRm {
    rm_id: String,
    engine_id: String,
    bus: Arc<dyn MessageBus>,
    name: String,
    control_types: Vec<ControlType>,
    modes: Vec<OperationMode>,
    transitions: Vec<Transition>,
    timers: Vec<TimerSpec>,
    active_mode: ModeId,
    factor: f32,
    /// When `false`, instructions are ignored entirely (a stuck device).
    pub obey_instructions: bool,
    /// When `false`, liveness probes go unanswered (a dead device).
    pub answer_probes: bool,
}

impl ReferenceRm {
    /// Builds an RM with an explicit catalog; `initial_mode` must be in it.
    pub fn new(
        rm_id: impl Into<String>,
        engine_id: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        name: impl Into<String>,
        modes: Vec<OperationMode>,
        transitions: Vec<Transition>,
        timers: Vec<TimerSpec>,
        initial_mode: ModeId,
    ) -> Self {
        assert!(
            modes.iter().any(|m| m.id == initial_mode),
            "initial mode must be part of the catalog"
        );
        Self {
            rm_id: rm_id.into(),
            engine_id: engine_id.into(),
            bus,
            name: name.into(),
            control_types: vec![ControlType::OperationModeBased],
            modes,
            transitions,
            timers,
            active_mode: initial_mode,
            factor: 0.0,
            obey_instructions: true,
            answer_probes: true,
        }
    }

    /// The stock EV charger: off / slow (1.4 kW on L1) / fast (4.1 kW
    /// symmetric), full transition mesh, 60 s restart cooldown after a stop.
    pub fn ev_charger(
        rm_id: impl Into<String>,
        engine_id: impl Into<String>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        let range = |commodity, min_w, max_w| PowerRange {
            commodity,
            min_w,
            max_w,
        };
        let modes = vec![
            OperationMode {
                id: OFF_MODE,
                label: "off".to_string(),
                ranges: vec![range(Commodity::L1, 0.0, 0.0)],
            },
            OperationMode {
                id: SLOW_MODE,
                label: "slow".to_string(),
                ranges: vec![range(Commodity::L1, 1380.0, 1380.0)],
            },
            OperationMode {
                id: FAST_MODE,
                label: "fast".to_string(),
                ranges: vec![range(Commodity::ThreePhase, 4140.0, 4140.0)],
            },
        ];
        let all = [OFF_MODE, SLOW_MODE, FAST_MODE];
        let mut transitions = Vec::new();
        for from in all {
            for to in all {
                if from == to {
                    continue;
                }
                transitions.push(Transition {
                    from,
                    to,
                    start_timers: if to == OFF_MODE {
                        vec![COOLDOWN_TIMER]
                    } else {
                        vec![]
                    },
                    blocking_timers: if from == OFF_MODE {
                        vec![COOLDOWN_TIMER]
                    } else {
                        vec![]
                    },
                });
            }
        }
        let timers = vec![TimerSpec {
            id: COOLDOWN_TIMER,
            duration_s: 60,
        }];
        Self::new(
            rm_id,
            engine_id,
            bus,
            "reference ev charger",
            modes,
            transitions,
            timers,
            OFF_MODE,
        )
    }

    /// Overrides the control types offered during negotiation.
    pub fn with_control_types(mut self, control_types: Vec<ControlType>) -> Self {
        self.control_types = control_types;
        self
    }

    pub fn rm_id(&self) -> &str {
        &self.rm_id
    }

    pub fn active_mode(&self) -> ModeId {
        self.active_mode
    }

    /// Reacts to one envelope from the engine.
    pub fn handle_envelope(&mut self, envelope: &Envelope) {
        match &envelope.message {
            ProtocolMessage::Connect { message_id, .. } => {
                self.reply(*message_id, ReceptionCode::Ok);
                self.send(ProtocolMessage::Handshake {
                    message_id: Uuid::new_v4(),
                    supported_versions: vec![PROTOCOL_VERSION.to_string()],
                });
            }

            ProtocolMessage::HandshakeResponse { message_id, .. } => {
                self.reply(*message_id, ReceptionCode::Ok);
                self.send(ProtocolMessage::ResourceManagerDetails {
                    message_id: Uuid::new_v4(),
                    name: self.name.clone(),
                    available_control_types: self.control_types.clone(),
                });
            }

            ProtocolMessage::SelectControlType {
                message_id,
                control_type,
            } => {
                self.reply(*message_id, ReceptionCode::Ok);
                if *control_type == ControlType::OperationModeBased {
                    self.send(ProtocolMessage::SystemDescription {
                        message_id: Uuid::new_v4(),
                        operation_modes: self.modes.clone(),
                        transitions: self.transitions.clone(),
                        timers: self.timers.clone(),
                    });
                    self.send_status();
                    self.send_power_measurement();
                }
            }

            ProtocolMessage::Instruction {
                message_id,
                mode_id,
                factor,
                ..
            } => {
                if !self.obey_instructions {
                    debug!(rm = %self.rm_id, "ignoring instruction (scripted as stuck)");
                    return;
                }
                if !self.modes.iter().any(|m| m.id == *mode_id) {
                    self.reply(*message_id, ReceptionCode::InvalidContent);
                    return;
                }
                self.reply(*message_id, ReceptionCode::Ok);
                self.active_mode = *mode_id;
                self.factor = factor.clamp(0.0, 1.0);
                self.send_status();
                self.send_power_measurement();
            }

            ProtocolMessage::KeepAlive { message_id, .. } => {
                if self.answer_probes {
                    self.send(ProtocolMessage::KeepAliveReply {
                        subject_id: *message_id,
                        alive: true,
                    });
                }
            }

            ProtocolMessage::Disconnect { reason, .. } => {
                debug!(rm = %self.rm_id, reason = %reason, "engine disconnected");
            }

            ProtocolMessage::ReceptionStatus { .. } => {}

            other => {
                debug!(rm = %self.rm_id, message = other.type_name(), "ignoring message");
            }
        }
    }

    /// Reports the current operation mode.
    pub fn send_status(&self) {
        self.send(ProtocolMessage::Status {
            message_id: Uuid::new_v4(),
            active_mode_id: self.active_mode,
        });
    }

    /// Reports the draw of the current mode at the instructed factor.
    pub fn send_power_measurement(&self) {
        let mode = self
            .modes
            .iter()
            .find(|m| m.id == self.active_mode)
            .expect("active mode is part of the catalog");
        let values = mode
            .ranges
            .iter()
            .map(|r| crate::protocol::PowerValue {
                commodity: r.commodity,
                value_w: r.min_w + self.factor * (r.max_w - r.min_w),
            })
            .collect();
        self.send(ProtocolMessage::PowerMeasurement {
            message_id: Uuid::new_v4(),
            values,
        });
    }

    /// Drains the inbox until the bus side closes.
    pub async fn run(mut self, mut inbox: UnboundedReceiver<Envelope>) {
        while let Some(envelope) = inbox.recv().await {
            self.handle_envelope(&envelope);
        }
    }

    fn reply(&self, subject_id: crate::protocol::MessageId, status: ReceptionCode) {
        self.send(ProtocolMessage::ReceptionStatus {
            subject_id,
            status,
            diagnostic_label: None,
        });
    }

    fn send(&self, message: ProtocolMessage) {
        let envelope = Envelope::new(self.rm_id.clone(), self.engine_id.clone(), message);
        if let Err(error) = self.bus.send(envelope) {
            debug!(rm = %self.rm_id, %error, "send to engine failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LocalBus;

    #[test]
    fn connect_triggers_handshake() {
        let bus = LocalBus::new();
        let mut engine_rx = bus.attach("engine");
        let mut rm = ReferenceRm::ev_charger("evse", "engine", Arc::new(bus));

        rm.handle_envelope(&Envelope::new(
            "engine",
            "evse",
            ProtocolMessage::Connect {
                message_id: Uuid::from_u128(1),
                client_id: "engine".to_string(),
                keepalive_interval_s: 30,
            },
        ));

        let first = engine_rx.try_recv().expect("reception status expected");
        assert!(matches!(
            first.message,
            ProtocolMessage::ReceptionStatus {
                status: ReceptionCode::Ok,
                ..
            }
        ));
        let second = engine_rx.try_recv().expect("handshake expected");
        assert!(matches!(second.message, ProtocolMessage::Handshake { .. }));
    }

    #[test]
    fn instruction_switches_mode_and_reports() {
        let bus = LocalBus::new();
        let mut engine_rx = bus.attach("engine");
        let mut rm = ReferenceRm::ev_charger("evse", "engine", Arc::new(bus));

        rm.handle_envelope(&Envelope::new(
            "engine",
            "evse",
            ProtocolMessage::Instruction {
                message_id: Uuid::from_u128(2),
                mode_id: SLOW_MODE,
                factor: 1.0,
                execution_time_ms: 0,
            },
        ));
        assert_eq!(rm.active_mode(), SLOW_MODE);

        let mut kinds = Vec::new();
        while let Ok(envelope) = engine_rx.try_recv() {
            kinds.push(envelope.message.type_name());
        }
        assert_eq!(kinds, vec!["ReceptionStatus", "Status", "PowerMeasurement"]);
    }

    #[test]
    fn stuck_rm_ignores_instructions() {
        let bus = LocalBus::new();
        let mut engine_rx = bus.attach("engine");
        let mut rm = ReferenceRm::ev_charger("evse", "engine", Arc::new(bus));
        rm.obey_instructions = false;

        rm.handle_envelope(&Envelope::new(
            "engine",
            "evse",
            ProtocolMessage::Instruction {
                message_id: Uuid::from_u128(3),
                mode_id: FAST_MODE,
                factor: 1.0,
                execution_time_ms: 0,
            },
        ));
        assert_eq!(rm.active_mode(), OFF_MODE);
        assert!(engine_rx.try_recv().is_err());
    }
}
