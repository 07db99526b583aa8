//! Per-device negotiation session and allocation entry points.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ledger::{PhaseVector, PowerLedger};
use crate::protocol::{
    ControlType, Correlator, Envelope, MessageBus, MessageId, ModeId, PowerRange,
    ProtocolMessage, ReceptionCode, RequestKind, PROTOCOL_VERSION,
};

use super::modes::ModeCatalog;

/// Instruction re-sends tolerated before the peer is declared stuck.
pub const MAX_COMMIT_ATTEMPTS: u8 = 7;

/// Consecutive unanswered liveness probes that end the session.
const MAX_UNANSWERED_PROBES: u8 = 2;

/// Priority class of a managed consumer.
///
/// Primaries may draw power even below the reservation threshold once
/// consumption is covered; secondaries yield to the battery first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerClass {
    Primary,
    Secondary,
}

impl ConsumerClass {
    pub fn is_primary(&self) -> bool {
        matches!(self, ConsumerClass::Primary)
    }
}

/// Connection/negotiation progress of one resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// Connect sent, acknowledgement outstanding.
    Connecting,
    /// Connect acknowledged, handshake outstanding.
    Connected,
    /// Handshake answered; waiting for the device to introduce itself.
    Initialized,
    /// Control type proposed, acknowledgement outstanding.
    HandshakeAccepted,
    /// Control type acknowledged by the device.
    ControlTypeSelected,
    /// Device offers no controllable interface; tracked but never steered.
    Uncontrollable,
    /// Operation-mode catalog outstanding.
    AwaitingCatalog,
    /// Fully negotiated; participates in allocation.
    Ready,
}

/// Why a session was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Explicit,
    PeerDisconnect,
    LivenessTimeout,
    /// Instruction retry budget exhausted without any status report.
    StaleCommit,
    ConnectRejected,
    HandshakeFailed,
    ControlTypeRejected,
}

/// Result of a `commit_pending` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Nothing pending, or the pending target equals the active mode.
    Idle,
    /// An instruction went out (first send or re-issue).
    Sent,
    /// The retry budget ran out; the session ended.
    TornDown,
}

/// Engine-side knobs shared by all sessions.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Bus id of the engine, used as sender address and connect identity.
    pub client_id: String,
    /// Liveness probe interval.
    pub keepalive_interval: Duration,
    /// Delay before a torn-down session tries to connect again.
    pub reconnect_delay: Duration,
    /// How long an unanswered request stays in the correlation table.
    pub request_ttl: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            client_id: "surplus-ems".to_string(),
            keepalive_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(30),
            request_ttl: Duration::from_secs(90),
        }
    }
}

/// One negotiation session with a resource manager.
///
/// The session owns the full lifecycle: connect, handshake, control-type
/// selection, catalog exchange, status tracking, and the commit-with-retry of
/// mode-change instructions. All transport failures are logged and absorbed;
/// the liveness probe is the only mechanism that reacts to a dead peer.
pub struct DeviceSession {
    rm_id: String,
    priority: u32,
    class: ConsumerClass,
    settings: SessionSettings,
    bus: Arc<dyn MessageBus>,

    state: SessionState,
    control_type: Option<ControlType>,
    catalog: Option<ModeCatalog>,
    active_mode: Option<ModeId>,
    pending_mode: Option<ModeId>,
    pending_factor: f32,
    awaiting_confirmation: bool,
    commit_attempts: u8,
    last_power: PhaseVector,

    correlator: Correlator,
    next_probe_at: Option<Instant>,
    unanswered_probes: u8,
    reconnect_at: Option<Instant>,
}

impl DeviceSession {
    /// Creates a session for a discovered device; call `begin` to connect.
    pub fn new(
        rm_id: impl Into<String>,
        priority: u32,
        class: ConsumerClass,
        settings: SessionSettings,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        let request_ttl = settings.request_ttl;
        Self {
            rm_id: rm_id.into(),
            priority,
            class,
            settings,
            bus,
            state: SessionState::Disconnected,
            control_type: None,
            catalog: None,
            active_mode: None,
            pending_mode: None,
            pending_factor: 0.0,
            awaiting_confirmation: false,
            commit_attempts: 0,
            last_power: PhaseVector::default(),
            correlator: Correlator::new(request_ttl),
            next_probe_at: None,
            unanswered_probes: 0,
            reconnect_at: None,
        }
    }

    pub fn rm_id(&self) -> &str {
        &self.rm_id
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn class(&self) -> ConsumerClass {
        self.class
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn active_mode(&self) -> Option<ModeId> {
        self.active_mode
    }

    pub fn pending_mode(&self) -> Option<ModeId> {
        self.pending_mode
    }

    pub fn awaiting_confirmation(&self) -> bool {
        self.awaiting_confirmation
    }

    pub fn commit_attempts(&self) -> u8 {
        self.commit_attempts
    }

    /// Most recent power measurement reported by the device.
    pub fn last_power(&self) -> &PhaseVector {
        &self.last_power
    }

    /// Past the bus-level connect phase; live readings count toward the
    /// managed total.
    pub fn is_initialized(&self) -> bool {
        !matches!(
            self.state,
            SessionState::Disconnected | SessionState::Connecting | SessionState::Connected
        )
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// A pending target that differs from the active mode.
    pub fn has_pending_change(&self) -> bool {
        self.state == SessionState::Ready
            && self.pending_mode.is_some()
            && self.pending_mode != self.active_mode
    }

    /// Starts connecting. Idempotent: a session that is not `Disconnected`
    /// is left alone.
    pub fn begin(&mut self, now: Instant) {
        if self.state != SessionState::Disconnected {
            return;
        }
        self.reconnect_at = None;
        self.unanswered_probes = 0;
        self.state = SessionState::Connecting;
        self.next_probe_at = Some(now + self.settings.keepalive_interval);
        info!(rm = %self.rm_id, "connecting");
        self.send_tracked(
            ProtocolMessage::Connect {
                message_id: Uuid::new_v4(),
                client_id: self.settings.client_id.clone(),
                keepalive_interval_s: self.settings.keepalive_interval.as_secs(),
            },
            RequestKind::Connect,
            now,
        );
    }

    /// Disconnects. Idempotent; the disconnect notice is best-effort.
    pub fn end(&mut self, now: Instant) {
        self.teardown(EndReason::Explicit, true, now);
    }

    /// Periodic maintenance: reconnect attempts, correlation sweep, and
    /// liveness probing. Call once per engine tick.
    pub fn poll(&mut self, now: Instant) {
        if self.state == SessionState::Disconnected {
            if self.reconnect_at.is_some_and(|at| now >= at) {
                self.begin(now);
            }
            return;
        }

        self.correlator.sweep(now);

        if self.next_probe_at.is_some_and(|at| now >= at) {
            if self.unanswered_probes >= MAX_UNANSWERED_PROBES {
                warn!(rm = %self.rm_id, "liveness probes unanswered, ending session");
                self.teardown(EndReason::LivenessTimeout, false, now);
                return;
            }
            self.unanswered_probes += 1;
            self.next_probe_at = Some(now + self.settings.keepalive_interval);
            self.send_tracked(
                ProtocolMessage::KeepAlive {
                    message_id: Uuid::new_v4(),
                    client_id: self.settings.client_id.clone(),
                },
                RequestKind::KeepAlive,
                now,
            );
        }
    }

    /// Handles one inbound message addressed to this session.
    pub fn handle_message(&mut self, message: &ProtocolMessage, now: Instant) {
        match message {
            ProtocolMessage::ReceptionStatus {
                subject_id, status, ..
            } => self.on_reception_status(*subject_id, *status, now),

            ProtocolMessage::KeepAliveReply { subject_id, alive } => {
                if self.correlator.resolve(*subject_id).is_none() {
                    debug!(rm = %self.rm_id, "keepalive reply for unknown probe");
                    return;
                }
                if *alive {
                    self.unanswered_probes = 0;
                } else {
                    self.teardown(EndReason::PeerDisconnect, false, now);
                }
            }

            ProtocolMessage::KeepAlive { message_id, .. } => {
                self.send(ProtocolMessage::KeepAliveReply {
                    subject_id: *message_id,
                    alive: self.state != SessionState::Disconnected,
                });
            }

            ProtocolMessage::Disconnect { reason, .. } => {
                info!(rm = %self.rm_id, reason = %reason, "peer disconnected");
                self.teardown(EndReason::PeerDisconnect, false, now);
            }

            ProtocolMessage::Handshake {
                message_id,
                supported_versions,
            } => self.on_handshake(*message_id, supported_versions, now),

            ProtocolMessage::ResourceManagerDetails {
                message_id,
                name,
                available_control_types,
            } => self.on_details(*message_id, name, available_control_types, now),

            ProtocolMessage::SystemDescription {
                message_id,
                operation_modes,
                transitions,
                timers,
            } => self.on_system_description(
                *message_id,
                operation_modes.clone(),
                transitions.clone(),
                timers.clone(),
            ),

            ProtocolMessage::Status {
                message_id,
                active_mode_id,
            } => self.on_status(*message_id, *active_mode_id, now),

            ProtocolMessage::PowerMeasurement { message_id, values } => {
                if !self.is_initialized() {
                    self.reply(*message_id, ReceptionCode::TemporaryError, None);
                    return;
                }
                let mut power = PhaseVector::default();
                for value in values {
                    power.add_commodity(value.commodity, value.value_w);
                }
                self.last_power = power;
                self.reply(*message_id, ReceptionCode::Ok, None);
            }

            // These flow engine → device only; a device sending them is
            // talking a different protocol.
            ProtocolMessage::Connect { message_id, .. }
            | ProtocolMessage::HandshakeResponse { message_id, .. }
            | ProtocolMessage::SelectControlType { message_id, .. }
            | ProtocolMessage::Instruction { message_id, .. } => {
                self.reply(
                    *message_id,
                    ReceptionCode::PermanentError,
                    Some("unexpected message direction"),
                );
            }
        }
    }

    /// The allocation core: picks the most expensive operation mode the
    /// device may switch to that the ledger can fund this tick.
    ///
    /// On success the chosen mode becomes the pending target (committed
    /// separately via `commit_pending`) and its claim stays deducted from the
    /// ledger. A transition blocked by a running timer rolls the claim back
    /// and leaves the pending target unchanged.
    pub fn allocate(&mut self, ledger: &mut PowerLedger, now: Instant) -> Option<ModeId> {
        if self.state != SessionState::Ready {
            return None;
        }
        let active = self.active_mode?;
        let reachable = self.catalog.as_ref()?.reachable_from(active);
        let fallback = *reachable.last()?;
        let primary = self.class.is_primary();

        for candidate in reachable {
            let is_fallback = candidate == fallback;
            let (ranges, min_total, max_total) = {
                let mode = self.catalog.as_ref()?.mode(candidate)?;
                (mode.ranges.clone(), mode.min_total_w(), mode.max_total_w())
            };

            // Plainly unaffordable modes are not worth a transaction.
            if !is_fallback && min_total > ledger.available_total() {
                continue;
            }

            ledger.begin();
            let mut delivered = 0.0_f32;
            let satisfied = ranges.iter().all(|range: &PowerRange| {
                let ok = ledger.claim(range.commodity, range.min_w, range.max_w, primary, is_fallback);
                delivered += ledger.last_delivered_w();
                ok
            });
            if !satisfied {
                ledger.rollback();
                continue;
            }

            let blocked = self
                .catalog
                .as_mut()?
                .blocking_remaining_s(active, candidate, now);
            if let Some(remaining_s) = blocked {
                debug!(
                    rm = %self.rm_id,
                    remaining_s,
                    "mode switch blocked by running timer"
                );
                ledger.rollback();
                return None;
            }

            ledger.commit();
            self.pending_mode = Some(candidate);
            self.pending_factor = if max_total > min_total {
                ((delivered - min_total) / (max_total - min_total)).clamp(0.0, 1.0)
            } else {
                1.0
            };
            return Some(candidate);
        }
        None
    }

    /// Sends (or re-issues) the instruction for the pending mode change.
    ///
    /// Each unacknowledged send consumes one attempt; exhausting the budget
    /// tears the session down on the assumption the peer is stuck.
    pub fn commit_pending(&mut self, now: Instant) -> CommitOutcome {
        if self.state != SessionState::Ready {
            return CommitOutcome::Idle;
        }
        let Some(target) = self.pending_mode else {
            return CommitOutcome::Idle;
        };
        if Some(target) == self.active_mode {
            return CommitOutcome::Idle;
        }
        if self.commit_attempts >= MAX_COMMIT_ATTEMPTS {
            warn!(
                rm = %self.rm_id,
                attempts = self.commit_attempts,
                "instruction never confirmed, assuming stuck resource manager"
            );
            self.teardown(EndReason::StaleCommit, true, now);
            return CommitOutcome::TornDown;
        }

        self.commit_attempts += 1;
        self.awaiting_confirmation = true;
        self.send_tracked(
            ProtocolMessage::Instruction {
                message_id: Uuid::new_v4(),
                mode_id: target,
                factor: self.pending_factor,
                execution_time_ms: epoch_ms(),
            },
            RequestKind::Instruction,
            now,
        );
        CommitOutcome::Sent
    }

    fn on_handshake(&mut self, message_id: MessageId, versions: &[String], now: Instant) {
        if self.state != SessionState::Connected {
            self.reply(message_id, ReceptionCode::TemporaryError, None);
            return;
        }
        if !versions.iter().any(|v| v == PROTOCOL_VERSION) {
            warn!(rm = %self.rm_id, ?versions, "no mutually supported protocol version");
            self.reply(
                message_id,
                ReceptionCode::PermanentError,
                Some("unsupported protocol version"),
            );
            self.teardown(EndReason::HandshakeFailed, true, now);
            return;
        }
        self.reply(message_id, ReceptionCode::Ok, None);
        self.send_tracked(
            ProtocolMessage::HandshakeResponse {
                message_id: Uuid::new_v4(),
                selected_version: PROTOCOL_VERSION.to_string(),
            },
            RequestKind::HandshakeResponse,
            now,
        );
        self.state = SessionState::Initialized;
        debug!(rm = %self.rm_id, "handshake answered");
    }

    fn on_details(
        &mut self,
        message_id: MessageId,
        name: &str,
        offered: &[ControlType],
        now: Instant,
    ) {
        if self.state != SessionState::Initialized {
            self.reply(message_id, ReceptionCode::TemporaryError, None);
            return;
        }
        let chosen = if offered.contains(&ControlType::OperationModeBased) {
            ControlType::OperationModeBased
        } else {
            ControlType::NotControllable
        };
        info!(rm = %self.rm_id, name = %name, ?chosen, "resource manager introduced itself");
        self.reply(message_id, ReceptionCode::Ok, None);
        self.control_type = Some(chosen);
        self.state = SessionState::HandshakeAccepted;
        self.send_tracked(
            ProtocolMessage::SelectControlType {
                message_id: Uuid::new_v4(),
                control_type: chosen,
            },
            RequestKind::SelectControlType,
            now,
        );
    }

    fn on_system_description(
        &mut self,
        message_id: MessageId,
        modes: Vec<crate::protocol::OperationMode>,
        transitions: Vec<crate::protocol::Transition>,
        timers: Vec<crate::protocol::TimerSpec>,
    ) {
        let accepts_catalog = self.control_type == Some(ControlType::OperationModeBased)
            && matches!(
                self.state,
                SessionState::AwaitingCatalog | SessionState::Ready
            );
        if !self.is_initialized() || !accepts_catalog {
            self.reply(message_id, ReceptionCode::TemporaryError, None);
            return;
        }
        if modes.is_empty() {
            self.reply(
                message_id,
                ReceptionCode::InvalidContent,
                Some("empty operation mode catalog"),
            );
            return;
        }
        let catalog = ModeCatalog::new(modes, transitions, timers);
        // A replaced catalog may invalidate what we believed was active.
        if self.active_mode.is_some_and(|id| !catalog.contains(id)) {
            self.active_mode = None;
        }
        self.pending_mode = None;
        self.awaiting_confirmation = false;
        self.commit_attempts = 0;
        self.catalog = Some(catalog);
        self.state = SessionState::Ready;
        self.reply(message_id, ReceptionCode::Ok, None);
        info!(rm = %self.rm_id, "operation mode catalog received, session ready");
    }

    fn on_status(&mut self, message_id: MessageId, reported: ModeId, now: Instant) {
        if !self.is_initialized() {
            self.reply(message_id, ReceptionCode::TemporaryError, None);
            return;
        }
        let Some(catalog) = self.catalog.as_mut() else {
            self.reply(message_id, ReceptionCode::TemporaryError, None);
            return;
        };
        if !catalog.contains(reported) {
            // Protocol desync; the next catalog or status may repair it.
            warn!(rm = %self.rm_id, %reported, "status reports unknown operation mode");
            self.reply(message_id, ReceptionCode::TemporaryError, None);
            return;
        }
        if let Some(previous) = self.active_mode {
            if previous != reported {
                catalog.start_transition_timers(previous, reported, now);
            }
        }
        self.active_mode = Some(reported);
        self.pending_mode = None;
        self.pending_factor = 0.0;
        self.awaiting_confirmation = false;
        self.commit_attempts = 0;
        self.reply(message_id, ReceptionCode::Ok, None);
    }

    fn on_reception_status(&mut self, subject_id: MessageId, status: ReceptionCode, now: Instant) {
        let Some(request) = self.correlator.resolve(subject_id) else {
            debug!(rm = %self.rm_id, %subject_id, "reply for unknown or expired request");
            return;
        };
        match request.kind {
            RequestKind::Connect => {
                if status == ReceptionCode::Ok && self.state == SessionState::Connecting {
                    self.state = SessionState::Connected;
                    info!(rm = %self.rm_id, "connected");
                } else {
                    self.teardown(EndReason::ConnectRejected, false, now);
                }
            }
            RequestKind::HandshakeResponse => {
                if status != ReceptionCode::Ok {
                    self.teardown(EndReason::HandshakeFailed, true, now);
                }
            }
            RequestKind::SelectControlType => {
                if status == ReceptionCode::Ok && self.state == SessionState::HandshakeAccepted {
                    self.state = SessionState::ControlTypeSelected;
                    self.state = match self.control_type {
                        Some(ControlType::OperationModeBased) => SessionState::AwaitingCatalog,
                        _ => SessionState::Uncontrollable,
                    };
                } else {
                    self.teardown(EndReason::ControlTypeRejected, true, now);
                }
            }
            RequestKind::Instruction => {
                if status != ReceptionCode::Ok {
                    warn!(rm = %self.rm_id, ?status, "instruction not accepted");
                }
                // Confirmation comes from a Status report, not from here.
            }
            RequestKind::KeepAlive => {}
        }
    }

    fn teardown(&mut self, reason: EndReason, notify: bool, now: Instant) {
        if self.state == SessionState::Disconnected {
            return;
        }
        info!(rm = %self.rm_id, ?reason, "session ending");
        if notify {
            self.send(ProtocolMessage::Disconnect {
                message_id: Uuid::new_v4(),
                client_id: self.settings.client_id.clone(),
                reason: format!("{reason:?}"),
            });
        }
        self.state = SessionState::Disconnected;
        self.control_type = None;
        self.catalog = None;
        self.active_mode = None;
        self.pending_mode = None;
        self.pending_factor = 0.0;
        self.awaiting_confirmation = false;
        self.commit_attempts = 0;
        self.last_power = PhaseVector::default();
        self.correlator.clear();
        self.next_probe_at = None;
        self.unanswered_probes = 0;
        self.reconnect_at = Some(now + self.settings.reconnect_delay);
    }

    fn reply(&self, subject_id: MessageId, status: ReceptionCode, label: Option<&str>) {
        self.send(ProtocolMessage::ReceptionStatus {
            subject_id,
            status,
            diagnostic_label: label.map(str::to_string),
        });
    }

    fn send_tracked(&mut self, message: ProtocolMessage, kind: RequestKind, now: Instant) {
        if let Some(id) = message.message_id() {
            self.correlator.track(id, kind, now);
        }
        self.send(message);
    }

    fn send(&self, message: ProtocolMessage) {
        let envelope = Envelope::new(self.settings.client_id.clone(), self.rm_id.clone(), message);
        if let Err(error) = self.bus.send(envelope) {
            warn!(rm = %self.rm_id, %error, "transport send failed");
        }
    }
}

fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
