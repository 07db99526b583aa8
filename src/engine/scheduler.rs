//! The periodic control loop: one ledger per tick, devices in priority order.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EmsConfig;
use crate::ledger::{AllocationPolicy, Phase, PhaseVector, PowerLedger};
use crate::protocol::{Envelope, MessageBus};
use crate::session::{CommitOutcome, DeviceSession, SessionSettings};

use super::reservation::ReservationCurve;
use super::state::{ConsumerTotals, DeviceSummary, EngineState};
use super::telemetry::SystemSnapshot;
use super::topology::TopologyFlags;

/// What one tick did, mostly for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Topology flags unresolved; allocation skipped, retried next tick.
    TopologyUndetermined,
    /// Neither surplus nor managed consumption; nothing to decide.
    Idle,
    /// An unconfirmed instruction was re-issued; the rest of the tick waited.
    Reissued(String),
    /// One device was committed to a new mode.
    Committed(String),
    /// Every device kept its mode.
    NoChange,
}

/// Owns all device sessions and runs the per-tick allocation.
///
/// Devices are evaluated in a stable (priority, id) order and at most one
/// mode change is committed per tick, bounding physical switching and
/// letting fresh status reports drive the next decision.
pub struct AllocationScheduler {
    policy: AllocationPolicy,
    net_metered: bool,
    reservation: ReservationCurve,
    sessions: Vec<DeviceSession>,
    published: EngineState,
}

impl AllocationScheduler {
    /// Builds the scheduler and one session per configured device.
    pub fn from_config(config: &EmsConfig, bus: Arc<dyn MessageBus>) -> Self {
        let settings = SessionSettings {
            client_id: config.engine.client_id.clone(),
            keepalive_interval: config.engine.keepalive_interval(),
            reconnect_delay: config.engine.reconnect_delay(),
            request_ttl: config.engine.request_ttl(),
        };

        let mut devices = config.devices.clone();
        devices.sort_by(|a, b| (a.priority, &a.rm_id).cmp(&(b.priority, &b.rm_id)));
        let sessions = devices
            .into_iter()
            .map(|d| {
                DeviceSession::new(d.rm_id, d.priority, d.class, settings.clone(), bus.clone())
            })
            .collect();

        Self {
            policy: AllocationPolicy {
                efficiency: config.inverter.efficiency,
                continuous_power_w: config.inverter.continuous_power_w,
                saldating: false,
                headroom_w: config.engine.balancing_headroom_w,
            },
            net_metered: config.grid.net_metered,
            reservation: ReservationCurve::new(
                config.reservation.max_w,
                config.reservation.soc_low,
                config.reservation.soc_high,
                config.reservation.keep_alive_soc,
            ),
            sessions,
            published: EngineState::default(),
        }
    }

    /// Starts connecting every configured device.
    pub fn start(&mut self, now: Instant) {
        for session in &mut self.sessions {
            session.begin(now);
        }
    }

    /// Routes one inbound envelope to the session it belongs to.
    pub fn handle_envelope(&mut self, envelope: &Envelope, now: Instant) {
        let Some(session) = self
            .sessions
            .iter_mut()
            .find(|s| s.rm_id() == envelope.from)
        else {
            debug!(from = %envelope.from, "message from unknown device");
            return;
        };
        session.handle_message(&envelope.message, now);
    }

    pub fn sessions(&self) -> &[DeviceSession] {
        &self.sessions
    }

    pub fn session_mut(&mut self, rm_id: &str) -> Option<&mut DeviceSession> {
        self.sessions.iter_mut().find(|s| s.rm_id() == rm_id)
    }

    /// The read state as of the last tick.
    pub fn published(&self) -> &EngineState {
        &self.published
    }

    /// Runs one control cycle against fresh telemetry.
    pub fn tick(&mut self, snapshot: &SystemSnapshot, now: Instant) -> TickOutcome {
        // Session upkeep first: reconnects, correlation sweeps, liveness.
        for session in &mut self.sessions {
            session.poll(now);
        }

        let Some(topology) = TopologyFlags::resolve(snapshot, self.net_metered) else {
            debug!("topology not yet determined, skipping allocation");
            self.publish(false, 0.0, super::reservation::ReservationSource::Error, None);
            return TickOutcome::TopologyUndetermined;
        };

        let (reservation_w, reservation_source) = self.reservation.compute(snapshot);

        // Raw consumption already nets managed devices out; add their live
        // readings back so the ledger sees the power they could release.
        let mut managed = PhaseVector::default();
        for session in &self.sessions {
            if session.is_initialized() {
                managed += *session.last_power();
            }
        }

        let available = availability_from(snapshot, managed);
        let policy = AllocationPolicy {
            saldating: topology.saldating,
            ..self.policy
        };
        let mut ledger =
            PowerLedger::new(available, reservation_w, snapshot.battery_power_w, policy);

        if ledger.available_total() <= 0.0 && managed.total() <= 0.0 {
            self.publish(false, reservation_w, reservation_source, Some(topology));
            return TickOutcome::Idle;
        }
        self.publish(true, reservation_w, reservation_source, Some(topology));

        // Never more than one outstanding instruction system-wide: an
        // unconfirmed change is re-issued and the rest of the tick waits for
        // the device's status report.
        if let Some(session) = self
            .sessions
            .iter_mut()
            .find(|s| s.awaiting_confirmation())
        {
            let rm_id = session.rm_id().to_string();
            if session.commit_pending(now) == CommitOutcome::TornDown {
                warn!(rm = %rm_id, "dropped stuck device from the active set");
            }
            return TickOutcome::Reissued(rm_id);
        }

        for index in 0..self.sessions.len() {
            let session = &mut self.sessions[index];
            session.allocate(&mut ledger, now);
            if session.has_pending_change() {
                let rm_id = session.rm_id().to_string();
                info!(
                    rm = %rm_id,
                    target = ?session.pending_mode(),
                    "committing mode change"
                );
                if session.commit_pending(now) == CommitOutcome::TornDown {
                    warn!(rm = %rm_id, "dropped stuck device from the active set");
                }
                return TickOutcome::Committed(rm_id);
            }
        }
        TickOutcome::NoChange
    }

    fn publish(
        &mut self,
        engine_active: bool,
        reservation_w: f32,
        reservation_source: super::reservation::ReservationSource,
        topology: Option<TopologyFlags>,
    ) {
        let mut primary = PhaseVector::default();
        let mut secondary = PhaseVector::default();
        let mut devices = Vec::with_capacity(self.sessions.len());
        for session in &self.sessions {
            if session.is_initialized() {
                if session.class().is_primary() {
                    primary += *session.last_power();
                } else {
                    secondary += *session.last_power();
                }
            }
            devices.push(DeviceSummary {
                rm_id: session.rm_id().to_string(),
                state: format!("{:?}", session.state()),
                priority: session.priority(),
                class: session.class(),
                active_mode: session.active_mode(),
                pending_mode: session.pending_mode(),
                power_w: session.last_power().total(),
            });
        }
        self.published = EngineState {
            engine_active,
            reservation_w,
            reservation_source,
            topology,
            primary: ConsumerTotals::from_power(primary),
            secondary: ConsumerTotals::from_power(secondary),
            devices,
        };
    }
}

/// Builds the ledger's availability vector from telemetry plus the managed
/// draw being added back.
///
/// Any per-phase deficit is folded into the DC term: the battery is covering
/// that shortfall right now, so it reduces what the DC bus can fund.
fn availability_from(snapshot: &SystemSnapshot, managed: PhaseVector) -> PhaseVector {
    let mut available = PhaseVector::default();
    for (index, phase) in Phase::ALL.into_iter().enumerate() {
        *available.phase_mut(phase) = snapshot.pv_on_grid_w[index]
            + snapshot.pv_on_output_w[index]
            - snapshot.consumption_w[index];
    }
    available += managed;
    available.dc += snapshot.pv_on_dc_w + snapshot.battery_power_w.max(0.0);

    for phase in Phase::ALL {
        let value = available.phase(phase);
        if value < 0.0 {
            available.dc += value;
            *available.phase_mut(phase) = 0.0;
        }
    }
    available
}
