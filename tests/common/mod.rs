//! Shared test fixtures: an in-process engine + reference RM harness.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

use surplus_ems::config::{DeviceConfig, EmsConfig};
use surplus_ems::engine::{AllocationScheduler, SystemSnapshot};
use surplus_ems::protocol::{Envelope, LocalBus};
use surplus_ems::rm::ReferenceRm;
use surplus_ems::session::ConsumerClass;

/// A resolved three-phase grid-tied system with a mostly full battery.
pub fn sunny_snapshot() -> SystemSnapshot {
    SystemSnapshot {
        pv_on_grid_w: [2000.0, 2000.0, 2000.0],
        consumption_w: [200.0, 200.0, 200.0],
        battery_power_w: 800.0,
        battery_soc: Some(0.95),
        battery_voltage_v: 48.0,
        grid_tied: Some(true),
        phase_count: Some(3),
        feed_in_allowed: Some(true),
        ..SystemSnapshot::default()
    }
}

/// Same system after sunset; `charger_draw_w` is what the managed charger
/// is currently metered at, split over the three phases.
pub fn dark_snapshot(charger_draw_w: f32) -> SystemSnapshot {
    let per_phase = charger_draw_w / 3.0;
    SystemSnapshot {
        consumption_w: [per_phase, per_phase, per_phase],
        battery_power_w: -200.0,
        battery_soc: Some(0.95),
        battery_voltage_v: 48.0,
        grid_tied: Some(true),
        phase_count: Some(3),
        feed_in_allowed: Some(true),
        ..SystemSnapshot::default()
    }
}

pub fn device(rm_id: &str, priority: u32, class: ConsumerClass) -> DeviceConfig {
    DeviceConfig {
        rm_id: rm_id.to_string(),
        priority,
        class,
    }
}

/// Engine, bus, and scripted RMs wired together; message delivery is pumped
/// manually so every test is deterministic.
pub struct Harness {
    pub scheduler: AllocationScheduler,
    pub config: EmsConfig,
    engine_inbox: UnboundedReceiver<Envelope>,
    rms: Vec<(ReferenceRm, UnboundedReceiver<Envelope>)>,
}

impl Harness {
    pub fn new(devices: Vec<DeviceConfig>) -> Self {
        let config = EmsConfig {
            devices,
            ..EmsConfig::default()
        };
        let bus = LocalBus::new();
        let engine_inbox = bus.attach(&config.engine.client_id);
        let rms = config
            .devices
            .iter()
            .map(|d| {
                let inbox = bus.attach(&d.rm_id);
                let rm = ReferenceRm::ev_charger(
                    d.rm_id.clone(),
                    config.engine.client_id.clone(),
                    Arc::new(bus.clone()),
                );
                (rm, inbox)
            })
            .collect();
        let scheduler = AllocationScheduler::from_config(&config, Arc::new(bus));
        Self {
            scheduler,
            config,
            engine_inbox,
            rms,
        }
    }

    pub fn rm_mut(&mut self, rm_id: &str) -> &mut ReferenceRm {
        &mut self
            .rms
            .iter_mut()
            .find(|(rm, _)| rm.rm_id() == rm_id)
            .expect("rm exists")
            .0
    }

    /// Delivers queued messages in both directions until the bus is quiet.
    pub fn pump(&mut self, now: Instant) {
        loop {
            let mut progressed = false;
            for (rm, inbox) in &mut self.rms {
                while let Ok(envelope) = inbox.try_recv() {
                    rm.handle_envelope(&envelope);
                    progressed = true;
                }
            }
            while let Ok(envelope) = self.engine_inbox.try_recv() {
                self.scheduler.handle_envelope(&envelope, now);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    /// Connects every device and runs the negotiation to completion.
    pub fn connect_all(&mut self, now: Instant) {
        self.scheduler.start(now);
        self.pump(now);
    }
}
