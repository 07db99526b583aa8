//! Transactional ledger of surplus power for one control cycle.

use super::phase::{Commodity, Phase, PhaseVector};

/// Tolerance for claim satisfaction and threshold comparisons (W).
const CLAIM_EPS: f32 = 1e-3;

/// Conversion and protection parameters the ledger enforces during claims.
#[derive(Debug, Clone, Copy)]
pub struct AllocationPolicy {
    /// One-way AC/DC conversion efficiency (0..=1].
    pub efficiency: f32,
    /// Continuous inverter power per AC phase (W); caps DC-sourced delivery.
    pub continuous_power_w: f32,
    /// Net-metered phase-symmetric grid connection: cross-phase exchange is
    /// billed as free and is preferred over draining the DC bus.
    pub saldating: bool,
    /// Minimum total power that must remain before a primary consumer may
    /// start drawing (W).
    pub headroom_w: f32,
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        Self {
            efficiency: 0.9,
            continuous_power_w: f32::INFINITY,
            saldating: false,
            headroom_w: 50.0,
        }
    }
}

/// Snapshot taken at `begin()` for rollback.
#[derive(Debug, Clone, Copy)]
struct TxSnapshot {
    available: PhaseVector,
    converted_w: [f32; 3],
}

/// Surplus power available in the current control cycle, with
/// claim/commit/rollback semantics.
///
/// One ledger is built per tick from aggregated telemetry and discarded at
/// the end of that tick. The reservation is deliberately *not* subtracted
/// from `available` up front; it is enforced when a claim would leave less
/// total power than the battery is entitled to.
///
/// Transaction misuse (claim outside `begin()`, nested `begin()`) is a
/// programming error and panics.
///
/// # Examples
///
/// ```
/// use surplus_ems::ledger::{AllocationPolicy, Commodity, PhaseVector, PowerLedger};
///
/// let mut ledger = PowerLedger::new(
///     PhaseVector::new(1000.0, 200.0, 200.0, 200.0),
///     0.0,
///     0.0,
///     AllocationPolicy::default(),
/// );
/// ledger.begin();
/// assert!(ledger.claim(Commodity::L1, 1000.0, 1000.0, false, false));
/// let claim = ledger.commit();
/// assert_eq!(claim.l1, 1000.0);
/// ```
#[derive(Debug, Clone)]
pub struct PowerLedger {
    available: PhaseVector,
    reservation_w: f32,
    battery_rate_w: f32,
    policy: AllocationPolicy,
    /// DC-sourced power already delivered into each AC phase this tick.
    converted_w: [f32; 3],
    open: bool,
    snapshot: Option<TxSnapshot>,
    claimed: PhaseVector,
    last_delivered_w: f32,
}

impl PowerLedger {
    /// Creates a ledger over the given surplus.
    ///
    /// # Arguments
    ///
    /// * `available` - Surplus power per phase and on the DC bus (W)
    /// * `reservation_w` - Power the battery is entitled to withhold (W, >= 0)
    /// * `battery_rate_w` - Current battery charge rate, for diagnostics (W)
    /// * `policy` - Conversion limits and protection thresholds
    ///
    /// # Panics
    ///
    /// Panics if the reservation is negative or the policy is out of range.
    pub fn new(
        available: PhaseVector,
        reservation_w: f32,
        battery_rate_w: f32,
        policy: AllocationPolicy,
    ) -> Self {
        assert!(reservation_w >= 0.0, "reservation must be >= 0");
        assert!(
            policy.efficiency > 0.0 && policy.efficiency <= 1.0,
            "efficiency must be in (0, 1]"
        );
        assert!(
            policy.continuous_power_w >= 0.0,
            "continuous inverter power must be >= 0"
        );
        assert!(policy.headroom_w >= 0.0, "headroom must be >= 0");

        Self {
            available,
            reservation_w,
            battery_rate_w,
            policy,
            converted_w: [0.0; 3],
            open: false,
            snapshot: None,
            claimed: PhaseVector::default(),
            last_delivered_w: 0.0,
        }
    }

    /// Remaining surplus, claims already committed this tick deducted.
    pub fn available(&self) -> &PhaseVector {
        &self.available
    }

    /// Total remaining surplus across all phases and DC (W).
    pub fn available_total(&self) -> f32 {
        self.available.total()
    }

    /// Source-attributed claims accumulated since the last `begin()`.
    pub fn claimed(&self) -> &PhaseVector {
        &self.claimed
    }

    /// Power delivered by the most recent `claim()` call (W).
    pub fn last_delivered_w(&self) -> f32 {
        self.last_delivered_w
    }

    /// The reservation threshold enforced at claim time (W).
    pub fn reservation_w(&self) -> f32 {
        self.reservation_w
    }

    /// Battery charge rate at ledger construction (W, positive = charging).
    pub fn battery_rate_w(&self) -> f32 {
        self.battery_rate_w
    }

    /// `true` while a transaction is open.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Opens a transaction, snapshotting `available` for rollback.
    ///
    /// # Panics
    ///
    /// Panics if a transaction is already open.
    pub fn begin(&mut self) {
        assert!(!self.open, "ledger transaction already open");
        self.snapshot = Some(TxSnapshot {
            available: self.available,
            converted_w: self.converted_w,
        });
        self.claimed = PhaseVector::default();
        self.last_delivered_w = 0.0;
        self.open = true;
    }

    /// Restores the `begin()` snapshot and closes the transaction.
    ///
    /// # Panics
    ///
    /// Panics if no transaction is open.
    pub fn rollback(&mut self) {
        assert!(self.open, "rollback without an open ledger transaction");
        let snap = self.snapshot.take().expect("open transaction has a snapshot");
        self.available = snap.available;
        self.converted_w = snap.converted_w;
        self.claimed = PhaseVector::default();
        self.open = false;
    }

    /// Closes the transaction and returns the accumulated claims.
    ///
    /// `available` keeps its post-claim value for the next caller in the
    /// same tick.
    ///
    /// # Panics
    ///
    /// Panics if no transaction is open.
    pub fn commit(&mut self) -> PhaseVector {
        assert!(self.open, "commit without an open ledger transaction");
        self.snapshot = None;
        self.open = false;
        self.claimed
    }

    /// Attempts to source `max_w` (but at least `min_w`) for the given
    /// commodity from the remaining surplus.
    ///
    /// Sourcing order per shorted phase: same-phase AC, then the DC bus
    /// (lossless), then a foreign AC phase through an implied AC→DC→AC
    /// transfer at a double efficiency penalty. On saldating topologies the
    /// cross-phase exchange is billed as free and runs before the DC bus, at
    /// a single penalty.
    ///
    /// With `force`, any residual is taken unconditionally from DC — even
    /// below zero — so the cheapest mode of a device is always selectable;
    /// forced claims bypass the reservation and headroom gates.
    ///
    /// Returns `false` when the claim cannot be satisfied or would violate
    /// the reservation/headroom gates; the partial deduction stays in place
    /// and the caller must `rollback()`.
    ///
    /// # Panics
    ///
    /// Panics if no transaction is open or the range is invalid.
    pub fn claim(
        &mut self,
        commodity: Commodity,
        min_w: f32,
        max_w: f32,
        primary: bool,
        force: bool,
    ) -> bool {
        assert!(self.open, "claim outside an open ledger transaction");
        assert!(
            min_w >= 0.0 && max_w >= min_w,
            "claim range must satisfy 0 <= min <= max"
        );

        let mut delivered = 0.0_f32;
        match commodity {
            Commodity::Dc => {
                delivered += self.take_dc_direct(max_w);
                let short = max_w - delivered;
                if short > CLAIM_EPS {
                    delivered +=
                        self.take_cross_phase(None, short, self.policy.efficiency, false);
                }
            }
            ac => {
                let phases = ac.phases();
                let per_phase = max_w / phases.len() as f32;
                for &phase in phases {
                    delivered += self.source_for_phase(phase, per_phase);
                }
            }
        }

        if force && delivered + CLAIM_EPS < min_w {
            // Residual comes from DC alone; AC phases are never pushed negative.
            let residual = min_w - delivered;
            self.available.dc -= residual;
            self.claimed.dc += residual;
            delivered = min_w;
        }
        self.last_delivered_w = delivered;

        if force {
            return true;
        }
        if delivered + CLAIM_EPS < min_w {
            return false;
        }

        let remaining = self.available.total();
        // Reservation first, headroom second; which consumer class gets
        // denied first under a tight budget depends on this order.
        if !primary && remaining + CLAIM_EPS < self.reservation_w {
            return false;
        }
        if primary && remaining <= self.policy.headroom_w + CLAIM_EPS {
            return false;
        }
        true
    }

    /// Sources up to `want_w` for one AC phase, in policy order.
    fn source_for_phase(&mut self, phase: Phase, want_w: f32) -> f32 {
        let mut delivered = self.take_same_phase(phase, want_w);
        let mut short = want_w - delivered;
        if short <= CLAIM_EPS {
            return delivered;
        }

        if self.policy.saldating {
            delivered +=
                self.take_cross_phase(Some(phase), short, self.policy.efficiency, false);
            short = want_w - delivered;
            if short > CLAIM_EPS {
                delivered += self.take_dc_into_phase(phase, short);
            }
        } else {
            delivered += self.take_dc_into_phase(phase, short);
            short = want_w - delivered;
            if short > CLAIM_EPS {
                let eff = self.policy.efficiency * self.policy.efficiency;
                delivered += self.take_cross_phase(Some(phase), short, eff, true);
            }
        }
        delivered
    }

    /// (a) Same-phase AC surplus, capped at what is available.
    fn take_same_phase(&mut self, phase: Phase, want_w: f32) -> f32 {
        let take = want_w.min(self.available.phase(phase).max(0.0));
        if take <= 0.0 {
            return 0.0;
        }
        *self.available.phase_mut(phase) -= take;
        *self.claimed.phase_mut(phase) += take;
        take
    }

    /// (b) DC bus into an AC phase, lossless but bounded by the remaining
    /// continuous inverter power on that phase.
    fn take_dc_into_phase(&mut self, phase: Phase, want_w: f32) -> f32 {
        let take = want_w
            .min(self.available.dc.max(0.0))
            .min(self.ceiling_remaining(phase));
        if take <= 0.0 {
            return 0.0;
        }
        self.available.dc -= take;
        self.claimed.dc += take;
        self.converted_w[phase_index(phase)] += take;
        take
    }

    /// Direct DC for a DC-commodity claim.
    fn take_dc_direct(&mut self, want_w: f32) -> f32 {
        let take = want_w.min(self.available.dc.max(0.0));
        if take <= 0.0 {
            return 0.0;
        }
        self.available.dc -= take;
        self.claimed.dc += take;
        take
    }

    /// (c) Foreign AC phases; `target = None` delivers onto the DC bus.
    ///
    /// `delivered = cost * efficiency`; the conversion loss stays attributed
    /// to the source phase. `through_inverter` additionally consumes the
    /// target phase's continuous-power ceiling.
    fn take_cross_phase(
        &mut self,
        target: Option<Phase>,
        want_w: f32,
        efficiency: f32,
        through_inverter: bool,
    ) -> f32 {
        let mut delivered = 0.0_f32;
        for src in Phase::ALL {
            if Some(src) == target {
                continue;
            }
            let short = want_w - delivered;
            if short <= CLAIM_EPS {
                break;
            }
            let avail = self.available.phase(src).max(0.0);
            if avail <= 0.0 {
                continue;
            }
            let mut deliverable = (avail * efficiency).min(short);
            if through_inverter {
                if let Some(t) = target {
                    deliverable = deliverable.min(self.ceiling_remaining(t));
                }
            }
            if deliverable <= 0.0 {
                continue;
            }
            let cost = deliverable / efficiency;
            *self.available.phase_mut(src) -= cost;
            *self.claimed.phase_mut(src) += cost;
            if through_inverter {
                if let Some(t) = target {
                    self.converted_w[phase_index(t)] += deliverable;
                }
            }
            delivered += deliverable;
        }
        delivered
    }

    fn ceiling_remaining(&self, phase: Phase) -> f32 {
        (self.policy.continuous_power_w - self.converted_w[phase_index(phase)]).max(0.0)
    }
}

fn phase_index(phase: Phase) -> usize {
    match phase {
        Phase::L1 => 0,
        Phase::L2 => 1,
        Phase::L3 => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(l1: f32, l2: f32, l3: f32, dc: f32, reservation_w: f32) -> PowerLedger {
        PowerLedger::new(
            PhaseVector::new(l1, l2, l3, dc),
            reservation_w,
            0.0,
            AllocationPolicy::default(),
        )
    }

    #[test]
    fn single_phase_claim_within_availability() {
        let mut lg = ledger(1000.0, 200.0, 200.0, 200.0, 0.0);
        lg.begin();
        assert!(lg.claim(Commodity::L1, 1000.0, 1000.0, false, false));
        let claim = lg.commit();
        assert_eq!(claim.l1, 1000.0);
        assert_eq!(claim.total(), 1000.0);
        assert_eq!(lg.available().l1, 0.0);
        assert_eq!(lg.available().dc, 200.0);
    }

    #[test]
    fn shortfall_tops_up_from_dc() {
        let mut lg = ledger(800.0, 200.0, 200.0, 200.0, 0.0);
        lg.begin();
        assert!(lg.claim(Commodity::L1, 1000.0, 1000.0, false, false));
        let claim = lg.commit();
        assert_eq!(claim.l1, 800.0);
        assert_eq!(claim.dc, 200.0);
    }

    #[test]
    fn forced_claim_drives_dc_negative_but_not_ac() {
        let mut lg = ledger(200.0, 0.0, 0.0, 200.0, 0.0);
        lg.begin();
        assert!(lg.claim(Commodity::L1, 1000.0, 1000.0, false, true));
        let claim = lg.commit();
        assert_eq!(claim.l1, 200.0);
        assert_eq!(claim.dc, 800.0);
        assert_eq!(lg.available().dc, -600.0);
        assert!(lg.available().l1 >= 0.0);
        assert!(lg.available().l2 >= 0.0);
        assert!(lg.available().l3 >= 0.0);
    }

    #[test]
    fn symmetric_claim_cannot_exceed_a_single_phase() {
        let mut lg = ledger(1000.0, 1000.0, 900.0, 0.0, 0.0);
        lg.begin();
        assert!(!lg.claim(Commodity::ThreePhase, 3000.0, 3000.0, false, false));
        assert!((lg.claimed().total() - 2900.0).abs() < 1e-2);
        lg.rollback();
        assert_eq!(lg.available().l3, 900.0);
    }

    #[test]
    fn rollback_restores_pre_begin_state() {
        let mut lg = ledger(500.0, 500.0, 500.0, 100.0, 0.0);
        let before = *lg.available();
        lg.begin();
        assert!(lg.claim(Commodity::L1, 100.0, 100.0, false, false));
        assert!(!lg.claim(Commodity::L2, 5000.0, 5000.0, false, false));
        lg.rollback();
        assert_eq!(*lg.available(), before);
        assert!(!lg.is_open());
    }

    #[test]
    fn commit_keeps_post_claim_availability_for_next_caller() {
        let mut lg = ledger(600.0, 0.0, 0.0, 0.0, 0.0);
        lg.begin();
        assert!(lg.claim(Commodity::L1, 400.0, 400.0, false, false));
        lg.commit();

        lg.begin();
        assert!(lg.claim(Commodity::L1, 200.0, 200.0, false, false));
        let second = lg.commit();
        assert_eq!(second.l1, 200.0);
        assert_eq!(lg.available().l1, 0.0);
    }

    #[test]
    fn cross_phase_transfer_costs_double_penalty() {
        let policy = AllocationPolicy {
            efficiency: 0.9,
            ..AllocationPolicy::default()
        };
        let mut lg = PowerLedger::new(PhaseVector::new(0.0, 1000.0, 0.0, 0.0), 0.0, 0.0, policy);
        lg.begin();
        assert!(lg.claim(Commodity::L1, 81.0, 81.0, false, false));
        let claim = lg.commit();
        // 81 W delivered costs 81 / 0.81 = 100 W on the source phase.
        assert!((claim.l2 - 100.0).abs() < 1e-2);
        assert_eq!(claim.l1, 0.0);
        assert!((lg.available().l2 - 900.0).abs() < 1e-2);
    }

    #[test]
    fn saldating_prefers_cross_phase_at_single_penalty() {
        let policy = AllocationPolicy {
            efficiency: 0.9,
            saldating: true,
            ..AllocationPolicy::default()
        };
        let mut lg =
            PowerLedger::new(PhaseVector::new(0.0, 1000.0, 0.0, 500.0), 0.0, 0.0, policy);
        lg.begin();
        assert!(lg.claim(Commodity::L1, 90.0, 90.0, false, false));
        let claim = lg.commit();
        // 90 W delivered costs 90 / 0.9 = 100 W cross-phase; DC untouched.
        assert!((claim.l2 - 100.0).abs() < 1e-2);
        assert_eq!(claim.dc, 0.0);
    }

    #[test]
    fn partial_range_claim_takes_what_is_obtainable() {
        let mut lg = ledger(700.0, 0.0, 0.0, 0.0, 0.0);
        lg.begin();
        assert!(lg.claim(Commodity::L1, 500.0, 1000.0, false, false));
        assert!((lg.last_delivered_w() - 700.0).abs() < 1e-2);
        let claim = lg.commit();
        assert_eq!(claim.l1, 700.0);
    }

    #[test]
    fn range_claim_below_minimum_fails() {
        let mut lg = ledger(400.0, 0.0, 0.0, 0.0, 0.0);
        lg.begin();
        assert!(!lg.claim(Commodity::L1, 500.0, 1000.0, false, false));
        lg.rollback();
    }

    #[test]
    fn reservation_blocks_secondary_claim() {
        let mut lg = ledger(1000.0, 0.0, 0.0, 0.0, 600.0);
        lg.begin();
        // Physically satisfiable, but would leave 500 W < 600 W reserved.
        assert!(!lg.claim(Commodity::L1, 500.0, 500.0, false, false));
        lg.rollback();
    }

    #[test]
    fn primary_claim_bypasses_reservation() {
        let mut lg = ledger(1000.0, 0.0, 0.0, 0.0, 600.0);
        lg.begin();
        assert!(lg.claim(Commodity::L1, 500.0, 500.0, true, false));
        lg.commit();
    }

    #[test]
    fn primary_claim_requires_headroom() {
        let mut lg = ledger(1000.0, 0.0, 0.0, 0.0, 0.0);
        lg.begin();
        // Leaves exactly 0 W total; a primary must keep more than 50 W spare.
        assert!(!lg.claim(Commodity::L1, 1000.0, 1000.0, true, false));
        lg.rollback();

        lg.begin();
        assert!(lg.claim(Commodity::L1, 900.0, 900.0, true, false));
        lg.commit();
    }

    #[test]
    fn secondary_claim_may_drain_to_zero_when_nothing_reserved() {
        let mut lg = ledger(1000.0, 0.0, 0.0, 0.0, 0.0);
        lg.begin();
        assert!(lg.claim(Commodity::L1, 1000.0, 1000.0, false, false));
        lg.commit();
        assert_eq!(lg.available_total(), 0.0);
    }

    #[test]
    fn inverter_ceiling_caps_dc_delivery() {
        let policy = AllocationPolicy {
            continuous_power_w: 300.0,
            ..AllocationPolicy::default()
        };
        let mut lg =
            PowerLedger::new(PhaseVector::new(0.0, 0.0, 0.0, 1000.0), 0.0, 0.0, policy);
        lg.begin();
        assert!(!lg.claim(Commodity::L1, 500.0, 500.0, false, false));
        assert!((lg.claimed().dc - 300.0).abs() < 1e-2);
        lg.rollback();
    }

    #[test]
    fn forced_residual_ignores_inverter_ceiling() {
        let policy = AllocationPolicy {
            continuous_power_w: 300.0,
            ..AllocationPolicy::default()
        };
        let mut lg =
            PowerLedger::new(PhaseVector::new(0.0, 0.0, 0.0, 1000.0), 0.0, 0.0, policy);
        lg.begin();
        assert!(lg.claim(Commodity::L1, 500.0, 500.0, false, true));
        let claim = lg.commit();
        assert!((claim.dc - 500.0).abs() < 1e-2);
    }

    #[test]
    fn dc_commodity_claims_dc_then_ac() {
        let policy = AllocationPolicy {
            efficiency: 0.9,
            ..AllocationPolicy::default()
        };
        let mut lg =
            PowerLedger::new(PhaseVector::new(100.0, 0.0, 0.0, 50.0), 0.0, 0.0, policy);
        lg.begin();
        assert!(lg.claim(Commodity::Dc, 95.0, 95.0, false, false));
        let claim = lg.commit();
        assert_eq!(claim.dc, 50.0);
        // 45 W delivered onto the DC bus costs 45 / 0.9 = 50 W on L1.
        assert!((claim.l1 - 50.0).abs() < 1e-2);
    }

    #[test]
    #[should_panic(expected = "already open")]
    fn nested_begin_panics() {
        let mut lg = ledger(0.0, 0.0, 0.0, 0.0, 0.0);
        lg.begin();
        lg.begin();
    }

    #[test]
    #[should_panic(expected = "outside an open ledger transaction")]
    fn claim_without_begin_panics() {
        let mut lg = ledger(100.0, 0.0, 0.0, 0.0, 0.0);
        lg.claim(Commodity::L1, 10.0, 10.0, false, false);
    }

    #[test]
    #[should_panic(expected = "commit without an open ledger transaction")]
    fn commit_without_begin_panics() {
        let mut lg = ledger(0.0, 0.0, 0.0, 0.0, 0.0);
        lg.commit();
    }

    #[test]
    #[should_panic(expected = "rollback without an open ledger transaction")]
    fn rollback_without_begin_panics() {
        let mut lg = ledger(0.0, 0.0, 0.0, 0.0, 0.0);
        lg.rollback();
    }
}
