//! Battery reservation: how much surplus the battery is entitled to keep.

use serde::Serialize;

use super::telemetry::{ChargeStrategy, SystemSnapshot};

/// Where the published reservation value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReservationSource {
    /// Derived from the state-of-charge curve.
    Ok,
    /// SoC critically low; everything is withheld to keep the system alive.
    PvKeepAlive,
    /// The BMS charge limit caps what the battery can absorb anyway.
    BmsLimited,
    /// An external strategy or rate override owns the battery.
    ExternalOverride,
    /// State of charge unknown; the full reservation is withheld.
    Error,
}

/// SoC-dependent reservation: the full amount below `soc_low`, tapering
/// linearly to zero at `soc_high`.
#[derive(Debug, Clone, Copy)]
pub struct ReservationCurve {
    /// Reservation at and below `soc_low` (W).
    pub max_w: f32,
    /// SoC below which the full reservation applies (0.0–1.0).
    pub soc_low: f32,
    /// SoC at and above which nothing is reserved (0.0–1.0).
    pub soc_high: f32,
    /// SoC below which the system protects itself regardless of the curve.
    pub keep_alive_soc: f32,
}

impl ReservationCurve {
    /// # Panics
    ///
    /// Panics if the SoC breakpoints are out of order or out of range.
    pub fn new(max_w: f32, soc_low: f32, soc_high: f32, keep_alive_soc: f32) -> Self {
        assert!(max_w >= 0.0, "reservation must be >= 0");
        assert!(
            (0.0..=1.0).contains(&keep_alive_soc)
                && keep_alive_soc <= soc_low
                && soc_low < soc_high
                && soc_high <= 1.0,
            "SoC breakpoints must satisfy 0 <= keep_alive <= low < high <= 1"
        );
        Self {
            max_w,
            soc_low,
            soc_high,
            keep_alive_soc,
        }
    }

    /// Computes this tick's reservation and its provenance.
    ///
    /// External strategies and rate overrides take the battery out of this
    /// engine's hands entirely; an unknown SoC withholds the full amount
    /// until the BMS reports again.
    pub fn compute(&self, snapshot: &SystemSnapshot) -> (f32, ReservationSource) {
        if snapshot.strategy != ChargeStrategy::Internal {
            return (0.0, ReservationSource::ExternalOverride);
        }
        if let Some(override_w) = snapshot.charge_rate_override_w {
            return (override_w.max(0.0), ReservationSource::ExternalOverride);
        }
        let Some(soc) = snapshot.battery_soc else {
            return (self.max_w, ReservationSource::Error);
        };

        let (mut reservation_w, mut source) = if soc <= self.keep_alive_soc {
            (self.max_w, ReservationSource::PvKeepAlive)
        } else {
            (self.from_soc(soc), ReservationSource::Ok)
        };

        if let Some(limit_a) = snapshot.charge_current_limit_a {
            let capability_w = (limit_a * snapshot.battery_voltage_v).max(0.0);
            if capability_w < reservation_w {
                reservation_w = capability_w;
                source = ReservationSource::BmsLimited;
            }
        }
        (reservation_w, source)
    }

    fn from_soc(&self, soc: f32) -> f32 {
        if soc <= self.soc_low {
            self.max_w
        } else if soc >= self.soc_high {
            0.0
        } else {
            self.max_w * (self.soc_high - soc) / (self.soc_high - self.soc_low)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve() -> ReservationCurve {
        ReservationCurve::new(2000.0, 0.4, 0.9, 0.1)
    }

    fn snapshot(soc: f32) -> SystemSnapshot {
        SystemSnapshot {
            battery_soc: Some(soc),
            battery_voltage_v: 48.0,
            ..SystemSnapshot::default()
        }
    }

    #[test]
    fn full_reservation_below_low_soc() {
        let (w, source) = curve().compute(&snapshot(0.3));
        assert_eq!(w, 2000.0);
        assert_eq!(source, ReservationSource::Ok);
    }

    #[test]
    fn zero_reservation_when_nearly_full() {
        let (w, source) = curve().compute(&snapshot(0.95));
        assert_eq!(w, 0.0);
        assert_eq!(source, ReservationSource::Ok);
    }

    #[test]
    fn taper_is_linear_between_breakpoints() {
        let (w, _) = curve().compute(&snapshot(0.65));
        assert!((w - 1000.0).abs() < 1e-2);
    }

    #[test]
    fn keep_alive_soc_overrides_the_curve() {
        let (w, source) = curve().compute(&snapshot(0.05));
        assert_eq!(w, 2000.0);
        assert_eq!(source, ReservationSource::PvKeepAlive);
    }

    #[test]
    fn bms_limit_clips_the_reservation() {
        let mut s = snapshot(0.3);
        s.charge_current_limit_a = Some(10.0); // 480 W at 48 V
        let (w, source) = curve().compute(&s);
        assert_eq!(w, 480.0);
        assert_eq!(source, ReservationSource::BmsLimited);
    }

    #[test]
    fn generous_bms_limit_keeps_curve_value() {
        let mut s = snapshot(0.3);
        s.charge_current_limit_a = Some(100.0); // 4800 W at 48 V
        let (w, source) = curve().compute(&s);
        assert_eq!(w, 2000.0);
        assert_eq!(source, ReservationSource::Ok);
    }

    #[test]
    fn external_strategy_zeroes_the_reservation() {
        let mut s = snapshot(0.3);
        s.strategy = ChargeStrategy::External;
        let (w, source) = curve().compute(&s);
        assert_eq!(w, 0.0);
        assert_eq!(source, ReservationSource::ExternalOverride);
    }

    #[test]
    fn rate_override_is_adopted_verbatim() {
        let mut s = snapshot(0.95);
        s.charge_rate_override_w = Some(750.0);
        let (w, source) = curve().compute(&s);
        assert_eq!(w, 750.0);
        assert_eq!(source, ReservationSource::ExternalOverride);
    }

    #[test]
    fn unknown_soc_withholds_everything() {
        let mut s = snapshot(0.5);
        s.battery_soc = None;
        let (w, source) = curve().compute(&s);
        assert_eq!(w, 2000.0);
        assert_eq!(source, ReservationSource::Error);
    }

    #[test]
    #[should_panic(expected = "SoC breakpoints")]
    fn inverted_breakpoints_panic() {
        ReservationCurve::new(1000.0, 0.9, 0.4, 0.1);
    }
}
