//! Phase-resolved power quantities.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

/// One of the three AC phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    L1,
    L2,
    L3,
}

impl Phase {
    /// All AC phases in wiring order.
    pub const ALL: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];
}

/// The place a power quantity is drawn from or delivered to.
///
/// `ThreePhase` is a phase-symmetric quantity: reading or writing it through
/// a [`PhaseVector`] spreads the value evenly over L1/L2/L3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Commodity {
    L1,
    L2,
    L3,
    ThreePhase,
    Dc,
}

impl Commodity {
    /// The AC phases this commodity touches, or an empty slice for DC.
    pub fn phases(&self) -> &'static [Phase] {
        match self {
            Commodity::L1 => &[Phase::L1],
            Commodity::L2 => &[Phase::L2],
            Commodity::L3 => &[Phase::L3],
            Commodity::ThreePhase => &Phase::ALL,
            Commodity::Dc => &[],
        }
    }
}

/// A power quantity resolved per AC phase plus the DC bus, in watts.
///
/// Sign convention: positive values are power that is available (or consumed,
/// depending on context); the vector itself is convention-free arithmetic.
///
/// # Examples
///
/// ```
/// use surplus_ems::ledger::{Commodity, PhaseVector};
///
/// let mut v = PhaseVector::default();
/// v.add_commodity(Commodity::ThreePhase, 900.0);
/// assert_eq!(v.l1, 300.0);
/// assert_eq!(v.total(), 900.0);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseVector {
    /// Power on phase L1 (W).
    pub l1: f32,
    /// Power on phase L2 (W).
    pub l2: f32,
    /// Power on phase L3 (W).
    pub l3: f32,
    /// Power on the DC bus (W).
    pub dc: f32,
}

impl PhaseVector {
    /// Creates a vector from explicit per-phase values.
    pub fn new(l1: f32, l2: f32, l3: f32, dc: f32) -> Self {
        Self { l1, l2, l3, dc }
    }

    /// Sum over all phases and the DC bus.
    pub fn total(&self) -> f32 {
        self.l1 + self.l2 + self.l3 + self.dc
    }

    /// Sum over the AC phases only.
    pub fn ac_total(&self) -> f32 {
        self.l1 + self.l2 + self.l3
    }

    /// Reads one AC phase.
    pub fn phase(&self, phase: Phase) -> f32 {
        match phase {
            Phase::L1 => self.l1,
            Phase::L2 => self.l2,
            Phase::L3 => self.l3,
        }
    }

    /// Mutable access to one AC phase.
    pub fn phase_mut(&mut self, phase: Phase) -> &mut f32 {
        match phase {
            Phase::L1 => &mut self.l1,
            Phase::L2 => &mut self.l2,
            Phase::L3 => &mut self.l3,
        }
    }

    /// Reads a commodity; `ThreePhase` returns the AC total.
    pub fn commodity(&self, commodity: Commodity) -> f32 {
        match commodity {
            Commodity::L1 => self.l1,
            Commodity::L2 => self.l2,
            Commodity::L3 => self.l3,
            Commodity::ThreePhase => self.ac_total(),
            Commodity::Dc => self.dc,
        }
    }

    /// Adds a commodity quantity; `ThreePhase` spreads `value / 3` per phase.
    pub fn add_commodity(&mut self, commodity: Commodity, value: f32) {
        match commodity {
            Commodity::L1 => self.l1 += value,
            Commodity::L2 => self.l2 += value,
            Commodity::L3 => self.l3 += value,
            Commodity::ThreePhase => {
                let share = value / 3.0;
                self.l1 += share;
                self.l2 += share;
                self.l3 += share;
            }
            Commodity::Dc => self.dc += value,
        }
    }

    /// `true` when every component is (numerically) zero.
    pub fn is_zero(&self) -> bool {
        const EPS: f32 = 1e-3;
        self.l1.abs() < EPS && self.l2.abs() < EPS && self.l3.abs() < EPS && self.dc.abs() < EPS
    }
}

impl Add for PhaseVector {
    type Output = PhaseVector;

    fn add(self, rhs: PhaseVector) -> PhaseVector {
        PhaseVector {
            l1: self.l1 + rhs.l1,
            l2: self.l2 + rhs.l2,
            l3: self.l3 + rhs.l3,
            dc: self.dc + rhs.dc,
        }
    }
}

impl AddAssign for PhaseVector {
    fn add_assign(&mut self, rhs: PhaseVector) {
        self.l1 += rhs.l1;
        self.l2 += rhs.l2;
        self.l3 += rhs.l3;
        self.dc += rhs.dc;
    }
}

impl Sub for PhaseVector {
    type Output = PhaseVector;

    fn sub(self, rhs: PhaseVector) -> PhaseVector {
        PhaseVector {
            l1: self.l1 - rhs.l1,
            l2: self.l2 - rhs.l2,
            l3: self.l3 - rhs.l3,
            dc: self.dc - rhs.dc,
        }
    }
}

impl SubAssign for PhaseVector {
    fn sub_assign(&mut self, rhs: PhaseVector) {
        self.l1 -= rhs.l1;
        self.l2 -= rhs.l2;
        self.l3 -= rhs.l3;
        self.dc -= rhs.dc;
    }
}

impl fmt::Display for PhaseVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "L1={:.0}W L2={:.0}W L3={:.0}W DC={:.0}W",
            self.l1, self.l2, self.l3, self.dc
        )
    }
}
