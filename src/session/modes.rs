//! Operation-mode catalog with transition and timer bookkeeping.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::{ModeId, OperationMode, TimerId, TimerSpec, Transition};

/// A catalog timer plus its engine-side running state.
#[derive(Debug, Clone)]
pub struct Timer {
    pub spec: TimerSpec,
    /// Set while the timer is running; absent otherwise.
    pub started_at: Option<Instant>,
}

impl Timer {
    fn new(spec: TimerSpec) -> Self {
        Self {
            spec,
            started_at: None,
        }
    }

    /// Seconds until expiry, or `None` when not running or already expired.
    fn remaining_s(&self, now: Instant) -> Option<u64> {
        let started = self.started_at?;
        let duration = Duration::from_secs(self.spec.duration_s);
        let elapsed = now.saturating_duration_since(started);
        if elapsed >= duration {
            return None;
        }
        Some((duration - elapsed).as_secs().max(1))
    }
}

/// A resource manager's operation modes, permitted transitions, and timers,
/// kept sorted by descending total power.
///
/// The last mode in the catalog order is the cheapest; among the modes
/// reachable from the active one it serves as the forced fallback.
#[derive(Debug, Clone)]
pub struct ModeCatalog {
    modes: Vec<OperationMode>,
    transitions: Vec<Transition>,
    timers: HashMap<TimerId, Timer>,
}

impl ModeCatalog {
    /// Builds a catalog from a system description, sorting modes by
    /// descending maximum total power.
    pub fn new(
        mut modes: Vec<OperationMode>,
        transitions: Vec<Transition>,
        timers: Vec<TimerSpec>,
    ) -> Self {
        modes.sort_by(|a, b| {
            b.max_total_w()
                .partial_cmp(&a.max_total_w())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Self {
            modes,
            transitions,
            timers: timers.into_iter().map(|t| (t.id, Timer::new(t))).collect(),
        }
    }

    /// Modes in descending power order.
    pub fn modes(&self) -> &[OperationMode] {
        &self.modes
    }

    pub fn mode(&self, id: ModeId) -> Option<&OperationMode> {
        self.modes.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: ModeId) -> bool {
        self.mode(id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    /// The transition edge from one mode to another, if the catalog allows it.
    pub fn transition(&self, from: ModeId, to: ModeId) -> Option<&Transition> {
        self.transitions.iter().find(|t| t.from == from && t.to == to)
    }

    /// Mode ids reachable from `active`, in descending power order.
    ///
    /// A mode is always reachable from itself; any other candidate needs a
    /// declared transition edge.
    pub fn reachable_from(&self, active: ModeId) -> Vec<ModeId> {
        self.modes
            .iter()
            .filter(|m| m.id == active || self.transition(active, m.id).is_some())
            .map(|m| m.id)
            .collect()
    }

    /// Seconds left on the longest-running blocking timer of the
    /// `from → to` edge, or `None` when the transition is not blocked.
    ///
    /// Expired timers are pruned as a side effect.
    pub fn blocking_remaining_s(&mut self, from: ModeId, to: ModeId, now: Instant) -> Option<u64> {
        if from == to {
            return None;
        }
        let blocking = self.transition(from, to)?.blocking_timers.clone();
        let mut remaining = None;
        for id in blocking {
            let Some(timer) = self.timers.get_mut(&id) else {
                continue;
            };
            match timer.remaining_s(now) {
                Some(left) => remaining = Some(remaining.map_or(left, |r: u64| r.max(left))),
                None => timer.started_at = None,
            }
        }
        remaining
    }

    /// Starts the timers declared on the `from → to` edge.
    pub fn start_transition_timers(&mut self, from: ModeId, to: ModeId, now: Instant) {
        let Some(transition) = self.transition(from, to) else {
            return;
        };
        for id in transition.start_timers.clone() {
            if let Some(timer) = self.timers.get_mut(&id) {
                timer.started_at = Some(now);
            }
        }
    }
}
