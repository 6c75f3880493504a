//! Run state, display pacing and the state hash.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::SpeedSetting;
use crate::fixed::{Fixed64, SimTime, millis_to_secs};

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    /// Configured but `start()` not yet called. Configuration may change.
    #[default]
    NotStarted,
    Running,
    /// Start Point drained, every crane and scanner idle.
    Finished,
    /// An invariant violation stopped the run.
    Halted,
}

/// Mutable bookkeeping tracked by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimState {
    pub status: RunStatus,
    pub paused: bool,
    /// Events dispatched so far, not counting inert ones.
    pub dispatched: u64,
    /// Simulated time at which the run finished.
    pub finished_at: Option<SimTime>,
}

impl SimState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }
}

// ---------------------------------------------------------------------------
// Pacing
// ---------------------------------------------------------------------------

/// Converts simulated time deltas into wall-clock delays for a display.
///
/// Only a presentation concern: the engine never reads it, so pacing can
/// not change what a run does.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pacing {
    multiplier: f64,
}

impl Pacing {
    pub fn new(speed: SpeedSetting) -> Self {
        Self {
            multiplier: speed.multiplier(),
        }
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Wall time to wait before showing an event `delta` ms after the
    /// previous one. Zero for a degenerate multiplier.
    pub fn wall_delay(&self, delta: SimTime) -> Duration {
        if !(self.multiplier.is_finite() && self.multiplier > 0.0) {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(millis_to_secs(delta) / self.multiplier).unwrap_or(Duration::ZERO)
    }
}

// ---------------------------------------------------------------------------
// State hash
// ---------------------------------------------------------------------------

/// A simple deterministic hash of simulation state for comparing runs.
///
/// Uses FNV-1a (64-bit). Not cryptographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHash(pub u64);

impl StateHash {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    pub fn new() -> Self {
        Self(Self::FNV_OFFSET)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::FNV_PRIME);
        }
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_u8(&mut self, v: u8) {
        self.write(&[v]);
    }

    pub fn write_fixed64(&mut self, v: Fixed64) {
        self.write(&v.to_bits().to_le_bytes());
    }

    pub fn finish(self) -> u64 {
        self.0
    }
}

impl Default for StateHash {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_starts_not_started() {
        let state = SimState::new();
        assert_eq!(state.status, RunStatus::NotStarted);
        assert!(!state.paused);
        assert_eq!(state.dispatched, 0);
    }

    #[test]
    fn pacing_scales_by_multiplier() {
        let real = Pacing::new(SpeedSetting::RealTime);
        assert_eq!(real.wall_delay(1_500), Duration::from_millis(1_500));
        let fast = Pacing::new(SpeedSetting::Fast);
        assert_eq!(fast.wall_delay(8_000), Duration::from_secs(1));
        let recommended = Pacing::new(SpeedSetting::Recommended);
        assert_eq!(recommended.wall_delay(18_000), Duration::from_secs(9));
    }

    #[test]
    fn pacing_degenerate_multiplier_is_zero_delay() {
        let p = Pacing::new(SpeedSetting::Custom(0.0));
        assert_eq!(p.wall_delay(1_000), Duration::ZERO);
    }

    #[test]
    fn state_hash_deterministic() {
        let mut h1 = StateHash::new();
        h1.write_u64(42);
        h1.write_u32(7);

        let mut h2 = StateHash::new();
        h2.write_u64(42);
        h2.write_u32(7);

        assert_eq!(h1.finish(), h2.finish());
    }

    #[test]
    fn state_hash_order_matters() {
        let mut h1 = StateHash::new();
        h1.write_u32(1);
        h1.write_u32(2);

        let mut h2 = StateHash::new();
        h2.write_u32(2);
        h2.write_u32(1);

        assert_ne!(h1.finish(), h2.finish());
    }
}
