//! Shared test helpers for integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use crate::config::SimConfig;
use crate::crane::CranePhase;
use crate::engine::{Engine, StepOutcome};
use crate::event::JournalEntry;
use crate::fixed::{Fixed64, SimTime, travel_time};
use crate::id::{CraneId, ScannerId};
use crate::policy::AssignmentPolicy;

// ===========================================================================
// Fixed-point helper
// ===========================================================================

pub fn fixed(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

// ===========================================================================
// Config builders
// ===========================================================================

/// Default facility with `scanners` scanners and `diamonds` diamonds.
pub fn config(scanners: u8, diamonds: u32) -> SimConfig {
    SimConfig {
        scanner_count: scanners,
        diamond_count: diamonds,
        ..SimConfig::default()
    }
}

/// Scans long enough that the scanners, not the cranes, limit throughput.
pub fn scanner_bound(scanners: u8, diamonds: u32, policy: AssignmentPolicy) -> SimConfig {
    SimConfig {
        scan_duration: 60_000,
        policy,
        ..config(scanners, diamonds)
    }
}

/// Top view only: hoist moves take no time.
pub fn no_side_view(scanners: u8, diamonds: u32) -> SimConfig {
    SimConfig {
        side_view: false,
        ..config(scanners, diamonds)
    }
}

/// Both pre-emptive behaviours switched off.
pub fn reactive(scanners: u8, diamonds: u32) -> SimConfig {
    SimConfig {
        pre_emptive: false,
        ..config(scanners, diamonds)
    }
}

// ===========================================================================
// Engine helpers
// ===========================================================================

/// Build and start an engine. Panics on an invalid config.
pub fn started(config: SimConfig) -> Engine {
    let mut engine = Engine::new(config).expect("valid config");
    engine.start().expect("start");
    engine
}

/// Run `config` to completion and return the finished engine.
pub fn run(config: SimConfig) -> Engine {
    let mut engine = Engine::new(config).expect("valid config");
    engine.run_to_completion().expect("run completes");
    engine
}

/// Step until the run finishes, collecting each dispatch.
pub fn step_all(engine: &mut Engine) -> Vec<StepOutcome> {
    let mut out = Vec::new();
    loop {
        let outcome = engine.skip().expect("step");
        out.push(outcome);
        if outcome == StepOutcome::Finished {
            return out;
        }
    }
}

/// Time to travel `mm` at the configured crane speed.
pub fn travel(config: &SimConfig, mm: f64) -> SimTime {
    travel_time(fixed(mm), config.speed_fixed())
}

// ===========================================================================
// Journal queries
// ===========================================================================

/// `(time, scanner, serial)` of every scan start.
pub fn scan_starts(engine: &Engine) -> Vec<(SimTime, ScannerId, u32)> {
    engine
        .journal()
        .iter()
        .filter_map(|r| match r.entry {
            JournalEntry::ScanStarted { scanner, serial } => Some((r.time, scanner, serial)),
            _ => None,
        })
        .collect()
}

/// `(time, scanner, serial)` of every scan completion.
pub fn scan_finishes(engine: &Engine) -> Vec<(SimTime, ScannerId, u32)> {
    engine
        .journal()
        .iter()
        .filter_map(|r| match r.entry {
            JournalEntry::ScanFinished {
                scanner, serial, ..
            } => Some((r.time, scanner, serial)),
            _ => None,
        })
        .collect()
}

/// `(time, scanner, serial)` of every unloader pickup.
pub fn retrievals(engine: &Engine) -> Vec<(SimTime, ScannerId, u32)> {
    engine
        .journal()
        .iter()
        .filter_map(|r| match r.entry {
            JournalEntry::Retrieved {
                scanner, serial, ..
            } => Some((r.time, scanner, serial)),
            _ => None,
        })
        .collect()
}

/// Times at which `crane` entered `phase`.
pub fn phase_entries(engine: &Engine, crane: CraneId, phase: CranePhase) -> Vec<SimTime> {
    engine
        .journal()
        .iter()
        .filter_map(|r| match r.entry {
            JournalEntry::CranePhase { crane: c, to, .. } if c == crane && to == phase => {
                Some(r.time)
            }
            _ => None,
        })
        .collect()
}
