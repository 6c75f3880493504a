//! Invariant checks, state comparison and determinism checking.
//!
//! [`check_invariants`] runs after every dispatch. The diff and
//! determinism helpers compare two engines built from the same
//! configuration to find where (if anywhere) they diverge.

use slotmap::SecondaryMap;

use crate::config::SimConfig;
use crate::crane::{CraneFault, Hoist};
use crate::diamond::DiamondLocation;
use crate::engine::{Engine, InvariantViolation, SimError, StepOutcome};
use crate::event::{Journal, Record};
use crate::fixed::SimTime;
use crate::id::{CraneId, DiamondId, ScannerId};
use crate::scanner::ScannerState;

// ---------------------------------------------------------------------------
// Invariants
// ---------------------------------------------------------------------------

/// Check every structural invariant of a running engine.
///
/// - Both rail reservations are within bounds and disjoint, blue left of red.
/// - A crane moving along the rail has its hoist raised.
/// - A scanner holds a diamond exactly when it is not idle.
/// - Every live diamond has exactly one owner, and that owner agrees with
///   the diamond's recorded location.
/// - No diamond is created or lost.
pub fn check_invariants(engine: &Engine) -> Result<(), InvariantViolation> {
    let now = engine.queue.now();
    engine.rail.check(now)?;

    for crane in &engine.cranes {
        if engine.rail.is_moving(crane.id) && crane.hoist() != Hoist::Raised {
            return Err(CraneFault::MovedWhileLowered { crane: crane.id }.into());
        }
    }

    for scanner in &engine.scanners {
        let holding = scanner.held().is_some();
        if holding == (scanner.state() == ScannerState::Idle) {
            return Err(InvariantViolation::ScanExclusivity {
                scanner: scanner.id,
                state: scanner.state(),
                holding,
            });
        }
    }

    let mut holders: SecondaryMap<DiamondId, DiamondLocation> = SecondaryMap::new();
    let mut claim = |diamond: DiamondId, at: DiamondLocation| -> Result<(), InvariantViolation> {
        let d = engine
            .diamonds
            .get(diamond)
            .ok_or(InvariantViolation::UnknownDiamond)?;
        if holders.insert(diamond, at).is_some() {
            return Err(InvariantViolation::MultipleOwners { serial: d.serial });
        }
        Ok(())
    };
    for diamond in engine.start.iter() {
        claim(diamond, DiamondLocation::StartPoint)?;
    }
    for crane in &engine.cranes {
        if let Some(diamond) = crane.payload() {
            claim(diamond, DiamondLocation::Crane(crane.id))?;
        }
    }
    for scanner in &engine.scanners {
        if let Some(diamond) = scanner.held() {
            claim(diamond, DiamondLocation::Scanner(scanner.id))?;
        }
    }

    for (id, d) in &engine.diamonds {
        let holder = holders.get(id).copied();
        if holder != Some(d.location) {
            return Err(InvariantViolation::OwnerMismatch {
                serial: d.serial,
                recorded: d.location,
                holder,
            });
        }
    }

    let found = engine.diamonds.len() + engine.delivered();
    if found != engine.config.diamond_count as usize {
        return Err(InvariantViolation::DiamondCount {
            expected: engine.config.diamond_count,
            found,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// State diff types
// ---------------------------------------------------------------------------

/// Difference between two engines for one crane.
#[derive(Debug, Clone, PartialEq)]
pub struct CraneDiff {
    pub crane: CraneId,
    pub description: String,
}

/// Difference between two engines for one scanner.
#[derive(Debug, Clone, PartialEq)]
pub enum ScannerDiff {
    /// Scanner exists only in engine A.
    OnlyInA(ScannerId),
    /// Scanner exists only in engine B.
    OnlyInB(ScannerId),
    StateMismatch { scanner: ScannerId, description: String },
}

/// Per-subsystem match results.
#[derive(Debug, Clone, PartialEq)]
pub struct SubsystemDiff {
    pub clock_matches: bool,
    pub rail_matches: bool,
    pub cranes_match: bool,
    pub scanners_match: bool,
    pub start_matches: bool,
    pub boxes_match: bool,
    pub sim_state_matches: bool,
}

impl SubsystemDiff {
    pub fn all_match(&self) -> bool {
        self.clock_matches
            && self.rail_matches
            && self.cranes_match
            && self.scanners_match
            && self.start_matches
            && self.boxes_match
            && self.sim_state_matches
    }
}

/// Full state diff between two engines.
#[derive(Debug, Clone)]
pub struct StateDiff {
    pub is_identical: bool,
    pub subsystem_diffs: SubsystemDiff,
    pub crane_diffs: Vec<CraneDiff>,
    pub scanner_diffs: Vec<ScannerDiff>,
}

// ---------------------------------------------------------------------------
// Quick compare
// ---------------------------------------------------------------------------

/// Subsystem-level comparison without per-entity detail.
pub fn quick_compare(a: &Engine, b: &Engine) -> SubsystemDiff {
    let serials = |e: &Engine| -> Vec<u32> {
        e.start
            .iter()
            .filter_map(|d| e.diamonds.get(d))
            .map(|d| d.serial)
            .collect()
    };
    let (sa, sb) = (a.snapshot(), b.snapshot());
    SubsystemDiff {
        clock_matches: sa.time == sb.time,
        rail_matches: a.rail == b.rail,
        cranes_match: sa.cranes == sb.cranes,
        scanners_match: sa.scanners == sb.scanners,
        start_matches: serials(a) == serials(b),
        boxes_match: a.boxes == b.boxes,
        sim_state_matches: a.sim_state == b.sim_state,
    }
}

// ---------------------------------------------------------------------------
// Full diff
// ---------------------------------------------------------------------------

/// Compute a detailed diff between two engine states.
pub fn diff_engines(a: &Engine, b: &Engine) -> StateDiff {
    let subsystem_diffs = quick_compare(a, b);
    let (sa, sb) = (a.snapshot(), b.snapshot());

    let mut crane_diffs = Vec::new();
    for (ca, cb) in sa.cranes.iter().zip(&sb.cranes) {
        let mut mismatches = Vec::new();
        if ca.position != cb.position {
            mismatches.push("position");
        }
        if ca.phase != cb.phase {
            mismatches.push("phase");
        }
        if ca.hoist != cb.hoist {
            mismatches.push("hoist");
        }
        if ca.payload != cb.payload {
            mismatches.push("payload");
        }
        if ca.target != cb.target || ca.blocked != cb.blocked {
            mismatches.push("motion");
        }
        if !mismatches.is_empty() {
            crane_diffs.push(CraneDiff {
                crane: ca.id,
                description: mismatches.join(", "),
            });
        }
    }

    let mut scanner_diffs = Vec::new();
    for sa_scanner in &sa.scanners {
        let Some(sb_scanner) = sb.scanners.iter().find(|s| s.id == sa_scanner.id) else {
            scanner_diffs.push(ScannerDiff::OnlyInA(sa_scanner.id));
            continue;
        };
        let mut mismatches = Vec::new();
        if sa_scanner.position != sb_scanner.position {
            mismatches.push("position");
        }
        if sa_scanner.state != sb_scanner.state {
            mismatches.push("state");
        }
        if sa_scanner.held != sb_scanner.held {
            mismatches.push("held");
        }
        if sa_scanner.remaining != sb_scanner.remaining {
            mismatches.push("remaining");
        }
        if sa_scanner.scans_completed != sb_scanner.scans_completed {
            mismatches.push("scans_completed");
        }
        if !mismatches.is_empty() {
            scanner_diffs.push(ScannerDiff::StateMismatch {
                scanner: sa_scanner.id,
                description: mismatches.join(", "),
            });
        }
    }
    for sb_scanner in &sb.scanners {
        if !sa.scanners.iter().any(|s| s.id == sb_scanner.id) {
            scanner_diffs.push(ScannerDiff::OnlyInB(sb_scanner.id));
        }
    }

    let is_identical =
        crane_diffs.is_empty() && scanner_diffs.is_empty() && subsystem_diffs.all_match();

    StateDiff {
        is_identical,
        subsystem_diffs,
        crane_diffs,
        scanner_diffs,
    }
}

// ---------------------------------------------------------------------------
// Journal comparison
// ---------------------------------------------------------------------------

/// First point at which two journals disagree.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalDivergence {
    pub index: usize,
    /// `None` if journal A ended first.
    pub left: Option<Record>,
    /// `None` if journal B ended first.
    pub right: Option<Record>,
}

/// Compare two journals record by record.
pub fn diff_journals(a: &Journal, b: &Journal) -> Option<JournalDivergence> {
    let (ra, rb) = (a.records(), b.records());
    let len = ra.len().max(rb.len());
    (0..len).find_map(|index| {
        let (left, right) = (ra.get(index), rb.get(index));
        (left != right).then(|| JournalDivergence {
            index,
            left: left.cloned(),
            right: right.cloned(),
        })
    })
}

// ---------------------------------------------------------------------------
// Determinism validation
// ---------------------------------------------------------------------------

/// Result of a determinism validation run.
#[derive(Debug)]
pub struct DeterminismResult {
    /// Whether the two runs produced identical results.
    pub is_deterministic: bool,
    /// Dispatch count at which the state hashes first diverged.
    pub divergence_event: Option<u64>,
    /// First journal divergence, if any.
    pub journal_divergence: Option<JournalDivergence>,
    /// (dispatch, time, hash_a, hash_b) after each dispatch.
    pub hash_log: Vec<(u64, SimTime, u64, u64)>,
    pub finished_at: Option<SimTime>,
}

/// Run two engines built from `config` side by side for at most
/// `max_events` dispatches, comparing state hashes after every step.
pub fn validate_determinism(
    config: &SimConfig,
    max_events: u64,
) -> Result<DeterminismResult, SimError> {
    let mut engine_a = Engine::new(config.clone())?;
    let mut engine_b = Engine::new(config.clone())?;
    engine_a.start()?;
    engine_b.start()?;

    let mut hash_log = Vec::new();
    let mut divergence_event = None;

    for _ in 0..max_events {
        let oa = engine_a.skip()?;
        let ob = engine_b.skip()?;

        let hash_a = engine_a.state_hash();
        let hash_b = engine_b.state_hash();
        let n = engine_a.sim_state.dispatched;
        hash_log.push((n, engine_a.now(), hash_a, hash_b));

        if (hash_a != hash_b || oa != ob) && divergence_event.is_none() {
            divergence_event = Some(n);
        }
        if oa == StepOutcome::Finished && ob == StepOutcome::Finished {
            break;
        }
    }

    let journal_divergence = diff_journals(engine_a.journal(), engine_b.journal());
    Ok(DeterminismResult {
        is_deterministic: divergence_event.is_none() && journal_divergence.is_none(),
        divergence_event,
        journal_divergence,
        hash_log,
        finished_at: engine_a.sim_state.finished_at,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
