//! Read-only snapshot types for rendering and reporting.
//!
//! All types are owned copies with no references into engine storage, so a
//! renderer can hold a snapshot across engine steps.

use serde::{Deserialize, Serialize};

use crate::crane::{CranePhase, CraneRole, Hoist};
use crate::fixed::{Fixed64, SimTime};
use crate::id::{BoxId, CraneId, ScannerId};
use crate::rail::Interval;
use crate::scanner::ScannerState;
use crate::sim::RunStatus;

// ---------------------------------------------------------------------------
// Crane snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CraneSnapshot {
    pub id: CraneId,
    pub role: CraneRole,
    pub position: Fixed64,
    /// Destination of the current motion, if moving.
    pub target: Option<Fixed64>,
    pub phase: CranePhase,
    pub hoist: Hoist,
    /// Serial number of the carried diamond.
    pub payload: Option<u32>,
    /// Rail currently covered by the crane.
    pub occupied: Interval,
    /// Waiting on a denied rail request.
    pub blocked: bool,
}

// ---------------------------------------------------------------------------
// Scanner snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerSnapshot {
    pub id: ScannerId,
    pub position: Fixed64,
    pub state: ScannerState,
    /// Serial number of the held diamond.
    pub held: Option<u32>,
    /// Milliseconds until the current scan completes. Zero unless scanning.
    pub remaining: SimTime,
    pub scans_completed: u32,
}

// ---------------------------------------------------------------------------
// Whole-facility snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RailSnapshot {
    pub bounds: Interval,
    /// Occupied interval of each crane, blue first.
    pub occupied: [Interval; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub time: SimTime,
    pub status: RunStatus,
    pub paused: bool,
    pub cranes: [CraneSnapshot; 2],
    pub scanners: Vec<ScannerSnapshot>,
    pub rail: RailSnapshot,
    /// Diamonds still waiting at the Start Point.
    pub start_count: usize,
    /// Diamonds delivered to each box, indexed by box id.
    pub box_counts: Vec<usize>,
}

impl Snapshot {
    pub fn crane(&self, id: CraneId) -> &CraneSnapshot {
        &self.cranes[id.index()]
    }

    pub fn delivered(&self) -> usize {
        self.box_counts.iter().sum()
    }

    pub fn box_count(&self, id: BoxId) -> usize {
        self.box_counts.get(id.index()).copied().unwrap_or(0)
    }
}
