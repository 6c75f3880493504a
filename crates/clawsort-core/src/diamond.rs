//! Diamonds and the two passive containers at either end of the line: the
//! Start Point queue and the End Boxes.
//!
//! Ownership of a diamond is exclusive. The [`DiamondLocation`] stored on
//! the diamond must always agree with the container or entity that holds
//! its id; [`crate::validation`] checks this after every dispatch.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::id::{BoxId, CraneId, DiamondId, ScannerId};

// ---------------------------------------------------------------------------
// Diamond
// ---------------------------------------------------------------------------

/// Where a diamond currently is. Exactly one owner at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiamondLocation {
    StartPoint,
    Crane(CraneId),
    Scanner(ScannerId),
    EndBox(BoxId),
}

/// A single diamond travelling through the facility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diamond {
    /// Draw-order serial number, 1-based. Stable across runs with the same seed.
    pub serial: u32,
    pub location: DiamondLocation,
    /// The box this stone belongs in. Hidden until scanned.
    grade: BoxId,
    /// Set once by the scanner at scan completion.
    scan_result: Option<BoxId>,
}

impl Diamond {
    pub fn new(serial: u32, grade: BoxId) -> Self {
        Self {
            serial,
            location: DiamondLocation::StartPoint,
            grade,
            scan_result: None,
        }
    }

    pub fn scan_result(&self) -> Option<BoxId> {
        self.scan_result
    }

    pub fn is_scanned(&self) -> bool {
        self.scan_result.is_some()
    }

    /// Reveal the grade. Returns `false` if the diamond was already scanned;
    /// the result is never overwritten.
    pub fn reveal(&mut self) -> bool {
        if self.scan_result.is_some() {
            return false;
        }
        self.scan_result = Some(self.grade);
        true
    }
}

// ---------------------------------------------------------------------------
// Start Point
// ---------------------------------------------------------------------------

/// FIFO of unscanned diamonds waiting to be picked up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartPoint {
    queue: VecDeque<DiamondId>,
}

impl StartPoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diamond: DiamondId) {
        self.queue.push_back(diamond);
    }

    /// Remove the next diamond in draw order.
    pub fn draw(&mut self) -> Option<DiamondId> {
        self.queue.pop_front()
    }

    pub fn peek(&self) -> Option<DiamondId> {
        self.queue.front().copied()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn contains(&self, diamond: DiamondId) -> bool {
        self.queue.contains(&diamond)
    }

    pub fn iter(&self) -> impl Iterator<Item = DiamondId> + '_ {
        self.queue.iter().copied()
    }
}

// ---------------------------------------------------------------------------
// End boxes
// ---------------------------------------------------------------------------

/// A terminal sink for one scan-result category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndBox {
    pub id: BoxId,
    /// Serial numbers of the diamonds delivered here, in arrival order.
    delivered: Vec<u32>,
}

impl EndBox {
    pub fn new(id: BoxId) -> Self {
        Self {
            id,
            delivered: Vec::new(),
        }
    }

    pub fn deposit(&mut self, serial: u32) {
        self.delivered.push(serial);
    }

    pub fn count(&self) -> usize {
        self.delivered.len()
    }

    pub fn delivered(&self) -> &[u32] {
        &self.delivered
    }
}
