//! Scanner state machine: `Idle -> Scanning -> Done -> Idle`.
//!
//! A scanner holds a diamond for exactly the span of `Scanning` and `Done`.
//! Each transition is a method that checks the current state and returns a
//! [`ScannerFault`] when called from the wrong one.

use serde::{Deserialize, Serialize};

use crate::fixed::{Fixed64, SimTime};
use crate::id::{CraneId, DiamondId, ScannerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScannerState {
    Idle,
    Scanning,
    Done,
}

/// An illegal scanner transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScannerFault {
    #[error("{scanner} is {state:?} and cannot accept a diamond")]
    Occupied {
        scanner: ScannerId,
        state: ScannerState,
    },
    #[error("{scanner} cannot go from {from:?} to {to:?}")]
    Transition {
        scanner: ScannerId,
        from: ScannerState,
        to: ScannerState,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scanner {
    pub id: ScannerId,
    /// Rail position of the scanner's load point.
    pub position: Fixed64,
    pub scan_duration: SimTime,
    state: ScannerState,
    held: Option<DiamondId>,
    scan_started: SimTime,
    /// Start of the current idle span (or time the last scan completed
    /// while the scanner is `Done`).
    idle_since: SimTime,
    completed_at: SimTime,
    /// The unloader that has committed to empty this scanner.
    claimed_by: Option<CraneId>,
    scans_completed: u32,
}

impl Scanner {
    pub fn new(id: ScannerId, position: Fixed64, scan_duration: SimTime) -> Self {
        Self {
            id,
            position,
            scan_duration,
            state: ScannerState::Idle,
            held: None,
            scan_started: 0,
            idle_since: 0,
            completed_at: 0,
            claimed_by: None,
            scans_completed: 0,
        }
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == ScannerState::Idle
    }

    pub fn held(&self) -> Option<DiamondId> {
        self.held
    }

    pub fn idle_since(&self) -> SimTime {
        self.idle_since
    }

    pub fn scans_completed(&self) -> u32 {
        self.scans_completed
    }

    pub fn claimed_by(&self) -> Option<CraneId> {
        self.claimed_by
    }

    pub fn claim(&mut self, crane: CraneId) {
        self.claimed_by = Some(crane);
    }

    pub fn release_claim(&mut self) {
        self.claimed_by = None;
    }

    /// When the current scan finishes. Meaningful while `Scanning` or `Done`.
    pub fn completion_time(&self) -> SimTime {
        match self.state {
            ScannerState::Scanning => self.scan_started + self.scan_duration,
            ScannerState::Done => self.completed_at,
            ScannerState::Idle => self.idle_since,
        }
    }

    /// Estimated time the scanner is available: idle-since while idle,
    /// scan end while scanning, completion time while done.
    pub fn availability(&self) -> SimTime {
        match self.state {
            ScannerState::Idle => self.idle_since,
            ScannerState::Scanning | ScannerState::Done => self.completion_time(),
        }
    }

    pub fn remaining(&self, now: SimTime) -> SimTime {
        match self.state {
            ScannerState::Scanning => self.completion_time().saturating_sub(now),
            _ => 0,
        }
    }

    /// `Idle -> Scanning`. Takes ownership of `diamond` and returns the
    /// delay until the scan completes.
    pub fn begin_scan(&mut self, diamond: DiamondId, now: SimTime) -> Result<SimTime, ScannerFault> {
        if self.state != ScannerState::Idle || self.held.is_some() {
            return Err(ScannerFault::Occupied {
                scanner: self.id,
                state: self.state,
            });
        }
        self.state = ScannerState::Scanning;
        self.held = Some(diamond);
        self.scan_started = now;
        Ok(self.scan_duration)
    }

    /// `Scanning -> Done`. Returns the diamond to reveal.
    pub fn complete(&mut self, now: SimTime) -> Result<DiamondId, ScannerFault> {
        match (self.state, self.held) {
            (ScannerState::Scanning, Some(diamond)) => {
                self.state = ScannerState::Done;
                self.completed_at = now;
                self.scans_completed += 1;
                Ok(diamond)
            }
            _ => Err(ScannerFault::Transition {
                scanner: self.id,
                from: self.state,
                to: ScannerState::Done,
            }),
        }
    }

    /// `Done -> Idle`. Hands the diamond to the crane that removed it.
    pub fn remove(&mut self, now: SimTime) -> Result<DiamondId, ScannerFault> {
        match (self.state, self.held.take()) {
            (ScannerState::Done, Some(diamond)) => {
                self.state = ScannerState::Idle;
                self.idle_since = now;
                self.claimed_by = None;
                Ok(diamond)
            }
            (_, held) => {
                self.held = held;
                Err(ScannerFault::Transition {
                    scanner: self.id,
                    from: self.state,
                    to: ScannerState::Idle,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diamond::Diamond;
    use crate::fixed::f64_to_fixed64;
    use crate::id::BoxId;
    use slotmap::SlotMap;

    fn setup() -> (Scanner, DiamondId, DiamondId) {
        let mut diamonds: SlotMap<DiamondId, Diamond> = SlotMap::with_key();
        let a = diamonds.insert(Diamond::new(1, BoxId(0)));
        let b = diamonds.insert(Diamond::new(2, BoxId(0)));
        (
            Scanner::new(ScannerId(0), f64_to_fixed64(550.0), 18_000),
            a,
            b,
        )
    }

    #[test]
    fn full_cycle() {
        let (mut s, d, _) = setup();
        assert_eq!(s.begin_scan(d, 1_000), Ok(18_000));
        assert_eq!(s.state(), ScannerState::Scanning);
        assert_eq!(s.remaining(10_000), 9_000);
        assert_eq!(s.availability(), 19_000);

        assert_eq!(s.complete(19_000), Ok(d));
        assert_eq!(s.state(), ScannerState::Done);
        assert_eq!(s.held(), Some(d));
        assert_eq!(s.remaining(20_000), 0);

        assert_eq!(s.remove(21_500), Ok(d));
        assert!(s.is_idle());
        assert_eq!(s.held(), None);
        assert_eq!(s.idle_since(), 21_500);
        assert_eq!(s.scans_completed(), 1);
    }

    #[test]
    fn placing_into_busy_scanner_is_rejected() {
        let (mut s, a, b) = setup();
        s.begin_scan(a, 0).unwrap();
        assert_eq!(
            s.begin_scan(b, 10),
            Err(ScannerFault::Occupied {
                scanner: ScannerId(0),
                state: ScannerState::Scanning
            })
        );
        assert_eq!(s.held(), Some(a));

        s.complete(18_000).unwrap();
        assert!(matches!(
            s.begin_scan(b, 18_000),
            Err(ScannerFault::Occupied {
                state: ScannerState::Done,
                ..
            })
        ));
    }

    #[test]
    fn remove_before_done_is_rejected() {
        let (mut s, a, _) = setup();
        s.begin_scan(a, 0).unwrap();
        assert!(matches!(s.remove(5), Err(ScannerFault::Transition { .. })));
        assert_eq!(s.held(), Some(a), "failed removal keeps the diamond");
    }

    #[test]
    fn complete_while_idle_is_rejected() {
        let (mut s, _, _) = setup();
        assert!(s.complete(0).is_err());
    }

    #[test]
    fn removal_clears_claim() {
        let (mut s, a, _) = setup();
        s.begin_scan(a, 0).unwrap();
        s.claim(CraneId::Red);
        s.complete(18_000).unwrap();
        assert_eq!(s.claimed_by(), Some(CraneId::Red));
        s.remove(18_000).unwrap();
        assert_eq!(s.claimed_by(), None);
    }
}
