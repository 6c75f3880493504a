//! The shared 1-D rail and its interval reservations.
//!
//! Each crane occupies a footprint of width `clearance` centred on its
//! position. The rail is the only authority on crane positions: a crane is
//! either parked at a point or following a granted [`Motion`].
//!
//! # Reservations
//!
//! A parked crane reserves its footprint. A moving crane reserves the part
//! of its sweep it has not yet covered, from its current position to its
//! destination, widened by half the clearance on both sides. A reservation
//! only ever shrinks while a motion is in flight, so two reservations that
//! are disjoint when a move is granted stay disjoint until it completes.
//!
//! Intervals are half-open for overlap purposes: two cranes whose
//! footprints touch do not collide.

use serde::{Deserialize, Serialize};

use crate::fixed::{Fixed64, SimTime, lerp, travel_time};
use crate::id::CraneId;

// ---------------------------------------------------------------------------
// Interval
// ---------------------------------------------------------------------------

/// A closed stretch of rail `[lo, hi]` in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub lo: Fixed64,
    pub hi: Fixed64,
}

impl Interval {
    pub fn new(a: Fixed64, b: Fixed64) -> Self {
        Self {
            lo: a.min(b),
            hi: a.max(b),
        }
    }

    /// Footprint of width `2 * half` centred on `at`.
    pub fn around(at: Fixed64, half: Fixed64) -> Self {
        Self {
            lo: at - half,
            hi: at + half,
        }
    }

    /// Half-open overlap test; touching intervals do not overlap.
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.lo < other.hi && other.lo < self.hi
    }

    pub fn contains(&self, other: &Interval) -> bool {
        self.lo <= other.lo && other.hi <= self.hi
    }

    pub fn width(&self) -> Fixed64 {
        self.hi - self.lo
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.lo, self.hi)
    }
}

// ---------------------------------------------------------------------------
// Motion
// ---------------------------------------------------------------------------

/// A granted horizontal move. Position interpolates linearly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Motion {
    pub from: Fixed64,
    pub to: Fixed64,
    pub depart: SimTime,
    pub arrive: SimTime,
}

impl Motion {
    pub fn position_at(&self, now: SimTime) -> Fixed64 {
        lerp(
            self.from,
            self.to,
            now.saturating_sub(self.depart),
            self.arrive - self.depart,
        )
    }

    pub fn duration(&self) -> SimTime {
        self.arrive - self.depart
    }
}

/// What a crane is doing on the rail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Track {
    Parked(Fixed64),
    Moving(Motion),
}

// ---------------------------------------------------------------------------
// Errors and decisions
// ---------------------------------------------------------------------------

/// A broken rail invariant. Always a bug in the controller.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RailError {
    #[error("{crane} crane at {position} mm is outside the rail")]
    OutOfBounds { crane: CraneId, position: Fixed64 },
    #[error("{crane} crane requested a move while already moving")]
    AlreadyMoving { crane: CraneId },
    #[error("{crane} crane has no motion to complete")]
    NotMoving { crane: CraneId },
    #[error("{crane} crane completed its motion at {now} ms, before arrival at {arrive} ms")]
    EarlyArrival {
        crane: CraneId,
        now: SimTime,
        arrive: SimTime,
    },
    #[error("rail reservations overlap: blue {blue}, red {red}")]
    Overlap { blue: Interval, red: Interval },
}

/// Outcome of a rail request. Denial is a normal outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RailDecision {
    Granted(Motion),
    Denied {
        blocker: CraneId,
        /// When the blocker's reservation stops overlapping the request,
        /// if that happens during its current motion.
        retry_at: Option<SimTime>,
    },
}

// ---------------------------------------------------------------------------
// Rail
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rail {
    bounds: Interval,
    half_clearance: Fixed64,
    tracks: [Track; 2],
}

impl Rail {
    /// Build a rail with both cranes parked. Fails if either footprint is
    /// off the rail or the two overlap.
    pub fn new(
        bounds: Interval,
        clearance: Fixed64,
        blue_at: Fixed64,
        red_at: Fixed64,
    ) -> Result<Self, RailError> {
        let rail = Self {
            bounds,
            half_clearance: clearance / 2,
            tracks: [Track::Parked(blue_at), Track::Parked(red_at)],
        };
        rail.check(0)?;
        Ok(rail)
    }

    pub fn bounds(&self) -> Interval {
        self.bounds
    }

    pub fn clearance(&self) -> Fixed64 {
        self.half_clearance * 2
    }

    pub fn track(&self, crane: CraneId) -> Track {
        self.tracks[crane.index()]
    }

    pub fn motion(&self, crane: CraneId) -> Option<Motion> {
        match self.tracks[crane.index()] {
            Track::Moving(m) => Some(m),
            Track::Parked(_) => None,
        }
    }

    pub fn is_moving(&self, crane: CraneId) -> bool {
        self.motion(crane).is_some()
    }

    pub fn position(&self, crane: CraneId, now: SimTime) -> Fixed64 {
        match self.tracks[crane.index()] {
            Track::Parked(at) => at,
            Track::Moving(m) => m.position_at(now),
        }
    }

    /// The rail physically covered by the crane at `now`.
    pub fn footprint(&self, crane: CraneId, now: SimTime) -> Interval {
        Interval::around(self.position(crane, now), self.half_clearance)
    }

    /// Footprint while parked, remaining swept interval while moving.
    pub fn reservation(&self, crane: CraneId, now: SimTime) -> Interval {
        match self.tracks[crane.index()] {
            Track::Parked(at) => Interval::around(at, self.half_clearance),
            Track::Moving(m) => self.swept(m.position_at(now), m.to),
        }
    }

    fn swept(&self, from: Fixed64, to: Fixed64) -> Interval {
        let span = Interval::new(from, to);
        Interval {
            lo: span.lo - self.half_clearance,
            hi: span.hi + self.half_clearance,
        }
    }

    /// The interval a parked crane would sweep moving to `to`.
    pub fn sweep(&self, crane: CraneId, to: Fixed64, now: SimTime) -> Interval {
        self.swept(self.position(crane, now), to)
    }

    /// Whether a move of `crane` to `to` would be granted right now.
    pub fn can_move(&self, crane: CraneId, to: Fixed64, now: SimTime) -> bool {
        let sweep = self.sweep(crane, to, now);
        !sweep.overlaps(&self.reservation(crane.other(), now))
    }

    /// Ask for a move of `crane` to `to`. Granted only if the swept interval
    /// is disjoint from the other crane's reservation at `now`.
    pub fn request(
        &mut self,
        crane: CraneId,
        to: Fixed64,
        now: SimTime,
        speed: Fixed64,
    ) -> Result<RailDecision, RailError> {
        let Track::Parked(from) = self.tracks[crane.index()] else {
            return Err(RailError::AlreadyMoving { crane });
        };
        if !self
            .bounds
            .contains(&Interval::around(to, self.half_clearance))
        {
            return Err(RailError::OutOfBounds {
                crane,
                position: to,
            });
        }

        let blocker = crane.other();
        let sweep = self.swept(from, to);
        if sweep.overlaps(&self.reservation(blocker, now)) {
            return Ok(RailDecision::Denied {
                blocker,
                retry_at: self.clear_time(blocker, sweep, now),
            });
        }

        let motion = Motion {
            from,
            to,
            depart: now,
            arrive: now.saturating_add(travel_time(to - from, speed)),
        };
        self.tracks[crane.index()] = Track::Moving(motion);
        Ok(RailDecision::Granted(motion))
    }

    /// Finish the crane's motion, parking it at its destination.
    pub fn complete(&mut self, crane: CraneId, now: SimTime) -> Result<Fixed64, RailError> {
        let Track::Moving(m) = self.tracks[crane.index()] else {
            return Err(RailError::NotMoving { crane });
        };
        if now < m.arrive {
            return Err(RailError::EarlyArrival {
                crane,
                now,
                arrive: m.arrive,
            });
        }
        self.tracks[crane.index()] = Track::Parked(m.to);
        Ok(m.to)
    }

    /// Earliest time at or after `now` at which `crane`'s reservation no
    /// longer overlaps `interval`, provided that happens before its current
    /// motion ends. `None` if it is parked in the way or its destination
    /// overlaps `interval`.
    pub fn clear_time(&self, crane: CraneId, interval: Interval, now: SimTime) -> Option<SimTime> {
        let clear_at = |t: SimTime| !self.reservation(crane, t).overlaps(&interval);
        if clear_at(now) {
            return Some(now);
        }
        let m = self.motion(crane)?;
        if !clear_at(m.arrive) {
            return None;
        }
        // The reservation shrinks monotonically, so the cleared predicate
        // flips exactly once between now and arrival.
        let (mut lo, mut hi) = (now, m.arrive);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if clear_at(mid) {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Some(lo)
    }

    /// Check bounds and no-overlap at `now`.
    pub fn check(&self, now: SimTime) -> Result<(), RailError> {
        for crane in CraneId::ALL {
            let footprint = self.footprint(crane, now);
            if !self.bounds.contains(&footprint) {
                return Err(RailError::OutOfBounds {
                    crane,
                    position: self.position(crane, now),
                });
            }
        }
        let blue = self.reservation(CraneId::Blue, now);
        let red = self.reservation(CraneId::Red, now);
        if blue.overlaps(&red) || blue.lo > red.lo {
            return Err(RailError::Overlap { blue, red });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::f64_to_fixed64 as fx;

    const BLUE: CraneId = CraneId::Blue;
    const RED: CraneId = CraneId::Red;

    fn rail(blue: f64, red: f64) -> Rail {
        Rail::new(Interval::new(fx(0.0), fx(1_200.0)), fx(80.0), fx(blue), fx(red)).unwrap()
    }

    #[test]
    fn touching_intervals_do_not_overlap() {
        let a = Interval::new(fx(0.0), fx(10.0));
        let b = Interval::new(fx(10.0), fx(20.0));
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&Interval::new(fx(9.0), fx(20.0))));
    }

    #[test]
    fn new_rejects_overlapping_cranes() {
        let err = Rail::new(Interval::new(fx(0.0), fx(1_000.0)), fx(80.0), fx(500.0), fx(540.0));
        assert!(matches!(err, Err(RailError::Overlap { .. })));
    }

    #[test]
    fn new_rejects_crane_off_rail() {
        let err = Rail::new(Interval::new(fx(0.0), fx(1_000.0)), fx(80.0), fx(20.0), fx(500.0));
        assert!(matches!(err, Err(RailError::OutOfBounds { crane: BLUE, .. })));
    }

    #[test]
    fn grant_interpolates_position() {
        let mut r = rail(120.0, 1_000.0);
        let decision = r.request(BLUE, fx(453.0), 0, fx(333.0)).unwrap();
        let RailDecision::Granted(m) = decision else {
            panic!("expected grant, got {decision:?}");
        };
        assert_eq!(m.arrive, 1_000);
        assert_eq!(r.position(BLUE, 500), fx(286.5));
        assert_eq!(r.complete(BLUE, 1_000).unwrap(), fx(453.0));
        assert!(!r.is_moving(BLUE));
    }

    #[test]
    fn moving_reservation_shrinks() {
        let mut r = rail(120.0, 1_000.0);
        r.request(RED, fx(550.0), 0, fx(450.0)).unwrap();
        let start = r.reservation(RED, 0);
        let later = r.reservation(RED, 500);
        assert_eq!(start, Interval::new(fx(510.0), fx(1_040.0)));
        assert!(start.contains(&later));
        assert!(later.width() < start.width());
    }

    #[test]
    fn overlapping_request_is_denied() {
        let mut r = rail(120.0, 1_000.0);
        // Red heads for 550 first.
        assert!(matches!(
            r.request(RED, fx(550.0), 0, fx(333.0)).unwrap(),
            RailDecision::Granted(_)
        ));
        // Blue wants to pass through the same stretch.
        let d = r.request(BLUE, fx(600.0), 0, fx(333.0)).unwrap();
        assert_eq!(
            d,
            RailDecision::Denied {
                blocker: RED,
                retry_at: None
            }
        );
        assert!(!r.is_moving(BLUE));
    }

    #[test]
    fn touching_destination_is_granted() {
        let mut r = rail(120.0, 550.0);
        let d = r.request(BLUE, fx(470.0), 0, fx(333.0)).unwrap();
        assert!(matches!(d, RailDecision::Granted(_)));
        r.check(0).unwrap();
    }

    #[test]
    fn retry_time_when_blocker_moves_away() {
        let mut r = rail(470.0, 550.0);
        // Red leaves towards the boxes.
        r.request(RED, fx(1_000.0), 0, fx(450.0)).unwrap();
        // Blue wants Red's old spot.
        let d = r.request(BLUE, fx(550.0), 0, fx(333.0)).unwrap();
        let RailDecision::Denied {
            blocker: RED,
            retry_at: Some(t),
        } = d
        else {
            panic!("expected timed denial, got {d:?}");
        };
        // Red has to be 80 mm further right: 80 / 450 s.
        assert!(t > 0);
        assert!(r.can_move(BLUE, fx(550.0), t));
        assert!(!r.can_move(BLUE, fx(550.0), t - 1));
        assert_eq!(t, 178);
    }

    #[test]
    fn clear_time_none_when_parked_in_the_way() {
        let r = rail(120.0, 550.0);
        let sweep = r.sweep(BLUE, fx(600.0), 0);
        assert_eq!(r.clear_time(RED, sweep, 0), None);
    }

    #[test]
    fn request_while_moving_is_an_error() {
        let mut r = rail(120.0, 1_000.0);
        r.request(BLUE, fx(300.0), 0, fx(333.0)).unwrap();
        assert_eq!(
            r.request(BLUE, fx(400.0), 10, fx(333.0)),
            Err(RailError::AlreadyMoving { crane: BLUE })
        );
    }

    #[test]
    fn request_off_rail_is_an_error() {
        let mut r = rail(120.0, 1_000.0);
        assert!(matches!(
            r.request(RED, fx(1_190.0), 0, fx(333.0)),
            Err(RailError::OutOfBounds { crane: RED, .. })
        ));
    }

    #[test]
    fn early_completion_is_an_error() {
        let mut r = rail(120.0, 1_000.0);
        r.request(BLUE, fx(453.0), 0, fx(333.0)).unwrap();
        assert!(matches!(
            r.complete(BLUE, 999),
            Err(RailError::EarlyArrival { .. })
        ));
    }
}
